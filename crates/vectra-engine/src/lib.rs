#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

//! The storage/query engine: collections of append-only segments, each
//! with its own ANN index, behind a process-wide registry.

pub mod collection;
pub mod hardware;
pub mod metadata;
pub mod registry;
pub mod segment;
pub mod training;

pub use collection::{Collection, CollectionStats};
pub use metadata::{DocRecord, MetadataStore};
pub use registry::{EngineStats, Registry};
pub use segment::{Segment, SegmentConfig, SegmentStats};
