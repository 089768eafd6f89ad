#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod types;
pub mod vecid;

pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use types::{
    AddDocumentRequest, BatchAddDocumentsRequest, DocumentHit, QueryOptions, SearchResult,
    TrainRequest, UpdateDocumentMetadataRequest,
};
pub use vecid::{decode_vector_id, encode_vector_id};
