#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]

//! Per-segment ANN index: the engine itself plus the owning handle that
//! dispatches calls onto the worker pools.

mod engine;
mod persistence;
pub mod pool;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use vectra_core::{Error, Result};

pub use engine::{IndexConfig, IndexStats, IndexStatus, DEFAULT_BRUTE_THRESHOLD};
use engine::{Engine, SearchHit};

/// One scored hit, tagged with the id of the index that produced it.
#[derive(Debug, Clone, Copy)]
pub struct VidScore {
    pub vid: u64,
    pub score: f32,
    pub from: u64,
}

/// Owning handle around the engine.
///
/// `destroy` takes the write lock and drops the engine; every other
/// operation takes the read lock and fails with `IndexNotInitialized` once
/// the engine is gone. Search runs on the search pool, add/stats/dump on
/// the dynamic pool; `train` is only ever called inside the trainer
/// process and runs inline.
pub struct AnnIndex {
    slot: Arc<RwLock<Option<Engine>>>,
    work_dir: PathBuf,
    dim: usize,
    index_id: u64,
}

impl AnnIndex {
    pub fn open(work_dir: &Path, dim: usize, index_id: u64) -> Result<Self> {
        Self::open_with(work_dir, IndexConfig::new(dim), index_id)
    }

    pub fn open_with(work_dir: &Path, config: IndexConfig, index_id: u64) -> Result<Self> {
        let engine = Engine::open(work_dir, config, index_id)?;
        info!(index_id, dim = engine.dim(), work_dir = %work_dir.display(), "opened index");
        Ok(Self {
            dim: engine.dim(),
            slot: Arc::new(RwLock::new(Some(engine))),
            work_dir: work_dir.to_path_buf(),
            index_id,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn index_id(&self) -> u64 {
        self.index_id
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Append vectors with their ids; `vectors.len()` must equal
    /// `vids.len() * dim`.
    pub async fn add(&self, vectors: Vec<f32>, vids: Vec<u64>) -> Result<()> {
        let slot = self.slot.clone();
        pool::dynamic_pool()
            .submit(move || {
                let guard = slot.read();
                let engine = guard.as_ref().ok_or(Error::IndexNotInitialized)?;
                engine.add(&vectors, &vids)
            })
            .join()
            .await
    }

    /// Search one or more concatenated queries; returns one score-descending
    /// list per query, each at most `topk` long.
    pub async fn search(
        &self,
        queries: Arc<Vec<f32>>,
        topk: usize,
        nprobe: usize,
        reorder: usize,
    ) -> Result<Vec<Vec<VidScore>>> {
        let slot = self.slot.clone();
        let dim = self.dim;
        let index_id = self.index_id;
        pool::search_pool()
            .submit(move || {
                let guard = slot.read();
                let engine = guard.as_ref().ok_or(Error::IndexNotInitialized)?;
                let buffer = engine.search(&queries, topk, nprobe, reorder)?;
                Ok(split_results(&buffer, queries.len() / dim, topk, index_id))
            })
            .join()
            .await
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        let slot = self.slot.clone();
        pool::dynamic_pool()
            .submit(move || {
                let guard = slot.read();
                let engine = guard.as_ref().ok_or(Error::IndexNotInitialized)?;
                Ok(engine.stats())
            })
            .join()
            .await
    }

    /// Cheap synchronous stats read; used for searchability checks where a
    /// pool round-trip is not warranted.
    pub fn stats_now(&self) -> Result<IndexStats> {
        let guard = self.slot.read();
        let engine = guard.as_ref().ok_or(Error::IndexNotInitialized)?;
        Ok(engine.stats())
    }

    pub fn searchable(&self) -> bool {
        self.slot
            .read()
            .as_ref()
            .is_some_and(Engine::searchable)
    }

    /// Train the partition structure over the current dataset and dump the
    /// result. `n_threads == 0` uses all cores.
    pub fn train(&self, n_threads: usize) -> Result<()> {
        let guard = self.slot.read();
        let engine = guard.as_ref().ok_or(Error::IndexNotInitialized)?;
        engine.train(n_threads)
    }

    pub async fn dump(&self) -> Result<()> {
        let slot = self.slot.clone();
        pool::dynamic_pool()
            .submit(move || {
                let guard = slot.read();
                let engine = guard.as_ref().ok_or(Error::IndexNotInitialized)?;
                engine.dump()
            })
            .join()
            .await
    }

    /// Drop the engine; drains readers first. Idempotent.
    pub fn destroy(&self) {
        let mut guard = self.slot.write();
        if guard.take().is_some() {
            info!(index_id = self.index_id, "destroyed index");
        }
    }
}

fn split_results(
    buffer: &[SearchHit],
    nq: usize,
    topk: usize,
    index_id: u64,
) -> Vec<Vec<VidScore>> {
    let mut results = Vec::with_capacity(nq);
    for qi in 0..nq {
        let mut list = Vec::new();
        for hit in &buffer[qi * topk..(qi + 1) * topk] {
            // A negative score marks the end of this query's list.
            if hit.score < 0.0 {
                break;
            }
            list.push(VidScore {
                vid: hit.vid,
                score: hit.score,
                from: index_id,
            });
        }
        results.push(list);
    }
    results
}
