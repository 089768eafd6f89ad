//! Collections: ordered segments, write admission, fan-out search.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use vectra_core::{
    decode_vector_id, AddDocumentRequest, DocumentHit, Error, QueryOptions, Result, SearchResult,
};
use vectra_index::VidScore;

use crate::hardware;
use crate::segment::{Segment, SegmentStats};

/// Segments are loaded in parallel, but never more than this many at once.
const LOAD_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
    pub name: String,
    pub segments: Vec<SegmentStats>,
    pub segment_count: u64,
    pub total_index_size: u64,
    pub vector_count: u64,
    pub doc_count: u64,
}

pub struct Collection {
    name: String,
    work_dir: PathBuf,
    dim: AtomicUsize,
    max_segment_id: AtomicU64,
    segments: RwLock<Vec<Arc<Segment>>>,
    /// Serializes writes: callers see a single-writer view per collection.
    write_lock: tokio::sync::Mutex<()>,
    segment_vector_max_size: u64,
}

impl Collection {
    /// Create a collection. With `dim > 0` the directory is created (it
    /// must not already exist) along with segment 0; with `dim == 0` the
    /// collection is a shell for `load`.
    pub fn create(
        name: &str,
        dim: usize,
        work_dir: PathBuf,
        segment_vector_max_size: u64,
    ) -> Result<Arc<Self>> {
        if dim > 0 {
            if work_dir.is_dir() {
                return Err(Error::AlreadyExists(format!(
                    "collection dir {} already exists",
                    work_dir.display()
                )));
            }
            std::fs::create_dir_all(&work_dir)?;
        }

        let collection = Arc::new(Self {
            name: name.to_string(),
            work_dir,
            dim: AtomicUsize::new(dim),
            max_segment_id: AtomicU64::new(0),
            segments: RwLock::new(Vec::new()),
            write_lock: tokio::sync::Mutex::new(()),
            segment_vector_max_size,
        });
        if dim > 0 {
            collection.add_new_segment()?;
        }
        Ok(collection)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dim(&self) -> usize {
        self.dim.load(Ordering::SeqCst)
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn max_segment_id(&self) -> u64 {
        self.max_segment_id.load(Ordering::SeqCst)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    pub fn segments_snapshot(&self) -> Vec<Arc<Segment>> {
        self.segments.read().clone()
    }

    /// Open the next segment at `max_segment_id`.
    pub fn add_new_segment(&self) -> Result<Arc<Segment>> {
        let id = self.max_segment_id.fetch_add(1, Ordering::SeqCst);
        let work_dir = self.work_dir.join(format!("segment_{id}"));
        let segment = Segment::create(id, work_dir, self.dim())?;
        self.segments.write().push(segment.clone());
        info!(collection = %self.name, segment_id = id, "created segment");
        Ok(segment)
    }

    /// The tail segment while it has room; otherwise seal it and open a
    /// fresh one. The caller must hold the write lock.
    fn insertable_segment(&self) -> Result<Arc<Segment>> {
        let tail = self.segments.read().last().cloned();
        let Some(tail) = tail else {
            return self.add_new_segment();
        };
        let stats = tail.stats_now()?;
        if stats.vector_count < self.segment_vector_max_size {
            return Ok(tail);
        }
        tail.seal();
        self.add_new_segment()
    }

    fn check_vectors(&self, doc: &AddDocumentRequest) -> Result<()> {
        if doc.vqid.is_empty() {
            return Err(Error::InvalidInput("vqid is empty".into()));
        }
        if doc.vectors.is_empty() {
            return Err(Error::InvalidInput("vectors is empty".into()));
        }
        let dim = self.dim();
        for vector in &doc.vectors {
            if vector.len() != dim {
                return Err(Error::InvalidInput(format!(
                    "vector dimension mismatch: expected {dim}, got {}",
                    vector.len()
                )));
            }
        }
        Ok(())
    }

    pub async fn add_document(&self, doc: &AddDocumentRequest) -> Result<()> {
        self.check_vectors(doc)?;
        let _guard = self.write_lock.lock().await;
        let segment = self.insertable_segment()?;
        segment.add_document(doc).await
    }

    pub async fn batch_add_documents(&self, docs: &[AddDocumentRequest]) -> Result<()> {
        if docs.is_empty() {
            return Err(Error::InvalidInput("documents is empty".into()));
        }
        for doc in docs {
            self.check_vectors(doc)?;
        }
        let _guard = self.write_lock.lock().await;
        let segment = self.insertable_segment()?;
        segment.batch_add_documents(docs).await
    }

    /// Fan out to every searchable segment, merge score-descending, resolve
    /// survivors against segment metadata. Tombstoned documents are
    /// filtered here rather than in the index.
    pub async fn search(
        &self,
        flat_queries: Vec<f32>,
        opts: &QueryOptions,
    ) -> Result<Vec<Vec<SearchResult>>> {
        let dim = self.dim();
        if dim == 0 || flat_queries.is_empty() || flat_queries.len() % dim != 0 {
            return Err(Error::InvalidInput("bad query vector buffer".into()));
        }
        let nq = flat_queries.len() / dim;

        let searchable: Vec<Arc<Segment>> = self
            .segments
            .read()
            .iter()
            .filter(|s| s.is_searchable())
            .cloned()
            .collect();
        if searchable.is_empty() {
            return Err(Error::IndexUnavailable);
        }

        let queries = Arc::new(flat_queries);
        let tasks = searchable.iter().map(|segment| {
            let segment = segment.clone();
            let queries = queries.clone();
            let opts = opts.clone();
            async move { segment.search(queries, &opts).await }
        });

        let joined = tokio::time::timeout(
            Duration::from_secs(opts.timeout_secs),
            futures::future::join_all(tasks),
        )
        .await
        .map_err(|_| Error::Timeout)?;

        let mut partials: Vec<Vec<Vec<VidScore>>> = Vec::with_capacity(joined.len());
        for result in joined {
            partials.push(result?);
        }
        if partials.is_empty() {
            return Err(Error::IndexUnavailable);
        }

        let mut merged: Vec<Vec<VidScore>> = vec![Vec::new(); nq];
        for partial in &partials {
            for (i, list) in partial.iter().enumerate() {
                merged[i].extend_from_slice(list);
            }
        }
        for list in &mut merged {
            list.sort_unstable_by(|a, b| b.score.total_cmp(&a.score));
            if opts.top_k > 0 {
                list.truncate(opts.top_k);
            }
        }

        let by_id: HashMap<u64, &Arc<Segment>> =
            searchable.iter().map(|s| (s.id(), s)).collect();
        let mut results = vec![Vec::new(); nq];
        for (i, list) in merged.iter().enumerate() {
            for hit in list {
                let Some(segment) = by_id.get(&hit.from) else {
                    warn!(from = hit.from, "search hit from unknown segment");
                    continue;
                };
                let (doc_id, tag) = decode_vector_id(hit.vid);
                let Some(record) = segment.metadata_record(doc_id as usize) else {
                    // Deleted: a tombstoned slot hides the hit.
                    continue;
                };
                let metadata = serde_json::from_slice(&record.data).unwrap_or(Value::Null);
                results[i].push(SearchResult {
                    vqid: record.vqid,
                    score: hit.score,
                    metadata,
                    tag,
                });
            }
        }
        Ok(results)
    }

    /// A vqid may live in several segments; every live match everywhere is
    /// removed and the total count returned.
    pub fn delete_document(&self, vqid: &str) -> usize {
        self.segments
            .read()
            .iter()
            .map(|s| s.delete_document(vqid))
            .sum()
    }

    pub fn update_document_metadata(&self, vqid: &str, metadata: &Value) -> Result<usize> {
        let mut count = 0;
        for segment in self.segments.read().iter() {
            count += segment.update_document_metadata(vqid, metadata)?;
        }
        Ok(count)
    }

    pub fn get_document_metadata(&self, vqid: &str, check_duplicate: bool) -> Vec<DocumentHit> {
        let mut hits = Vec::new();
        for segment in self.segments_snapshot() {
            hits.extend(segment.get_document_metadata(vqid, check_duplicate));
            if !check_duplicate && !hits.is_empty() {
                break;
            }
        }
        hits
    }

    pub async fn stats(&self) -> Result<CollectionStats> {
        let mut stats = CollectionStats {
            name: self.name.clone(),
            segments: Vec::new(),
            segment_count: 0,
            total_index_size: 0,
            vector_count: 0,
            doc_count: 0,
        };
        for segment in self.segments_snapshot() {
            let segment_stats = segment.stats().await?;
            stats.segment_count += 1;
            stats.total_index_size += segment_stats.index.index_size;
            stats.vector_count += segment_stats.vector_count;
            stats.doc_count += segment_stats.doc_count;
            stats.segments.push(segment_stats);
        }
        Ok(stats)
    }

    /// Train every untrained segment in order; the available-memory check
    /// guards the trainer's peak allocation unless the caller waives it.
    /// Holds the write lock so the dataset the trainer reads from disk
    /// cannot drift behind in-memory writes; searches are unaffected.
    pub async fn train(&self, n_threads: usize, ignore_check: bool) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        for segment in self.segments_snapshot() {
            let stats = segment.stats().await?;
            let untrained =
                stats.index.vid_size > 0 && stats.index.index_size < stats.index.vid_size;
            if !untrained {
                continue;
            }
            if !ignore_check {
                let required = estimated_train_memory(stats.index.vid_size, stats.dim as u64);
                let available = hardware::available_memory();
                if available < required {
                    return Err(Error::InsufficientMemory {
                        required,
                        available,
                    });
                }
            }
            segment.train(n_threads).await?;
        }
        Ok(())
    }

    pub async fn dump(&self) -> Result<()> {
        for segment in self.segments_snapshot() {
            segment.dump().await?;
        }
        Ok(())
    }

    pub fn dump_metadata(&self) -> Result<()> {
        for segment in self.segments_snapshot() {
            segment.dump_config()?;
            segment.dump_metadata()?;
        }
        Ok(())
    }

    pub async fn dump_index(&self) -> Result<()> {
        for segment in self.segments_snapshot() {
            segment.dump_index().await?;
        }
        Ok(())
    }

    /// Destroy every segment's index handle; metadata and files remain.
    pub fn drop_index(&self) {
        for segment in self.segments_snapshot() {
            segment.drop_index();
        }
    }

    /// Destroy every segment and remove the collection's directory.
    pub fn destroy(&self) -> Result<()> {
        for segment in self.segments_snapshot() {
            segment.destroy()?;
        }
        if self.work_dir.exists() {
            std::fs::remove_dir_all(&self.work_dir)?;
        }
        Ok(())
    }

    /// Enumerate `segment_<id>` dirs ascending and load them with bounded
    /// parallelism; any segment error aborts the whole load.
    pub async fn load(&self) -> Result<()> {
        let mut entries: Vec<(u64, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&self.work_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = parse_segment_dir_name(&name.to_string_lossy()) else {
                continue;
            };
            entries.push((id, entry.path()));
        }
        entries.sort_by_key(|(id, _)| *id);

        let mut segments = Vec::with_capacity(entries.len());
        for (id, path) in &entries {
            segments.push(Segment::create(*id, path.clone(), 0)?);
        }

        let mut loads = futures::stream::iter(segments.iter().cloned().map(|segment| {
            tokio::task::spawn_blocking(move || segment.load())
        }))
        .buffer_unordered(LOAD_CONCURRENCY);
        while let Some(joined) = loads.next().await {
            joined.map_err(|e| Error::Canceled(e.to_string()))??;
        }
        drop(loads);

        if let (Some(first), Some(last)) = (segments.first(), segments.last()) {
            self.dim.store(first.dim(), Ordering::SeqCst);
            self.max_segment_id.store(last.id() + 1, Ordering::SeqCst);
        }
        let count = segments.len();
        *self.segments.write() = segments;
        info!(collection = %self.name, segments = count, "loaded collection");
        Ok(())
    }

    /// Reload only the tail segment (after an out-of-band dump).
    pub async fn load_last_segment(&self) -> Result<()> {
        let max_id = self.max_segment_id.load(Ordering::SeqCst);
        if max_id == 0 {
            return Err(Error::NotFound("collection has no segments".into()));
        }
        let id = max_id - 1;
        let work_dir = self.work_dir.join(format!("segment_{id}"));
        let segment = Segment::create(id, work_dir, 0)?;
        let loaded = segment.clone();
        tokio::task::spawn_blocking(move || loaded.load())
            .await
            .map_err(|e| Error::Canceled(e.to_string()))??;

        let mut segments = self.segments.write();
        match segments.iter_mut().find(|s| s.id() == id) {
            Some(slot) => *slot = segment,
            None => segments.push(segment),
        }
        Ok(())
    }
}

pub(crate) fn estimated_train_memory(vid_size: u64, dim: u64) -> u64 {
    vid_size * dim * 4 * 3 / 2
}

fn parse_segment_dir_name(name: &str) -> Option<u64> {
    name.strip_prefix("segment_")?.parse().ok()
}
