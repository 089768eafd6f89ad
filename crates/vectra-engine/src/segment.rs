//! Segments: the unit of storage and indexing.
//!
//! A segment binds its config, an index handle and the metadata store, and
//! owns one directory on disk. It accepts writes until sealed and serves
//! searches for its whole life; training runs out of process and ends with
//! an atomic handle swap.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use vectra_core::{
    encode_vector_id, AddDocumentRequest, DocumentHit, Error, QueryOptions, Result,
};
use vectra_index::{AnnIndex, IndexStats, VidScore};

use crate::metadata::{DocRecord, MetadataStore};
use crate::training;

pub const CONFIG_FILE: &str = "config.bin";
pub const METADATA_FILE: &str = "metadata.bin";

/// Persisted per-segment config. The work dir is stored for diagnostics but
/// overwritten with the actual path on load, since data dirs move.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    pub segment_id: u64,
    pub work_dir: PathBuf,
    pub dim: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentStats {
    pub segment_id: u64,
    pub sealed: bool,
    pub dim: usize,
    pub index: IndexStats,
    pub vector_count: u64,
    pub doc_count: u64,
}

pub struct Segment {
    segment_id: u64,
    work_dir: PathBuf,
    dim: AtomicUsize,
    sealed: AtomicBool,
    has_new_index: AtomicBool,
    is_training: AtomicBool,
    index: ArcSwapOption<AnnIndex>,
    metadata: MetadataStore,
}

impl Segment {
    /// Create a segment. With `dim > 0` the index handle is opened (and its
    /// directory scaffolding created) immediately; with `dim == 0` the
    /// segment is a shell that `load` fills from the persisted config.
    pub fn create(segment_id: u64, work_dir: PathBuf, dim: usize) -> Result<Arc<Self>> {
        let index = if dim > 0 {
            Some(Arc::new(AnnIndex::open(&work_dir, dim, segment_id)?))
        } else {
            None
        };
        let segment = Arc::new(Self {
            segment_id,
            work_dir,
            dim: AtomicUsize::new(dim),
            sealed: AtomicBool::new(false),
            has_new_index: AtomicBool::new(false),
            is_training: AtomicBool::new(false),
            index: ArcSwapOption::from(index),
            metadata: MetadataStore::new(),
        });
        if dim > 0 {
            segment.dump_config()?;
        }
        Ok(segment)
    }

    pub fn id(&self) -> u64 {
        self.segment_id
    }

    pub fn dim(&self) -> usize {
        self.dim.load(Ordering::SeqCst)
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Monotonic: a sealed segment never reopens for writes.
    pub fn seal(&self) {
        if !self.sealed.swap(true, Ordering::SeqCst) {
            info!(segment_id = self.segment_id, "sealed segment");
        }
    }

    pub fn index_handle(&self) -> Option<Arc<AnnIndex>> {
        self.index.load_full()
    }

    pub fn doc_count(&self) -> u64 {
        self.metadata.len() as u64
    }

    pub async fn add_document(&self, doc: &AddDocumentRequest) -> Result<()> {
        self.add_documents(std::slice::from_ref(doc)).await
    }

    pub async fn batch_add_documents(&self, docs: &[AddDocumentRequest]) -> Result<()> {
        self.add_documents(docs).await
    }

    /// Append metadata records and hand the accumulated vectors to the
    /// index in one call. A vid that fails to encode is logged and skipped;
    /// the document record stays so metadata lookups keep working.
    async fn add_documents(&self, docs: &[AddDocumentRequest]) -> Result<()> {
        let index = self.index.load_full().ok_or(Error::IndexMissing)?;
        let mut vectors = Vec::new();
        let mut vids = Vec::new();

        for doc in docs {
            let data = serde_json::to_vec(&doc.metadata)?;
            let doc_id = self.metadata.push(DocRecord {
                vqid: doc.vqid.clone(),
                data,
            }) as u64;

            for (i, vector) in doc.vectors.iter().enumerate() {
                let tag = doc.vectors_tag.get(i).copied().unwrap_or(i as u64);
                match encode_vector_id(doc_id, tag) {
                    Ok(vid) => {
                        vids.push(vid);
                        vectors.extend_from_slice(vector);
                    }
                    Err(e) => {
                        error!(doc_id, tag, "failed to encode vector id: {e}");
                    }
                }
            }
        }

        if vids.is_empty() {
            return Ok(());
        }
        index.add(vectors, vids).await
    }

    pub fn delete_document(&self, vqid: &str) -> usize {
        self.metadata.delete_by_vqid(vqid)
    }

    pub fn update_document_metadata(&self, vqid: &str, metadata: &Value) -> Result<usize> {
        let data = serde_json::to_vec(metadata)?;
        Ok(self.metadata.update_by_vqid(vqid, &data))
    }

    pub fn get_document_metadata(&self, vqid: &str, check_duplicate: bool) -> Vec<DocumentHit> {
        self.metadata
            .get_by_vqid(vqid, check_duplicate)
            .into_iter()
            .map(|record| DocumentHit {
                vqid: record.vqid,
                metadata: serde_json::from_slice(&record.data).unwrap_or(Value::Null),
            })
            .collect()
    }

    /// Resolve a docId to its live record; `None` when deleted or unknown.
    pub fn metadata_record(&self, doc_id: usize) -> Option<DocRecord> {
        self.metadata.get(doc_id)
    }

    pub async fn search(
        &self,
        queries: Arc<Vec<f32>>,
        opts: &QueryOptions,
    ) -> Result<Vec<Vec<VidScore>>> {
        let index = self.index.load_full().ok_or(Error::IndexMissing)?;
        index
            .search(queries, opts.top_k, opts.nprobe, opts.reorder)
            .await
    }

    pub fn is_searchable(&self) -> bool {
        self.index
            .load()
            .as_ref()
            .is_some_and(|index| index.searchable())
    }

    pub async fn stats(&self) -> Result<SegmentStats> {
        let index = self.index.load_full().ok_or(Error::IndexMissing)?;
        Ok(self.compose_stats(index.stats().await?))
    }

    /// Synchronous stats read for hot paths like write admission.
    pub fn stats_now(&self) -> Result<SegmentStats> {
        let index = self.index.load_full().ok_or(Error::IndexMissing)?;
        Ok(self.compose_stats(index.stats_now()?))
    }

    fn compose_stats(&self, index_stats: IndexStats) -> SegmentStats {
        SegmentStats {
            segment_id: self.segment_id,
            sealed: self.sealed(),
            dim: self.dim(),
            vector_count: index_stats.vid_size,
            doc_count: self.doc_count(),
            index: index_stats,
        }
    }

    pub fn dump_config(&self) -> Result<()> {
        std::fs::create_dir_all(&self.work_dir)?;
        let config = SegmentConfig {
            segment_id: self.segment_id,
            work_dir: self.work_dir.clone(),
            dim: self.dim(),
        };
        let encoded = bincode::serialize(&config).map_err(Error::from)?;
        std::fs::write(self.work_dir.join(CONFIG_FILE), encoded)?;
        Ok(())
    }

    pub fn dump_metadata(&self) -> Result<()> {
        std::fs::create_dir_all(&self.work_dir)?;
        self.metadata.save(&self.work_dir.join(METADATA_FILE))
    }

    pub async fn dump_index(&self) -> Result<()> {
        let index = self.index.load_full().ok_or(Error::IndexMissing)?;
        index.dump().await
    }

    pub async fn dump(&self) -> Result<()> {
        self.dump_config()?;
        self.dump_metadata()?;
        self.dump_index().await
    }

    /// Load the persisted segment: config (correcting a stale work dir),
    /// then the index handle, then metadata.
    pub fn load(&self) -> Result<()> {
        let raw = std::fs::read(self.work_dir.join(CONFIG_FILE))?;
        // The persisted work dir goes stale when the data dir moves; the
        // directory this segment was opened against wins.
        let config: SegmentConfig = bincode::deserialize(&raw).map_err(Error::from)?;
        if config.dim == 0 {
            return Err(Error::Corrupt(format!(
                "segment {} config has zero dim",
                self.segment_id
            )));
        }
        self.dim.store(config.dim, Ordering::SeqCst);
        self.load_index()?;

        let metadata_path = self.work_dir.join(METADATA_FILE);
        if metadata_path.exists() {
            self.metadata.load(&metadata_path)?;
        } else {
            warn!(
                segment_id = self.segment_id,
                "segment has no metadata file, starting empty"
            );
        }
        Ok(())
    }

    /// Build a fresh handle against the work dir and swap it in. The new
    /// handle is installed before the old one is destroyed, so searches
    /// observe either the old or the new index, never a null handle.
    pub fn load_index(&self) -> Result<()> {
        let new = Arc::new(AnnIndex::open(&self.work_dir, self.dim(), self.segment_id)?);
        let old = self.index.swap(Some(new));
        if let Some(old) = old {
            old.destroy();
        }
        Ok(())
    }

    /// Train this segment's index in a child process: the trainer loads
    /// the persisted segment, trains and dumps, then exits. The child gets
    /// a parent-death signal so an orphaned trainer cannot outlive us.
    pub async fn train(&self, n_threads: usize) -> Result<()> {
        if self
            .is_training
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyTraining);
        }
        let result = self.train_inner(n_threads).await;
        self.is_training.store(false, Ordering::SeqCst);
        result
    }

    async fn train_inner(&self, n_threads: usize) -> Result<()> {
        // The child rebuilds the segment from disk, so config, metadata and
        // the current dataset all have to be persisted first.
        self.dump().await?;

        let exe = training::trainer_exe()?;
        info!(
            segment_id = self.segment_id,
            trainer = %exe.display(),
            "spawning trainer"
        );
        let mut command = tokio::process::Command::new(exe);
        command
            .arg("train")
            .arg("--segment-dir")
            .arg(&self.work_dir)
            .arg("--threads")
            .arg(n_threads.to_string());
        #[cfg(target_os = "linux")]
        unsafe {
            command.pre_exec(|| {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong);
                Ok(())
            });
        }

        let status = command.status().await?;
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            error!(segment_id = self.segment_id, code, "trainer failed");
            return Err(Error::TrainFailed(code));
        }

        self.has_new_index.store(true, Ordering::SeqCst);
        self.load_index()?;
        self.has_new_index.store(false, Ordering::SeqCst);
        info!(segment_id = self.segment_id, "trainer finished, index reloaded");
        Ok(())
    }

    pub fn is_training(&self) -> bool {
        self.is_training.load(Ordering::SeqCst)
    }

    pub fn has_new_index(&self) -> bool {
        self.has_new_index.load(Ordering::SeqCst)
    }

    /// Destroy the index handle; metadata and on-disk files remain.
    pub fn drop_index(&self) {
        if let Some(index) = self.index.load_full() {
            index.destroy();
        }
    }

    /// Remove the segment from disk and destroy its index.
    pub fn destroy(&self) -> Result<()> {
        if self.work_dir.exists() {
            std::fs::remove_dir_all(&self.work_dir)?;
        }
        self.drop_index();
        Ok(())
    }
}
