//! Process-wide registry: name → collection, plus the operation facade the
//! HTTP layer calls. Built once in `main` and injected into handlers.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{error, info, warn};

use vectra_core::{
    AddDocumentRequest, BatchAddDocumentsRequest, DocumentHit, Error, QueryOptions, Result,
    SearchResult, ServiceConfig, TrainRequest, UpdateDocumentMetadataRequest,
};

use crate::collection::{Collection, CollectionStats};

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub collections: Vec<CollectionStats>,
    pub collection_count: u64,
    pub total_index_size: u64,
}

pub struct Registry {
    data_path: PathBuf,
    segment_vector_max_size: u64,
    collections: DashMap<String, Arc<Collection>>,
    /// Names with a background load in flight, so a storm of searches
    /// against a cold collection starts exactly one load.
    loading: DashMap<String, ()>,
}

impl Registry {
    pub fn new(config: &ServiceConfig) -> Arc<Self> {
        Arc::new(Self {
            data_path: config.data_path.clone(),
            segment_vector_max_size: config.segment_vector_max_size,
            collections: DashMap::new(),
            loading: DashMap::new(),
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Collection>> {
        self.collections.get(name).map(|c| c.value().clone())
    }

    fn require(&self, name: &str) -> Result<Arc<Collection>> {
        self.get(name)
            .ok_or_else(|| Error::NotFound(format!("collection [{name}]")))
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Scan the data path and load every collection directory.
    pub async fn load_all(&self) -> Result<()> {
        if !self.data_path.exists() {
            std::fs::create_dir_all(&self.data_path)?;
        }
        for entry in std::fs::read_dir(&self.data_path)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            // A broken collection dir should not take the whole service
            // down with it.
            match self.load_from_disk(&name).await {
                Ok(()) => info!(collection = %name, "loaded collection"),
                Err(e) => error!(collection = %name, "failed to load collection: {e}"),
            }
        }
        Ok(())
    }

    async fn load_from_disk(&self, name: &str) -> Result<()> {
        let collection = Collection::create(
            name,
            0,
            self.data_path.join(name),
            self.segment_vector_max_size,
        )?;
        collection.load().await?;
        self.collections.insert(name.to_string(), collection);
        Ok(())
    }

    pub fn create_collection(&self, name: &str, dim: i64) -> Result<Arc<Collection>> {
        if name.is_empty() {
            return Err(Error::InvalidInput("collection name is empty".into()));
        }
        if dim <= 0 {
            return Err(Error::InvalidInput("dim must be greater than 0".into()));
        }
        if self.collections.contains_key(name) {
            return Err(Error::AlreadyExists(format!("collection [{name}]")));
        }
        let collection = Collection::create(
            name,
            dim as usize,
            self.data_path.join(name),
            self.segment_vector_max_size,
        )?;
        self.collections
            .insert(name.to_string(), collection.clone());
        info!(collection = name, dim, "created collection");
        Ok(collection)
    }

    pub fn drop_collection(&self, name: &str) -> Result<()> {
        let collection = self.require(name)?;
        collection.destroy()?;
        self.collections.remove(name);
        info!(collection = name, "dropped collection");
        Ok(())
    }

    /// Search a collection. An unknown name whose directory exists on disk
    /// kicks off a background load and reports `Loading`; the caller
    /// retries.
    pub async fn search(
        self: &Arc<Self>,
        name: &str,
        vectors: &[Vec<f32>],
        opts: &QueryOptions,
    ) -> Result<Vec<Vec<SearchResult>>> {
        let Some(collection) = self.get(name) else {
            if self.data_path.join(name).is_dir() {
                self.spawn_background_load(name);
                return Err(Error::Loading(name.to_string()));
            }
            return Err(Error::NotFound(format!("collection [{name}]")));
        };

        if vectors.is_empty() {
            return Err(Error::InvalidInput("vectors is empty".into()));
        }
        let flat: Vec<f32> = vectors.iter().flatten().copied().collect();
        collection.search(flat, opts).await
    }

    fn spawn_background_load(self: &Arc<Self>, name: &str) {
        if self.loading.insert(name.to_string(), ()).is_some() {
            return;
        }
        let registry = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            info!(collection = %name, "background-loading collection");
            if let Err(e) = registry.load_from_disk(&name).await {
                error!(collection = %name, "background load failed: {e}");
            }
            registry.loading.remove(&name);
        });
    }

    pub async fn add_document(&self, name: &str, doc: &AddDocumentRequest) -> Result<()> {
        self.require(name)?.add_document(doc).await
    }

    pub async fn batch_add_documents(
        &self,
        name: &str,
        batch: &BatchAddDocumentsRequest,
    ) -> Result<()> {
        self.require(name)?
            .batch_add_documents(&batch.documents)
            .await
    }

    pub fn delete_document(&self, name: &str, vqid: &str) -> Result<usize> {
        if vqid.is_empty() {
            return Err(Error::InvalidInput("vqid is empty".into()));
        }
        Ok(self.require(name)?.delete_document(vqid))
    }

    pub fn update_document_metadata(
        &self,
        name: &str,
        req: &UpdateDocumentMetadataRequest,
    ) -> Result<usize> {
        if req.vqid.is_empty() {
            return Err(Error::InvalidInput("vqid is empty".into()));
        }
        self.require(name)?
            .update_document_metadata(&req.vqid, &req.metadata)
    }

    pub fn get_document_metadata(
        &self,
        name: &str,
        vqid: &str,
        check_duplicate: bool,
    ) -> Result<Vec<DocumentHit>> {
        if vqid.is_empty() {
            return Err(Error::InvalidInput("vqid is empty".into()));
        }
        Ok(self
            .require(name)?
            .get_document_metadata(vqid, check_duplicate))
    }

    pub async fn train_collection(&self, name: &str, req: TrainRequest) -> Result<()> {
        self.require(name)?
            .train(req.threads, req.ignore_check)
            .await
    }

    pub async fn dump_collection(&self, name: &str) -> Result<()> {
        self.require(name)?.dump().await
    }

    pub fn dump_collection_metadata(&self, name: &str) -> Result<()> {
        self.require(name)?.dump_metadata()
    }

    pub async fn dump_collection_index(&self, name: &str) -> Result<()> {
        self.require(name)?.dump_index().await
    }

    /// Load or reload a collection: resident collections reload only their
    /// tail segment, cold ones are loaded from disk in full.
    pub async fn load_collection(&self, name: &str) -> Result<()> {
        match self.get(name) {
            Some(collection) => collection.load_last_segment().await,
            None => {
                if !self.data_path.join(name).is_dir() {
                    return Err(Error::NotFound(format!("collection [{name}]")));
                }
                self.load_from_disk(name).await
            }
        }
    }

    pub async fn statistics(&self) -> Result<EngineStats> {
        let mut stats = EngineStats {
            collections: Vec::new(),
            collection_count: 0,
            total_index_size: 0,
        };
        let collections: Vec<Arc<Collection>> =
            self.collections.iter().map(|e| e.value().clone()).collect();
        for collection in collections {
            match collection.stats().await {
                Ok(collection_stats) => {
                    stats.collection_count += 1;
                    stats.total_index_size += collection_stats.total_index_size;
                    stats.collections.push(collection_stats);
                }
                Err(e) => {
                    warn!(collection = collection.name(), "stats unavailable: {e}");
                }
            }
        }
        stats
            .collections
            .sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stats)
    }
}
