//! Request, response and option types shared between the engine and the
//! HTTP layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_top_k() -> usize {
    30
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_nprobe() -> usize {
    128
}

fn default_reorder() -> usize {
    128
}

/// Per-query search options. Fields the caller omits fall back to the
/// engine defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_nprobe")]
    pub nprobe: usize,
    #[serde(default = "default_reorder")]
    pub reorder: usize,
    /// Whole-search deadline in seconds; segment tasks that outlive it are
    /// abandoned.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            nprobe: default_nprobe(),
            reorder: default_reorder(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddDocumentRequest {
    pub vqid: String,
    #[serde(default)]
    pub metadata: Value,
    pub vectors: Vec<Vec<f32>>,
    /// Optional per-vector discriminators; when empty the vector's position
    /// within the document is used.
    #[serde(default)]
    pub vectors_tag: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchAddDocumentsRequest {
    pub documents: Vec<AddDocumentRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateDocumentMetadataRequest {
    pub vqid: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TrainRequest {
    /// 0 means use all cores.
    #[serde(default)]
    pub threads: usize,
    /// Skip the available-memory admission check.
    #[serde(default)]
    pub ignore_check: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub vqid: String,
    pub score: f32,
    pub metadata: Value,
    pub tag: u64,
}

/// A metadata record returned by document lookup.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentHit {
    pub vqid: String,
    pub metadata: Value,
}
