//! Per-segment document metadata store.
//!
//! Records are kept in insertion order; a record's index in the vector is
//! its docId. Deletion tombstones the slot, the vector never shrinks and
//! docIds are never reused, so ids handed to the index stay resolvable for
//! the segment's whole life.

use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use vectra_core::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocRecord {
    pub vqid: String,
    /// Opaque metadata blob, encoded once at write time.
    pub data: Vec<u8>,
}

#[derive(Default)]
pub struct MetadataStore {
    records: RwLock<Vec<Option<DocRecord>>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record and return its docId.
    pub fn push(&self, record: DocRecord) -> usize {
        let mut records = self.records.write();
        records.push(Some(record));
        records.len() - 1
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// `None` for out-of-range ids and tombstoned slots alike.
    pub fn get(&self, doc_id: usize) -> Option<DocRecord> {
        self.records.read().get(doc_id)?.clone()
    }

    /// Tombstone every live record with this vqid; returns how many were
    /// removed.
    pub fn delete_by_vqid(&self, vqid: &str) -> usize {
        let mut records = self.records.write();
        let mut count = 0;
        for slot in records.iter_mut() {
            if slot.as_ref().is_some_and(|r| r.vqid == vqid) {
                *slot = None;
                count += 1;
            }
        }
        count
    }

    /// Overwrite the data blob of every live record with this vqid.
    pub fn update_by_vqid(&self, vqid: &str, data: &[u8]) -> usize {
        let mut records = self.records.write();
        let mut count = 0;
        for slot in records.iter_mut() {
            if let Some(record) = slot.as_mut() {
                if record.vqid == vqid {
                    record.data = data.to_vec();
                    count += 1;
                }
            }
        }
        count
    }

    pub fn get_by_vqid(&self, vqid: &str, check_duplicate: bool) -> Vec<DocRecord> {
        let records = self.records.read();
        let mut hits = Vec::new();
        for record in records.iter().flatten() {
            if record.vqid == vqid {
                hits.push(record.clone());
                if !check_duplicate {
                    break;
                }
            }
        }
        hits
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let records = self.records.read();
        let encoded = bincode::serialize(&*records).map_err(vectra_core::Error::from)?;
        std::fs::write(path, encoded)?;
        Ok(())
    }

    pub fn load(&self, path: &Path) -> Result<()> {
        let raw = std::fs::read(path)?;
        let decoded: Vec<Option<DocRecord>> =
            bincode::deserialize(&raw).map_err(vectra_core::Error::from)?;
        *self.records.write() = decoded;
        Ok(())
    }
}
