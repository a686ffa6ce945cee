//! In-memory storage backend.
//!
//! Used in tests and as the client-side default when no durable cache is
//! configured. Tracks load/save call counts so lifecycle tests can verify
//! that a handle reused within the grace period does not reload.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::replica::ReplicaDoc;
use super::storage::DocStorage;
use super::types::DocumentId;
use crate::error::{ArborError, Result};

/// Storage backend keeping document snapshots in a process-local map.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    docs: RwLock<HashMap<DocumentId, Vec<u8>>>,
    load_calls: AtomicUsize,
    save_calls: AtomicUsize,
}

impl MemoryStorage {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `load` has been called.
    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    /// Number of times `save` has been called.
    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.docs.read().map(|docs| docs.len()).unwrap_or(0)
    }

    /// True if nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocStorage for MemoryStorage {
    fn load(&self, id: &DocumentId) -> Result<Option<Vec<u8>>> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        let docs = self
            .docs
            .read()
            .map_err(|_| ArborError::storage(id.to_string(), "storage lock poisoned"))?;
        Ok(docs.get(id).cloned())
    }

    fn save(&self, id: &DocumentId, state: &[u8]) -> Result<()> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        let mut docs = self
            .docs
            .write()
            .map_err(|_| ArborError::storage(id.to_string(), "storage lock poisoned"))?;
        docs.insert(id.clone(), state.to_vec());
        Ok(())
    }

    fn create_initial(&self, _id: &DocumentId, _replica: &ReplicaDoc) -> Result<()> {
        Ok(())
    }
}
