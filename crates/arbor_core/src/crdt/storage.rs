//! Storage abstraction for document persistence.
//!
//! The registry persists full-state snapshots: every save overwrites the
//! previous one, and durability of the latest write relies on the next
//! successful save superseding it. The core never interprets the stored
//! bytes; they are opaque CRDT state.

use std::sync::Arc;

use super::replica::ReplicaDoc;
use super::types::DocumentId;
use crate::error::Result;

/// Persistence backend for replicated documents.
///
/// Implementations dispatch on the [`DocumentId`] namespace (workspace,
/// page, calendar archive) and may store each kind differently.
pub trait DocStorage: Send + Sync {
    /// Load the persisted full state, or `None` if the document is new.
    fn load(&self, id: &DocumentId) -> Result<Option<Vec<u8>>>;

    /// Persist the full current state, overwriting any previous snapshot.
    fn save(&self, id: &DocumentId, state: &[u8]) -> Result<()>;

    /// Seed default content into a freshly constructed replica.
    ///
    /// Invoked only when [`DocStorage::load`] returned `None`. The default
    /// implementation leaves the replica empty.
    fn create_initial(&self, id: &DocumentId, replica: &ReplicaDoc) -> Result<()> {
        let _ = (id, replica);
        Ok(())
    }
}

/// Shared handle to a storage backend.
pub type SharedStorage = Arc<dyn DocStorage>;
