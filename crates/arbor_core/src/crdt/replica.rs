//! Opaque replica document.
//!
//! [`ReplicaDoc`] wraps a yrs [`Doc`] without interpreting its content. The
//! registry owns one per open document and only ever moves opaque v1 update
//! blobs in and out; typed views ([`super::tree::TreeCrdt`], calendar data)
//! are built client-side from the same updates.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::error::{ArborError, Result};

/// The in-memory CRDT state of one document.
pub struct ReplicaDoc {
    doc: Doc,
}

impl ReplicaDoc {
    /// Create an empty replica.
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Create a replica from a persisted full-state blob.
    pub fn from_state(state: &[u8]) -> Result<Self> {
        let replica = Self::new();
        replica.apply_update(state)?;
        Ok(replica)
    }

    /// The underlying yrs document, for seeding initial content.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Merge an opaque update blob.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| ArborError::Codec(format!("failed to decode update: {}", e)))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| ArborError::Codec(format!("failed to apply update: {}", e)))?;
        Ok(())
    }

    /// Encode the full document state as one update blob.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the current state vector for a sync handshake.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode only what a remote peer with the given state vector is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| ArborError::Codec(format!("failed to decode state vector: {}", e)))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }
}

impl Default for ReplicaDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReplicaDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaDoc").finish_non_exhaustive()
    }
}
