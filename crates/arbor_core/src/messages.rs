//! JSON wire protocol between client and sync server.
//!
//! Every frame is a JSON object tagged by a kebab-case `type` field. CRDT
//! payloads travel as raw byte arrays inside the JSON; the protocol never
//! interprets them. Unknown document ids fail deserialization of the frame
//! that carries them, which scopes the failure to that one operation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crdt::{ClientId, DocumentId};

/// WebSocket close code sent when authentication fails. Application close
/// codes start at 3000; clients treat this one as fatal and do not reconnect.
pub const AUTHENTICATION_FAILED_CODE: u16 = 3000;

/// What an authenticated connection is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    /// The token was not recognized.
    Unauthenticated,
    /// May subscribe and read, but doc and awareness writes are dropped.
    ReadOnly,
    /// Full access.
    ReadWrite,
}

impl Permission {
    /// True if doc updates and awareness writes from this connection are
    /// applied rather than silently dropped.
    pub fn can_write(&self) -> bool {
        matches!(self, Permission::ReadWrite)
    }
}

/// Frames sent from a client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Subscribe to a document; the server replies with `initial-sync`.
    SyncBegin {
        /// The document to open.
        doc: DocumentId,
    },
    /// Unsubscribe from a document.
    SyncEnd {
        /// The document to close.
        doc: DocumentId,
    },
    /// A CRDT delta produced locally, to merge and rebroadcast.
    DocUpdate {
        /// The document the delta belongs to.
        doc: DocumentId,
        /// Opaque v1 update bytes.
        data: Vec<u8>,
    },
    /// Announce the awareness client id this connection publishes under.
    ConnectAwareness {
        /// The client-chosen awareness id.
        id: ClientId,
    },
    /// A presence write for the announced awareness id.
    AwarenessUpdate {
        /// The document the presence is scoped to.
        doc: DocumentId,
        /// Logical clock of the write.
        clock: i64,
        /// New state, or `null` to depart.
        state: Option<Value>,
    },
}

/// Frames sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Sent once after the connection's token is accepted.
    Authenticated {
        /// Display name associated with the token.
        username: String,
        /// What this connection may do.
        permissions: Permission,
    },
    /// Full document state, sent in response to `sync-begin`.
    InitialSync {
        /// The document that was opened.
        doc: DocumentId,
        /// Full state as one opaque update blob.
        data: Vec<u8>,
    },
    /// An incremental delta from another subscriber (or the server itself).
    SyncData {
        /// The document the delta belongs to.
        doc: DocumentId,
        /// Opaque v1 update bytes.
        data: Vec<u8>,
    },
    /// An accepted presence write, relayed to every subscriber.
    AwarenessState {
        /// The document the presence is scoped to.
        doc: DocumentId,
        /// The client the state belongs to.
        client: ClientId,
        /// Logical clock of the write.
        clock: i64,
        /// The state, or `null` for a departure.
        state: Option<Value>,
    },
    /// A peer's connection dropped; its presence was removed server-side.
    AwarenessPeerRemoved {
        /// The document the peer was present in.
        doc: DocumentId,
        /// The departed client.
        id: ClientId,
    },
}

impl ClientMessage {
    /// The document this frame addresses, if any.
    pub fn doc(&self) -> Option<&DocumentId> {
        match self {
            ClientMessage::SyncBegin { doc }
            | ClientMessage::SyncEnd { doc }
            | ClientMessage::DocUpdate { doc, .. }
            | ClientMessage::AwarenessUpdate { doc, .. } => Some(doc),
            ClientMessage::ConnectAwareness { .. } => None,
        }
    }

    /// True if applying this frame mutates shared state.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            ClientMessage::DocUpdate { .. } | ClientMessage::AwarenessUpdate { .. }
        )
    }
}
