//! Client-side sync session.
//!
//! [`SyncSession`] drives the client half of the wire protocol. It owns a
//! client-local [`ReplicaRegistry`] (each open document is a synthetic
//! subscriber connection, which gives the reference-counted open/close
//! semantics), tracks a [`SyncStatus`] per document, and queues outbound
//! frames in an outbox instead of owning a transport. The embedding
//! application drains the outbox into whatever socket it manages and feeds
//! inbound frames to [`SyncSession::handle_server_message`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use super::status::SyncStatus;
use crate::crdt::{
    ClientId, ConnectionId, DocumentId, ReplicaHandle, ReplicaRegistry, SharedStorage,
    UpdateOrigin,
};
use crate::error::Result;
use crate::messages::{ClientMessage, ServerMessage};

struct OpenDocument {
    conn: ConnectionId,
    handle: Arc<ReplicaHandle>,
    status: SyncStatus,
}

/// One client's view of the sync protocol across its open documents.
pub struct SyncSession {
    registry: Arc<ReplicaRegistry>,
    /// The awareness id this session publishes presence under.
    client: ClientId,
    open: HashMap<DocumentId, OpenDocument>,
    outbox: VecDeque<ClientMessage>,
    next_conn: AtomicU64,
}

impl SyncSession {
    /// Create a session publishing presence as `client`, caching documents
    /// in `storage`.
    pub fn new(storage: SharedStorage, client: ClientId) -> Self {
        Self {
            registry: ReplicaRegistry::with_local_client(
                storage,
                crate::crdt::DEFAULT_CLOSE_GRACE,
                client,
            ),
            client,
            open: HashMap::new(),
            outbox: VecDeque::new(),
            next_conn: AtomicU64::new(1),
        }
    }

    /// The awareness id this session publishes under.
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Open a document: subscribe the local replica and request the initial
    /// sync from the server. Re-opening an already open document is a no-op
    /// returning the existing handle.
    pub async fn open_document(&mut self, doc: &DocumentId) -> Result<Arc<ReplicaHandle>> {
        if let Some(open) = self.open.get(doc) {
            return Ok(open.handle.clone());
        }

        let conn = ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed));
        let handle = self.registry.subscribe(doc, conn).await?;

        let mut status = SyncStatus::None;
        status.begin_connecting();
        self.open.insert(
            doc.clone(),
            OpenDocument {
                conn,
                handle: handle.clone(),
                status,
            },
        );
        self.outbox
            .push_back(ClientMessage::SyncBegin { doc: doc.clone() });
        Ok(handle)
    }

    /// Close a document: unsubscribe locally (the replica lingers for the
    /// grace period) and tell the server.
    pub async fn close_document(&mut self, doc: &DocumentId) {
        let Some(open) = self.open.remove(doc) else {
            return;
        };
        self.registry.unsubscribe(doc, open.conn).await;
        self.outbox
            .push_back(ClientMessage::SyncEnd { doc: doc.clone() });
    }

    /// Merge a locally produced delta and queue it for the server.
    pub async fn local_update(&mut self, doc: &DocumentId, delta: &[u8]) -> Result<()> {
        let Some(open) = self.open.get_mut(doc) else {
            log::warn!("local update for document '{}' that is not open", doc);
            return Ok(());
        };
        open.handle.apply_update(delta, UpdateOrigin::Local).await?;
        open.status.local_mutation();
        self.outbox.push_back(ClientMessage::DocUpdate {
            doc: doc.clone(),
            data: delta.to_vec(),
        });
        Ok(())
    }

    /// Publish this session's presence state for a document, advancing the
    /// local clock and queueing the write for the server.
    pub fn publish_presence(&mut self, doc: &DocumentId, state: Value) {
        let Some(open) = self.open.get(doc) else {
            return;
        };
        let clock = open
            .handle
            .with_presence(|presence| presence.publish_local(state.clone()))
            .flatten();
        if let Some(clock) = clock {
            self.outbox.push_back(ClientMessage::AwarenessUpdate {
                doc: doc.clone(),
                clock,
                state: Some(state),
            });
        }
    }

    /// Handle one inbound frame from the server.
    pub async fn handle_server_message(&mut self, msg: ServerMessage) -> Result<()> {
        match msg {
            ServerMessage::Authenticated { username, .. } => {
                log::info!("authenticated as '{}'", username);
                self.outbox
                    .push_back(ClientMessage::ConnectAwareness { id: self.client });
            }
            ServerMessage::InitialSync { doc, data } => {
                if let Some(open) = self.open.get_mut(&doc) {
                    open.handle.apply_update(&data, UpdateOrigin::Sync).await?;
                    open.status.initial_synced();
                }
            }
            ServerMessage::SyncData { doc, data } => {
                if let Some(open) = self.open.get_mut(&doc) {
                    // Tagged with the session's own subscriber id so the
                    // merge is not echoed back out through the event stream.
                    open.handle
                        .apply_update(&data, UpdateOrigin::Remote(open.conn))
                        .await?;
                    open.status.server_delta();
                }
            }
            ServerMessage::AwarenessState {
                doc,
                client,
                clock,
                state,
            } => {
                if let Some(open) = self.open.get(&doc) {
                    let outcome = open.handle.apply_presence(client, clock, state);
                    // Self-protection: a peer tried to remove our live
                    // state. Rebroadcast so everyone learns we are here.
                    if let Some((clock, state)) = outcome.republish {
                        self.outbox.push_back(ClientMessage::AwarenessUpdate {
                            doc,
                            clock,
                            state: Some(state),
                        });
                    }
                }
            }
            ServerMessage::AwarenessPeerRemoved { doc, id } => {
                if let Some(open) = self.open.get(&doc) {
                    let outcome = open.handle.remove_peer(id);
                    // Same self-protection as a null-state write: a removal
                    // naming our own live state gets republished, not
                    // swallowed.
                    if let Some((clock, state)) = outcome.republish {
                        self.outbox.push_back(ClientMessage::AwarenessUpdate {
                            doc,
                            clock,
                            state: Some(state),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// The transport dropped. Every open document becomes disconnected.
    pub fn connection_lost(&mut self) {
        for open in self.open.values_mut() {
            open.status.transport_failed();
        }
    }

    /// The server rejected our credentials. Terminal until
    /// [`SyncSession::reconnect`].
    pub fn auth_rejected(&mut self) {
        for open in self.open.values_mut() {
            open.status.auth_rejected();
        }
    }

    /// Explicit reconnect: every open document re-requests its initial sync.
    pub fn reconnect(&mut self) {
        for (doc, open) in &mut self.open {
            open.status.reconnect();
            self.outbox
                .push_back(ClientMessage::SyncBegin { doc: doc.clone() });
        }
    }

    /// Sync status of one document.
    pub fn status(&self, doc: &DocumentId) -> SyncStatus {
        self.open
            .get(doc)
            .map(|open| open.status)
            .unwrap_or_default()
    }

    /// Maximum-severity status across all open documents.
    pub fn aggregate_status(&self) -> SyncStatus {
        SyncStatus::aggregate(self.open.values().map(|open| open.status))
    }

    /// The local replica handle of an open document.
    pub fn handle(&self, doc: &DocumentId) -> Option<Arc<ReplicaHandle>> {
        self.open.get(doc).map(|open| open.handle.clone())
    }

    /// Drain all queued outbound frames, in order.
    pub fn drain_outbox(&mut self) -> Vec<ClientMessage> {
        self.outbox.drain(..).collect()
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("client", &self.client)
            .field("open", &self.open.len())
            .field("outbox", &self.outbox.len())
            .finish()
    }
}
