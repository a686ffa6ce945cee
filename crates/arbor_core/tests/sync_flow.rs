//! End-to-end exercise of the sync stack: two client sessions talking to a
//! server-side registry, with frames routed by hand the way the WebSocket
//! layer does it.

use std::collections::HashMap;
use std::sync::Arc;

use arbor_core::crdt::{
    ClientId, ConnectionId, DEFAULT_CLOSE_GRACE, DocumentId, MemoryStorage, ReplicaRegistry,
    ROOT_ID, TreeCrdt, UpdateOrigin,
};
use arbor_core::messages::{ClientMessage, ServerMessage};
use arbor_core::sync::{SyncSession, SyncStatus};
use serde_json::json;

/// Minimal stand-in for the WebSocket layer: applies client frames to the
/// server registry and returns the frames each connection would receive.
struct TestServer {
    registry: Arc<ReplicaRegistry>,
    awareness: HashMap<ConnectionId, ClientId>,
}

impl TestServer {
    fn new() -> Self {
        Self {
            registry: ReplicaRegistry::new(Arc::new(MemoryStorage::new()), DEFAULT_CLOSE_GRACE),
            awareness: HashMap::new(),
        }
    }

    /// Handle one client frame. Returns `(reply_to_sender, broadcast_to_others)`.
    async fn handle(
        &mut self,
        conn: ConnectionId,
        msg: ClientMessage,
    ) -> (Vec<ServerMessage>, Vec<ServerMessage>) {
        match msg {
            ClientMessage::SyncBegin { doc } => {
                let handle = self.registry.subscribe(&doc, conn).await.unwrap();
                let mut replies = vec![ServerMessage::InitialSync {
                    doc: doc.clone(),
                    data: handle.full_state().await,
                }];
                for (client, clock, state) in handle.presence_snapshot() {
                    replies.push(ServerMessage::AwarenessState {
                        doc: doc.clone(),
                        client,
                        clock,
                        state: Some(state),
                    });
                }
                (replies, vec![])
            }
            ClientMessage::SyncEnd { doc } => {
                self.registry.unsubscribe(&doc, conn).await;
                (vec![], vec![])
            }
            ClientMessage::DocUpdate { doc, data } => {
                let handle = self.registry.get(&doc).await.unwrap();
                handle
                    .apply_update(&data, UpdateOrigin::Remote(conn))
                    .await
                    .unwrap();
                // Everyone except the origin gets the delta.
                (
                    vec![],
                    vec![ServerMessage::SyncData { doc, data }],
                )
            }
            ClientMessage::ConnectAwareness { id } => {
                self.awareness.insert(conn, id);
                (vec![], vec![])
            }
            ClientMessage::AwarenessUpdate { doc, clock, state } => {
                let id = self.awareness[&conn];
                let handle = self.registry.get(&doc).await.unwrap();
                let outcome = handle.apply_presence(id, clock, state.clone());
                if outcome.accepted {
                    let relay = ServerMessage::AwarenessState {
                        doc,
                        client: id,
                        clock,
                        state,
                    };
                    (vec![relay.clone()], vec![relay])
                } else {
                    (vec![], vec![])
                }
            }
        }
    }

    /// Simulate a connection dropping without a goodbye.
    async fn disconnect(&mut self, conn: ConnectionId, open: &[DocumentId]) -> Vec<ServerMessage> {
        let mut broadcast = vec![];
        for doc in open {
            if let Some(handle) = self.registry.get(doc).await {
                if let Some(id) = self.awareness.get(&conn) {
                    let outcome = handle.remove_peer(*id);
                    if outcome.accepted {
                        broadcast.push(ServerMessage::AwarenessPeerRemoved {
                            doc: doc.clone(),
                            id: *id,
                        });
                    }
                }
                self.registry.unsubscribe(doc, conn).await;
            }
        }
        broadcast
    }
}

/// Pump one session's queued frames through the server, delivering replies
/// back to it and broadcasts to the other session.
async fn pump(
    server: &mut TestServer,
    conn: ConnectionId,
    session: &mut SyncSession,
    other: &mut SyncSession,
) {
    for frame in session.drain_outbox() {
        let (replies, broadcast) = server.handle(conn, frame).await;
        for msg in replies {
            session.handle_server_message(msg).await.unwrap();
        }
        for msg in broadcast {
            other.handle_server_message(msg).await.unwrap();
        }
    }
}

#[tokio::test]
async fn tree_edit_replicates_between_two_clients() {
    let mut server = TestServer::new();
    let conn_a = ConnectionId(101);
    let conn_b = ConnectionId(102);
    let mut alice = SyncSession::new(Arc::new(MemoryStorage::new()), ClientId(1));
    let mut bob = SyncSession::new(Arc::new(MemoryStorage::new()), ClientId(2));

    let doc = DocumentId::Global;
    alice.open_document(&doc).await.unwrap();
    bob.open_document(&doc).await.unwrap();
    pump(&mut server, conn_a, &mut alice, &mut bob).await;
    pump(&mut server, conn_b, &mut bob, &mut alice).await;
    assert_eq!(alice.status(&doc), SyncStatus::Synced);
    assert_eq!(bob.status(&doc), SyncStatus::Synced);

    // Alice adds a page to the workspace tree.
    let tree = TreeCrdt::new();
    let delta = tree
        .add_child(ROOT_ID, "page-1", &[("title".into(), json!("Notes"))])
        .unwrap();
    alice
        .local_update(&doc, &tree.encode_state_as_update())
        .await
        .unwrap();
    assert!(!delta.is_empty());
    assert_eq!(alice.status(&doc), SyncStatus::UnsyncedChanges);

    pump(&mut server, conn_a, &mut alice, &mut bob).await;

    // Bob's replica now resolves the same tree.
    let bob_state = bob.handle(&doc).unwrap().full_state().await;
    let bob_tree = TreeCrdt::from_state(&bob_state).unwrap();
    assert!(bob_tree.contains("page-1"));
    assert_eq!(bob_tree.parent_of("page-1"), Some(ROOT_ID.to_string()));
    assert_eq!(bob_tree.get_value("page-1", "title"), Some(json!("Notes")));
}

#[tokio::test]
async fn presence_replicates_and_disconnect_removes_it() {
    let mut server = TestServer::new();
    let conn_a = ConnectionId(201);
    let conn_b = ConnectionId(202);
    let mut alice = SyncSession::new(Arc::new(MemoryStorage::new()), ClientId(1));
    let mut bob = SyncSession::new(Arc::new(MemoryStorage::new()), ClientId(2));

    let doc = DocumentId::Global;
    alice.open_document(&doc).await.unwrap();
    bob.open_document(&doc).await.unwrap();
    // Announce awareness ids, as the client does after `authenticated`.
    server.awareness.insert(conn_a, ClientId(1));
    server.awareness.insert(conn_b, ClientId(2));
    pump(&mut server, conn_a, &mut alice, &mut bob).await;
    pump(&mut server, conn_b, &mut bob, &mut alice).await;

    alice.publish_presence(&doc, json!({"cursor": "page-1"}));
    pump(&mut server, conn_a, &mut alice, &mut bob).await;
    bob.publish_presence(&doc, json!({"cursor": "home"}));
    pump(&mut server, conn_b, &mut bob, &mut alice).await;

    let seen_by_bob = bob.handle(&doc).unwrap().presence_snapshot();
    assert_eq!(seen_by_bob.len(), 2);
    assert!(
        seen_by_bob
            .iter()
            .any(|(client, _, state)| *client == ClientId(1)
                && state == &json!({"cursor": "page-1"}))
    );

    // Alice's socket drops without a sync-end.
    let broadcast = server.disconnect(conn_a, &[doc.clone()]).await;
    for msg in broadcast {
        bob.handle_server_message(msg).await.unwrap();
    }

    let remaining = bob.handle(&doc).unwrap().presence_snapshot();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].0, ClientId(2));
}

#[tokio::test]
async fn late_joiner_receives_presence_replay() {
    let mut server = TestServer::new();
    let conn_a = ConnectionId(301);
    let conn_b = ConnectionId(302);
    let mut alice = SyncSession::new(Arc::new(MemoryStorage::new()), ClientId(1));
    let mut bob = SyncSession::new(Arc::new(MemoryStorage::new()), ClientId(2));

    let doc = DocumentId::Global;
    alice.open_document(&doc).await.unwrap();
    server.awareness.insert(conn_a, ClientId(1));
    pump(&mut server, conn_a, &mut alice, &mut bob).await;
    alice.publish_presence(&doc, json!({"here": true}));
    pump(&mut server, conn_a, &mut alice, &mut bob).await;

    // Bob subscribes after Alice is already present.
    bob.open_document(&doc).await.unwrap();
    pump(&mut server, conn_b, &mut bob, &mut alice).await;

    let seen = bob.handle(&doc).unwrap().presence_snapshot();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, ClientId(1));
}
