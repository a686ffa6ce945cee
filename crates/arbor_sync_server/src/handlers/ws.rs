use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arbor_core::crdt::{ClientId, ConnectionId, DocumentId, ReplicaEvent, ReplicaHandle, ReplicaRegistry, UpdateOrigin};
use arbor_core::messages::{AUTHENTICATION_FAILED_CODE, ClientMessage, Permission, ServerMessage};
use axum::{
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::SharedAuthenticator;

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Auth token
    pub token: Option<String>,
}

/// Shared state for WebSocket handler
#[derive(Clone)]
pub struct WsState {
    pub auth: SharedAuthenticator,
    pub registry: Arc<ReplicaRegistry>,
    pub next_conn: Arc<AtomicU64>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    State(state): State<WsState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let auth = query
        .token
        .as_deref()
        .and_then(|token| state.auth.authenticate(token));

    let Some(auth) = auth else {
        warn!("WebSocket connection rejected: invalid or missing token");
        // Accept the upgrade so the client can see the policy close code.
        return ws
            .on_upgrade(|socket| reject_unauthenticated(socket))
            .into_response();
    };

    let conn = ConnectionId(state.next_conn.fetch_add(1, Ordering::Relaxed));
    info!("WebSocket upgrade: user={}, conn={}", auth.username, conn);

    ws.on_upgrade(move |socket| {
        handle_socket(socket, state, conn, auth.username, auth.permission)
    })
    .into_response()
}

async fn reject_unauthenticated(mut socket: WebSocket) {
    let frame = CloseFrame {
        code: AUTHENTICATION_FAILED_CODE,
        reason: "authentication failed".into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

struct OpenDoc {
    handle: Arc<ReplicaHandle>,
    forwarder: JoinHandle<()>,
}

/// Handle an established, authenticated WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    state: WsState,
    conn: ConnectionId,
    username: String,
    permission: Permission,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(256);

    if send_message(
        &mut ws_tx,
        &ServerMessage::Authenticated {
            username: username.clone(),
            permissions: permission,
        },
    )
    .await
    .is_err()
    {
        return;
    }

    let mut open: HashMap<DocumentId, OpenDoc> = HashMap::new();
    let mut awareness_id: Option<ClientId> = None;

    loop {
        tokio::select! {
            // Incoming frames from the client
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let parsed: Result<ClientMessage, _> = serde_json::from_str(&text);
                        match parsed {
                            Ok(msg) => {
                                handle_client_message(
                                    msg,
                                    &state,
                                    conn,
                                    permission,
                                    &mut open,
                                    &mut awareness_id,
                                    &out_tx,
                                )
                                .await;
                            }
                            Err(e) => {
                                warn!("malformed message from {}: {}", conn, e);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("client {} requested close", conn);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error on {}: {}", conn, e);
                        break;
                    }
                    None => break,
                }
            }

            // Outgoing frames queued by the per-document forwarders
            Some(msg) = out_rx.recv() => {
                if send_message(&mut ws_tx, &msg).await.is_err() {
                    break;
                }
            }

            else => break,
        }
    }

    info!("WebSocket disconnected: user={}, conn={}", username, conn);

    // Implicit unsubscribe of everything this connection had open, with a
    // synthetic presence removal on its behalf.
    for (doc, open_doc) in open.drain() {
        if let Some(id) = awareness_id {
            open_doc.handle.remove_peer(id);
        }
        open_doc.forwarder.abort();
        state.registry.unsubscribe(&doc, conn).await;
    }
}

async fn handle_client_message(
    msg: ClientMessage,
    state: &WsState,
    conn: ConnectionId,
    permission: Permission,
    open: &mut HashMap<DocumentId, OpenDoc>,
    awareness_id: &mut Option<ClientId>,
    out_tx: &mpsc::Sender<ServerMessage>,
) {
    // Write-permission gating is silent: mutations from read-only
    // connections are dropped without a response.
    if msg.is_write() && !permission.can_write() {
        debug!("dropping write from read-only connection {}", conn);
        return;
    }

    match msg {
        ClientMessage::SyncBegin { doc } => {
            if open.contains_key(&doc) {
                debug!("{} re-requested sync for '{}'", conn, doc);
                return;
            }
            let handle = match state.registry.subscribe(&doc, conn).await {
                Ok(handle) => handle,
                Err(e) => {
                    error!("subscribe to '{}' failed for {}: {}", doc, conn, e);
                    return;
                }
            };

            // Take the event stream before snapshotting: a delta merged
            // while the initial frames are in flight must arrive through
            // the stream, since deltas are incremental and a receiver only
            // sees events sent after it exists.
            let events = handle.subscribe_events();

            let initial = ServerMessage::InitialSync {
                doc: doc.clone(),
                data: handle.full_state().await,
            };
            if out_tx.send(initial).await.is_err() {
                return;
            }

            // Replay current presence so the new subscriber sees who is here.
            for (client, clock, presence_state) in handle.presence_snapshot() {
                let msg = ServerMessage::AwarenessState {
                    doc: doc.clone(),
                    client,
                    clock,
                    state: Some(presence_state),
                };
                if out_tx.send(msg).await.is_err() {
                    return;
                }
            }

            let forwarder = spawn_forwarder(events, doc.clone(), conn, out_tx.clone());
            open.insert(doc, OpenDoc { handle, forwarder });
        }

        ClientMessage::SyncEnd { doc } => {
            let Some(open_doc) = open.remove(&doc) else {
                return;
            };
            if let Some(id) = *awareness_id {
                open_doc.handle.remove_peer(id);
            }
            open_doc.forwarder.abort();
            state.registry.unsubscribe(&doc, conn).await;
        }

        ClientMessage::DocUpdate { doc, data } => {
            let Some(open_doc) = open.get(&doc) else {
                debug!("{} sent update for unopened document '{}'", conn, doc);
                return;
            };
            if let Err(e) = open_doc
                .handle
                .apply_update(&data, UpdateOrigin::Remote(conn))
                .await
            {
                warn!("rejecting bad update for '{}' from {}: {}", doc, conn, e);
            }
        }

        ClientMessage::ConnectAwareness { id } => {
            *awareness_id = Some(id);
        }

        ClientMessage::AwarenessUpdate { doc, clock, state } => {
            let Some(id) = *awareness_id else {
                debug!("{} sent awareness before connect-awareness", conn);
                return;
            };
            let Some(open_doc) = open.get(&doc) else {
                debug!("{} sent awareness for unopened document '{}'", conn, doc);
                return;
            };
            open_doc.handle.apply_presence(id, clock, state);
        }
    }
}

/// Forward replica events for one document to one connection, skipping
/// deltas that originated from it.
fn spawn_forwarder(
    mut events: broadcast::Receiver<ReplicaEvent>,
    doc: DocumentId,
    conn: ConnectionId,
    out_tx: mpsc::Sender<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("{} lagged {} events on '{}'", conn, n, doc);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let msg = match event {
                ReplicaEvent::Update { origin, data } => {
                    if origin.is_from(conn) {
                        continue;
                    }
                    ServerMessage::SyncData {
                        doc: doc.clone(),
                        data,
                    }
                }
                ReplicaEvent::Presence {
                    client,
                    clock,
                    state,
                } => ServerMessage::AwarenessState {
                    doc: doc.clone(),
                    client,
                    clock,
                    state,
                },
                ReplicaEvent::PeerRemoved { client } => ServerMessage::AwarenessPeerRemoved {
                    doc: doc.clone(),
                    id: client,
                },
            };

            if out_tx.send(msg).await.is_err() {
                break;
            }
        }
    })
}

async fn send_message(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(msg) {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await,
        Err(e) => {
            error!("failed to encode server message: {}", e);
            Ok(())
        }
    }
}
