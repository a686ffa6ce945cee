//! Replica lifecycle management.
//!
//! [`ReplicaRegistry`] keeps exactly one live [`ReplicaHandle`] per document
//! id. A handle is constructed on first subscribe (loading persisted state,
//! or seeding default content when none exists), fans out origin-tagged
//! events to its subscribers, and is torn down only after its subscriber set
//! has been empty for a grace period. A subscribe arriving inside the grace
//! period cancels the pending close and reuses the handle without reloading.
//!
//! The server uses the registry authoritatively (subscribers are WebSocket
//! connections); the client uses the same registry with local consumers as
//! synthetic connections, which gives it the reference-counted form of the
//! same contract.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, RwLock, broadcast};
use tokio::task::JoinHandle;

use super::awareness::{PresenceOutcome, PresenceTable};
use super::replica::ReplicaDoc;
use super::storage::SharedStorage;
use super::types::{ClientId, ConnectionId, DocumentId, UpdateOrigin};
use crate::error::Result;

/// Grace period before an unreferenced handle is flushed and dropped.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(10);

/// Events fanned out to a handle's subscribers.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    /// A CRDT delta was merged into the replica.
    Update {
        /// Where the delta came from; subscribers skip their own writes.
        origin: UpdateOrigin,
        /// The opaque delta, forwarded verbatim.
        data: Vec<u8>,
    },
    /// An accepted presence write, delivered to every subscriber.
    Presence {
        /// The client the state belongs to.
        client: ClientId,
        /// Logical clock of the write.
        clock: i64,
        /// New state, `None` for a departure.
        state: Option<Value>,
    },
    /// A peer's connection went away; its presence was removed on its behalf.
    PeerRemoved {
        /// The departed client.
        client: ClientId,
    },
}

/// The live replica of one document plus its subscribers and presence.
pub struct ReplicaHandle {
    id: DocumentId,
    /// The CRDT state, exclusively owned by this handle.
    doc: RwLock<ReplicaDoc>,
    /// Ephemeral per-client presence for this document.
    presence: Mutex<PresenceTable>,
    /// Event fan-out to subscribers.
    events_tx: broadcast::Sender<ReplicaEvent>,
    /// Currently subscribed connections.
    subscribers: Mutex<HashSet<ConnectionId>>,
    /// Deferred-close timer task, present while the subscriber set is empty.
    pending_close: Mutex<Option<JoinHandle<()>>>,
    /// Monotonic snapshot counter, taken while the doc lock is held so it
    /// matches mutation order.
    save_gen: AtomicU64,
    /// Generation of the snapshot that last reached storage. Save tasks run
    /// concurrently; one carrying a superseded generation must not write.
    last_saved: Arc<AsyncMutex<u64>>,
    storage: SharedStorage,
}

impl ReplicaHandle {
    fn new(
        id: DocumentId,
        doc: ReplicaDoc,
        storage: SharedStorage,
        local_client: Option<ClientId>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        Self {
            id,
            doc: RwLock::new(doc),
            presence: Mutex::new(PresenceTable::new(local_client)),
            events_tx,
            subscribers: Mutex::new(HashSet::new()),
            pending_close: Mutex::new(None),
            save_gen: AtomicU64::new(0),
            last_saved: Arc::new(AsyncMutex::new(0)),
            storage,
        }
    }

    /// The document this handle replicates.
    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    /// Subscribe to this handle's event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ReplicaEvent> {
        self.events_tx.subscribe()
    }

    /// Number of subscribed connections.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Merge a delta into the replica, persist fire-and-forget, and fan the
    /// delta out tagged with its origin.
    ///
    /// Persistence failures are logged, never retried, and never block the
    /// broadcast: the in-memory state is still correct, and a later
    /// successful snapshot supersedes the failed one. Snapshots carry a
    /// generation taken under the doc lock; a save task that lost the race
    /// to a newer snapshot skips its write, so the newest state always
    /// lands last no matter how the tasks are scheduled.
    pub async fn apply_update(&self, delta: &[u8], origin: UpdateOrigin) -> Result<()> {
        let (state, generation) = {
            let doc = self.doc.write().await;
            doc.apply_update(delta)?;
            (doc.encode_state_as_update(), self.next_save_gen())
        };

        let storage = Arc::clone(&self.storage);
        let id = self.id.clone();
        let last_saved = Arc::clone(&self.last_saved);
        tokio::spawn(async move {
            let mut last = last_saved.lock().await;
            if generation <= *last {
                return;
            }
            *last = generation;
            if let Err(e) = storage.save(&id, &state) {
                log::error!("failed to persist '{}': {}", id, e);
            }
        });

        let _ = self.events_tx.send(ReplicaEvent::Update {
            origin,
            data: delta.to_vec(),
        });
        Ok(())
    }

    /// Encode the full current state, e.g. for a new subscriber's initial
    /// sync.
    pub async fn full_state(&self) -> Vec<u8> {
        self.doc.read().await.encode_state_as_update()
    }

    /// Persist the current state synchronously, superseding any in-flight
    /// snapshot saves still queued from [`ReplicaHandle::apply_update`].
    pub async fn flush(&self) -> Result<()> {
        let (state, generation) = {
            let doc = self.doc.read().await;
            (doc.encode_state_as_update(), self.next_save_gen())
        };
        let mut last = self.last_saved.lock().await;
        if generation > *last {
            *last = generation;
            self.storage.save(&self.id, &state)?;
        }
        Ok(())
    }

    fn next_save_gen(&self) -> u64 {
        self.save_gen.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Apply a presence write and, if accepted, fan it out to every
    /// subscriber (including the origin, as the accepted write is the
    /// authoritative version).
    pub fn apply_presence(
        &self,
        client: ClientId,
        clock: i64,
        state: Option<Value>,
    ) -> PresenceOutcome {
        let outcome = match self.presence.lock() {
            Ok(mut presence) => presence.apply(client, clock, state.clone()),
            Err(_) => return PresenceOutcome::default(),
        };
        if outcome.accepted {
            let _ = self.events_tx.send(ReplicaEvent::Presence {
                client,
                clock,
                state,
            });
        }
        outcome
    }

    /// Remove a peer's presence on its behalf (connection closed without a
    /// proper goodbye) and notify subscribers.
    pub fn remove_peer(&self, client: ClientId) -> PresenceOutcome {
        let outcome = match self.presence.lock() {
            Ok(mut presence) => presence.remove_peer(client),
            Err(_) => return PresenceOutcome::default(),
        };
        if outcome.accepted {
            let _ = self.events_tx.send(ReplicaEvent::PeerRemoved { client });
        }
        outcome
    }

    /// Live presence states, for replay to a newly subscribed connection.
    pub fn presence_snapshot(&self) -> Vec<(ClientId, i64, Value)> {
        self.presence
            .lock()
            .map(|presence| presence.live_states())
            .unwrap_or_default()
    }

    /// Run `f` with the presence table locked.
    pub fn with_presence<R>(&self, f: impl FnOnce(&mut PresenceTable) -> R) -> Option<R> {
        self.presence.lock().ok().map(|mut presence| f(&mut presence))
    }

    fn attach(&self, conn: ConnectionId) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.insert(conn);
        }
        self.cancel_pending_close();
    }

    /// Returns true if the subscriber set became empty.
    fn detach(&self, conn: ConnectionId) -> bool {
        match self.subscribers.lock() {
            Ok(mut subs) => {
                subs.remove(&conn);
                subs.is_empty()
            }
            Err(_) => false,
        }
    }

    fn cancel_pending_close(&self) {
        if let Ok(mut pending) = self.pending_close.lock() {
            if let Some(task) = pending.take() {
                task.abort();
            }
        }
    }

    fn set_pending_close(&self, task: JoinHandle<()>) {
        if let Ok(mut pending) = self.pending_close.lock() {
            if let Some(previous) = pending.replace(task) {
                previous.abort();
            }
        }
    }
}

impl std::fmt::Debug for ReplicaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaHandle")
            .field("id", &self.id)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// All live replicas of one process, keyed by document id.
pub struct ReplicaRegistry {
    handles: RwLock<HashMap<DocumentId, Arc<ReplicaHandle>>>,
    storage: SharedStorage,
    close_grace: Duration,
    /// Client id used for presence self-protection on client-side registries.
    local_client: Option<ClientId>,
}

impl ReplicaRegistry {
    /// Create a server-side registry (no local presence client).
    pub fn new(storage: SharedStorage, close_grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            handles: RwLock::new(HashMap::new()),
            storage,
            close_grace,
            local_client: None,
        })
    }

    /// Create a client-side registry whose presence tables protect
    /// `local_client` from remote removal.
    pub fn with_local_client(
        storage: SharedStorage,
        close_grace: Duration,
        local_client: ClientId,
    ) -> Arc<Self> {
        Arc::new(Self {
            handles: RwLock::new(HashMap::new()),
            storage,
            close_grace,
            local_client: Some(local_client),
        })
    }

    /// Subscribe a connection to a document, constructing and loading the
    /// replica if it is not live.
    ///
    /// Construction happens under the registry's write lock, so concurrent
    /// subscribes for the same unresolved id construct exactly one handle.
    /// A storage load failure is fatal to this subscribe attempt only.
    pub async fn subscribe(
        self: &Arc<Self>,
        id: &DocumentId,
        conn: ConnectionId,
    ) -> Result<Arc<ReplicaHandle>> {
        {
            // Attach while holding the read guard so a concurrent deferred
            // close cannot drop the handle between lookup and attach.
            let handles = self.handles.read().await;
            if let Some(handle) = handles.get(id) {
                handle.attach(conn);
                return Ok(handle.clone());
            }
        }

        let mut handles = self.handles.write().await;

        // Double-check after acquiring the write lock
        if let Some(handle) = handles.get(id) {
            handle.attach(conn);
            return Ok(handle.clone());
        }

        let doc = match self.storage.load(id)? {
            Some(state) => ReplicaDoc::from_state(&state)?,
            None => {
                let doc = ReplicaDoc::new();
                self.storage.create_initial(id, &doc)?;
                doc
            }
        };

        let handle = Arc::new(ReplicaHandle::new(
            id.clone(),
            doc,
            Arc::clone(&self.storage),
            self.local_client,
        ));
        handle.attach(conn);
        handles.insert(id.clone(), handle.clone());
        log::info!("opened replica '{}'", id);

        Ok(handle)
    }

    /// Unsubscribe a connection. When the subscriber set becomes empty, a
    /// deferred close is scheduled; any subscribe before it fires cancels it.
    pub async fn unsubscribe(self: &Arc<Self>, id: &DocumentId, conn: ConnectionId) {
        let handle = {
            let handles = self.handles.read().await;
            handles.get(id).cloned()
        };
        let Some(handle) = handle else {
            return;
        };

        if handle.detach(conn) {
            let registry = Arc::downgrade(self);
            let doc_id = id.clone();
            let grace = self.close_grace;
            handle.set_pending_close(tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if let Some(registry) = Weak::upgrade(&registry) {
                    registry.close_if_idle(&doc_id).await;
                }
            }));
        }
    }

    /// Flush and drop a handle if it still has no subscribers.
    async fn close_if_idle(&self, id: &DocumentId) {
        let mut handles = self.handles.write().await;
        let Some(handle) = handles.get(id) else {
            return;
        };
        if handle.subscriber_count() > 0 {
            return;
        }

        if let Err(e) = handle.flush().await {
            log::error!("failed to flush '{}' on close: {}", id, e);
        }
        handles.remove(id);
        log::info!("closed idle replica '{}'", id);
    }

    /// Look up a live handle without subscribing.
    pub async fn get(&self, id: &DocumentId) -> Option<Arc<ReplicaHandle>> {
        self.handles.read().await.get(id).cloned()
    }

    /// Number of live replicas.
    pub async fn len(&self) -> usize {
        self.handles.read().await.len()
    }

    /// True if no replicas are live.
    pub async fn is_empty(&self) -> bool {
        self.handles.read().await.is_empty()
    }

    /// Flush every live replica to storage, e.g. on shutdown.
    pub async fn save_all(&self) {
        let handles: Vec<_> = {
            let map = self.handles.read().await;
            map.values().cloned().collect()
        };
        for handle in handles {
            if let Err(e) = handle.flush().await {
                log::error!("failed to flush '{}': {}", handle.id(), e);
            }
        }
    }
}

impl std::fmt::Debug for ReplicaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaRegistry")
            .field("close_grace", &self.close_grace)
            .field("local_client", &self.local_client)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::memory_storage::MemoryStorage;
    use crate::crdt::storage::DocStorage;
    use crate::error::ArborError;
    use serde_json::json;
    use yrs::{GetString, Text, Transact};

    fn page_id() -> DocumentId {
        DocumentId::new_page()
    }

    fn make_delta() -> Vec<u8> {
        let doc = ReplicaDoc::new();
        {
            let text = doc.doc().get_or_insert_text("content");
            let mut txn = doc.doc().transact_mut();
            text.insert(&mut txn, 0, "edit");
        }
        doc.encode_state_as_update()
    }

    #[tokio::test]
    async fn test_subscribe_constructs_once() {
        let storage = Arc::new(MemoryStorage::new());
        let registry = ReplicaRegistry::new(storage.clone(), DEFAULT_CLOSE_GRACE);
        let id = page_id();

        let a = registry.subscribe(&id, ConnectionId(1)).await.unwrap();
        let b = registry.subscribe(&id, ConnectionId(2)).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.subscriber_count(), 2);
        assert_eq!(storage.load_calls(), 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_create_initial_seeds_new_documents() {
        struct SeedingStorage(MemoryStorage);
        impl crate::crdt::storage::DocStorage for SeedingStorage {
            fn load(&self, id: &DocumentId) -> Result<Option<Vec<u8>>> {
                self.0.load(id)
            }
            fn save(&self, id: &DocumentId, state: &[u8]) -> Result<()> {
                self.0.save(id, state)
            }
            fn create_initial(&self, _id: &DocumentId, replica: &ReplicaDoc) -> Result<()> {
                let text = replica.doc().get_or_insert_text("content");
                let mut txn = replica.doc().transact_mut();
                text.insert(&mut txn, 0, "seeded");
                Ok(())
            }
        }

        let storage = Arc::new(SeedingStorage(MemoryStorage::new()));
        let registry = ReplicaRegistry::new(storage, DEFAULT_CLOSE_GRACE);
        let id = page_id();

        let handle = registry.subscribe(&id, ConnectionId(1)).await.unwrap();
        let restored = ReplicaDoc::from_state(&handle.full_state().await).unwrap();
        let text = restored.doc().get_or_insert_text("content");
        let txn = restored.doc().transact();
        assert_eq!(text.get_string(&txn), "seeded");
    }

    #[tokio::test]
    async fn test_load_failure_is_fatal_to_subscribe() {
        struct BrokenStorage;
        impl crate::crdt::storage::DocStorage for BrokenStorage {
            fn load(&self, id: &DocumentId) -> Result<Option<Vec<u8>>> {
                Err(ArborError::storage(id.to_string(), "disk on fire"))
            }
            fn save(&self, _id: &DocumentId, _state: &[u8]) -> Result<()> {
                Ok(())
            }
        }

        let registry = ReplicaRegistry::new(Arc::new(BrokenStorage), DEFAULT_CLOSE_GRACE);
        let id = page_id();
        assert!(registry.subscribe(&id, ConnectionId(1)).await.is_err());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_update_broadcasts_with_origin() {
        let storage = Arc::new(MemoryStorage::new());
        let registry = ReplicaRegistry::new(storage, DEFAULT_CLOSE_GRACE);
        let id = page_id();

        let handle = registry.subscribe(&id, ConnectionId(1)).await.unwrap();
        registry.subscribe(&id, ConnectionId(2)).await.unwrap();
        let mut events = handle.subscribe_events();

        let delta = make_delta();
        handle
            .apply_update(&delta, UpdateOrigin::Remote(ConnectionId(1)))
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            ReplicaEvent::Update { origin, data } => {
                assert!(origin.is_from(ConnectionId(1)));
                assert!(!origin.is_from(ConnectionId(2)));
                assert_eq!(data, delta);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_block_broadcast() {
        struct FlakyStorage;
        impl crate::crdt::storage::DocStorage for FlakyStorage {
            fn load(&self, _id: &DocumentId) -> Result<Option<Vec<u8>>> {
                Ok(None)
            }
            fn save(&self, id: &DocumentId, _state: &[u8]) -> Result<()> {
                Err(ArborError::storage(id.to_string(), "write failed"))
            }
        }

        let registry = ReplicaRegistry::new(Arc::new(FlakyStorage), DEFAULT_CLOSE_GRACE);
        let id = page_id();
        let handle = registry.subscribe(&id, ConnectionId(1)).await.unwrap();
        let mut events = handle.subscribe_events();

        handle
            .apply_update(&make_delta(), UpdateOrigin::Local)
            .await
            .unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            ReplicaEvent::Update { .. }
        ));
    }

    #[tokio::test]
    async fn test_event_stream_taken_before_snapshot_covers_the_gap() {
        let storage = Arc::new(MemoryStorage::new());
        let registry = ReplicaRegistry::new(storage, DEFAULT_CLOSE_GRACE);
        let id = page_id();
        let handle = registry.subscribe(&id, ConnectionId(1)).await.unwrap();

        // A new subscriber takes its event stream first, then snapshots.
        // A delta merged in between must surface on the stream, since the
        // snapshot predates it and deltas are incremental.
        let mut events = handle.subscribe_events();
        let snapshot = handle.full_state().await;
        let delta = make_delta();
        handle
            .apply_update(&delta, UpdateOrigin::Remote(ConnectionId(2)))
            .await
            .unwrap();

        let data = match events.recv().await.unwrap() {
            ReplicaEvent::Update { data, .. } => data,
            other => panic!("unexpected event: {:?}", other),
        };
        let replica = ReplicaDoc::from_state(&snapshot).unwrap();
        replica.apply_update(&data).unwrap();
        assert_eq!(
            replica.encode_state_vector(),
            ReplicaDoc::from_state(&handle.full_state().await)
                .unwrap()
                .encode_state_vector()
        );
    }

    #[tokio::test]
    async fn test_rapid_updates_persist_newest_snapshot() {
        let storage = Arc::new(MemoryStorage::new());
        let registry = ReplicaRegistry::new(storage.clone(), DEFAULT_CLOSE_GRACE);
        let id = page_id();
        let handle = registry.subscribe(&id, ConnectionId(1)).await.unwrap();

        // Updates in quick succession queue overlapping save tasks.
        // Whatever order those run in, the stored snapshot must end up
        // being the newest one.
        let source = ReplicaDoc::new();
        let text = source.doc().get_or_insert_text("content");
        for word in ["one", "two", "three", "four"] {
            let sv = source.encode_state_vector();
            {
                let mut txn = source.doc().transact_mut();
                text.insert(&mut txn, 0, word);
            }
            let delta = source.encode_diff(&sv).unwrap();
            handle
                .apply_update(&delta, UpdateOrigin::Local)
                .await
                .unwrap();
        }
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        let stored = storage.load(&id).unwrap().unwrap();
        assert_eq!(
            ReplicaDoc::from_state(&stored).unwrap().encode_state_vector(),
            ReplicaDoc::from_state(&handle.full_state().await)
                .unwrap()
                .encode_state_vector()
        );
    }

    #[tokio::test]
    async fn test_flush_supersedes_pending_saves() {
        let storage = Arc::new(MemoryStorage::new());
        let registry = ReplicaRegistry::new(storage.clone(), DEFAULT_CLOSE_GRACE);
        let id = page_id();
        let handle = registry.subscribe(&id, ConnectionId(1)).await.unwrap();

        handle
            .apply_update(&make_delta(), UpdateOrigin::Local)
            .await
            .unwrap();
        // Flush before the spawned save ran; the save task must not roll
        // the stored snapshot back afterwards.
        handle.flush().await.unwrap();
        let flushed = storage.load(&id).unwrap().unwrap();

        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(storage.load(&id).unwrap().unwrap(), flushed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_reuse_skips_reload() {
        let storage = Arc::new(MemoryStorage::new());
        let registry = ReplicaRegistry::new(storage.clone(), Duration::from_secs(10));
        let id = page_id();

        let first = registry.subscribe(&id, ConnectionId(1)).await.unwrap();
        assert_eq!(storage.load_calls(), 1);
        registry.unsubscribe(&id, ConnectionId(1)).await;

        tokio::time::advance(Duration::from_secs(5)).await;
        let second = registry.subscribe(&id, ConnectionId(2)).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(storage.load_calls(), 1);

        // The cancelled close never fires, even well past the grace period.
        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;
        assert!(registry.get(&id).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_handle_closes_after_grace() {
        let storage = Arc::new(MemoryStorage::new());
        let registry = ReplicaRegistry::new(storage.clone(), Duration::from_secs(10));
        let id = page_id();

        registry.subscribe(&id, ConnectionId(1)).await.unwrap();
        registry.unsubscribe(&id, ConnectionId(1)).await;

        // Let the spawned deferred-close task register its sleep before the
        // clock is advanced.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(11)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(registry.get(&id).await.is_none());
        // The close flushed a final snapshot.
        assert!(storage.save_calls() >= 1);

        // A later subscribe reloads from storage.
        registry.subscribe(&id, ConnectionId(2)).await.unwrap();
        assert_eq!(storage.load_calls(), 2);
    }

    #[tokio::test]
    async fn test_presence_fanout_and_removal() {
        let storage = Arc::new(MemoryStorage::new());
        let registry = ReplicaRegistry::new(storage, DEFAULT_CLOSE_GRACE);
        let id = page_id();

        let handle = registry.subscribe(&id, ConnectionId(1)).await.unwrap();
        let mut events = handle.subscribe_events();

        let outcome = handle.apply_presence(ClientId(9), 1, Some(json!({"cursor": 4})));
        assert_eq!(outcome.added, vec![ClientId(9)]);
        assert!(matches!(
            events.recv().await.unwrap(),
            ReplicaEvent::Presence { client: ClientId(9), clock: 1, .. }
        ));

        assert_eq!(handle.presence_snapshot().len(), 1);

        let removal = handle.remove_peer(ClientId(9));
        assert_eq!(removal.removed, vec![ClientId(9)]);
        assert!(matches!(
            events.recv().await.unwrap(),
            ReplicaEvent::PeerRemoved { client: ClientId(9) }
        ));
        assert!(handle.presence_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_stale_presence_not_fanned_out() {
        let storage = Arc::new(MemoryStorage::new());
        let registry = ReplicaRegistry::new(storage, DEFAULT_CLOSE_GRACE);
        let id = page_id();

        let handle = registry.subscribe(&id, ConnectionId(1)).await.unwrap();
        handle.apply_presence(ClientId(9), 5, Some(json!({"a": 1})));
        let mut events = handle.subscribe_events();

        let outcome = handle.apply_presence(ClientId(9), 3, Some(json!({"a": 2})));
        assert!(!outcome.accepted);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_is_noop() {
        let storage = Arc::new(MemoryStorage::new());
        let registry = ReplicaRegistry::new(storage, DEFAULT_CLOSE_GRACE);
        registry.unsubscribe(&page_id(), ConnectionId(1)).await;
        assert!(registry.is_empty().await);
    }
}
