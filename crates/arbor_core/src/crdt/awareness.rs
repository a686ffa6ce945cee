//! Ephemeral per-document presence (awareness) state.
//!
//! Each document carries a table of client states (cursor positions, peer
//! info) keyed by client id. Entries are ranked by a logical clock with
//! last-writer-wins resolution; an entry whose state has been set to `None`
//! after being live is a "departed" marker, kept so the clock stays known.
//!
//! The table protects the local client: a remote write that would delete the
//! local client's own live state is never applied as a deletion. Instead the
//! local clock is advanced past the offender and the live state is handed
//! back for republication.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::broadcast;

use super::types::ClientId;

/// One client's presence record.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    /// Logical clock of the last accepted write.
    pub clock: i64,
    /// Current state; `None` means the client departed.
    pub state: Option<Value>,
    /// Wall-clock timestamp (ms) of the last accepted write.
    pub last_updated: i64,
}

/// Classified effect of accepted presence writes, fanned out to listeners.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceDelta {
    /// Clients seen for the first time with a live state.
    pub added: Vec<ClientId>,
    /// Clients whose state was overwritten.
    pub updated: Vec<ClientId>,
    /// Clients whose live state was removed.
    pub removed: Vec<ClientId>,
}

impl PresenceDelta {
    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Result of applying one presence write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceOutcome {
    /// Whether the write was accepted (stale writes are silently ignored).
    pub accepted: bool,
    /// Client newly added with a live state.
    pub added: Vec<ClientId>,
    /// Client whose state was overwritten (including no-op overwrites).
    pub updated: Vec<ClientId>,
    /// Subset of `updated` whose state actually differs from before.
    pub filtered_updated: Vec<ClientId>,
    /// Client whose live state was removed.
    pub removed: Vec<ClientId>,
    /// Set when self-protection kicked in: the (clock, state) to rebroadcast
    /// so peers learn the local client is still here.
    pub republish: Option<(i64, Value)>,
}

/// Per-document table of ephemeral client states.
pub struct PresenceTable {
    /// The client id this process publishes under, if any. The server-side
    /// table has no local client.
    local_client: Option<ClientId>,
    entries: HashMap<ClientId, PresenceEntry>,
    /// Fires for effective changes only (`updated` filtered by deep equality).
    change_tx: broadcast::Sender<PresenceDelta>,
    /// Fires for every accepted write, including no-op overwrites, so
    /// heartbeat/liveness consumers see them all.
    update_tx: broadcast::Sender<PresenceDelta>,
}

impl PresenceTable {
    /// Create a table. `local_client` enables self-protection for that id.
    pub fn new(local_client: Option<ClientId>) -> Self {
        let (change_tx, _) = broadcast::channel(64);
        let (update_tx, _) = broadcast::channel(64);
        Self {
            local_client,
            entries: HashMap::new(),
            change_tx,
            update_tx,
        }
    }

    /// Subscribe to effective-change notifications.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<PresenceDelta> {
        self.change_tx.subscribe()
    }

    /// Subscribe to all-accepted-write notifications.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<PresenceDelta> {
        self.update_tx.subscribe()
    }

    /// Apply a presence write.
    ///
    /// Accepted iff the clock is newer than the stored one, or it equals the
    /// stored clock and confirms an already-departed entry (the idempotent
    /// removal echo). Stale writes are ignored without error.
    pub fn apply(&mut self, client: ClientId, clock: i64, state: Option<Value>) -> PresenceOutcome {
        self.apply_inner(client, clock, state, false)
    }

    /// Remove a peer on the document's authority (e.g. its connection
    /// closed). Keeps the stored clock so the peer's own next write is not
    /// rejected as stale when it reconnects.
    pub fn remove_peer(&mut self, client: ClientId) -> PresenceOutcome {
        match self.entries.get(&client) {
            Some(entry) if entry.state.is_some() => {
                let clock = entry.clock;
                self.apply_inner(client, clock, None, true)
            }
            _ => PresenceOutcome::default(),
        }
    }

    fn apply_inner(
        &mut self,
        client: ClientId,
        clock: i64,
        state: Option<Value>,
        force: bool,
    ) -> PresenceOutcome {
        let mut outcome = PresenceOutcome::default();
        let timestamp = chrono::Utc::now().timestamp_millis();

        let prev = self.entries.get(&client);
        let stored_clock = prev.map_or(0, |e| e.clock);
        let prev_state = prev.and_then(|e| e.state.clone());

        // Self-protection: never let a removal erase our own live state.
        if self.local_client == Some(client) && state.is_none() {
            if let Some(live) = prev_state {
                let new_clock = stored_clock.max(clock) + 1;
                self.entries.insert(
                    client,
                    PresenceEntry {
                        clock: new_clock,
                        state: Some(live.clone()),
                        last_updated: timestamp,
                    },
                );
                outcome.republish = Some((new_clock, live));
                return outcome;
            }
        }

        let confirms_departure =
            clock == stored_clock && state.is_none() && prev.is_some_and(|e| e.state.is_none());
        if !(clock > stored_clock || confirms_departure || force) {
            return outcome;
        }
        outcome.accepted = true;

        let had_entry = prev.is_some();
        let was_live = prev.is_some_and(|e| e.state.is_some());
        self.entries.insert(
            client,
            PresenceEntry {
                clock,
                state: state.clone(),
                last_updated: timestamp,
            },
        );

        match (&state, had_entry, was_live) {
            (Some(_), false, _) => outcome.added.push(client),
            (None, true, true) => outcome.removed.push(client),
            (Some(new_state), true, _) => {
                // Deep equality, so no-op overwrites don't fire `change`.
                if prev_state.as_ref() != Some(new_state) {
                    outcome.filtered_updated.push(client);
                }
                outcome.updated.push(client);
            }
            // Departure confirms and removals of never-live entries.
            // (`was_live` implies `had_entry`, so this only adds the
            // unreachable `(None, false, true)` case.)
            (None, _, _) => {}
        }

        let change = PresenceDelta {
            added: outcome.added.clone(),
            updated: outcome.filtered_updated.clone(),
            removed: outcome.removed.clone(),
        };
        if !change.is_empty() {
            let _ = self.change_tx.send(change);
        }
        let update = PresenceDelta {
            added: outcome.added.clone(),
            updated: outcome.updated.clone(),
            removed: outcome.removed.clone(),
        };
        if !update.is_empty() {
            let _ = self.update_tx.send(update);
        }

        outcome
    }

    /// Publish a new state for the local client, advancing its clock.
    ///
    /// Returns the clock to attach to the outbound presence message, or
    /// `None` if the table has no local client.
    pub fn publish_local(&mut self, state: Value) -> Option<i64> {
        let client = self.local_client?;
        let clock = self.entries.get(&client).map_or(0, |e| e.clock) + 1;
        self.apply_inner(client, clock, Some(state), false);
        Some(clock)
    }

    /// The client id this table publishes under.
    pub fn local_client(&self) -> Option<ClientId> {
        self.local_client
    }

    /// The stored entry for a client, live or departed.
    pub fn entry(&self, client: ClientId) -> Option<&PresenceEntry> {
        self.entries.get(&client)
    }

    /// The live state for a client.
    pub fn state(&self, client: ClientId) -> Option<&Value> {
        self.entries.get(&client).and_then(|e| e.state.as_ref())
    }

    /// All live entries as `(client, clock, state)`, for replaying presence
    /// to a newly subscribed connection. Sorted by client id.
    pub fn live_states(&self) -> Vec<(ClientId, i64, Value)> {
        let mut states: Vec<_> = self
            .entries
            .iter()
            .filter_map(|(client, entry)| {
                entry
                    .state
                    .as_ref()
                    .map(|state| (*client, entry.clock, state.clone()))
            })
            .collect();
        states.sort_by_key(|(client, _, _)| *client);
        states
    }

    /// Number of live (non-departed) clients.
    pub fn live_count(&self) -> usize {
        self.entries.values().filter(|e| e.state.is_some()).count()
    }
}

impl std::fmt::Debug for PresenceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTable")
            .field("local_client", &self.local_client)
            .field("entries", &self.entries.len())
            .field("live", &self.live_count())
            .finish()
    }
}
