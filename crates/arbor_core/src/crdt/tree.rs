//! Tree CRDT for the workspace page hierarchy.
//!
//! This module provides [`TreeCrdt`], which wraps a yrs [`Doc`] holding a
//! single Y.Map called "pages". Each entry maps a node id to a nested map:
//!
//! ```text
//! Y.Doc
//! └── Y.Map "pages"
//!     ├── "a3f0..." → { "parent": { "__root": 3 }, "title": "\"Home\"" }
//!     ├── "9c1d..." → { "parent": { "a3f0...": 4, "__root": 1 }, ... }
//!     └── ...
//! ```
//!
//! The `"parent"` map records every parent a node has ever been assigned,
//! each tagged with the logical clock at assignment time. Candidates are
//! never deleted, so late-arriving concurrent writes can still be ranked.
//! All other keys are payload, stored as JSON-encoded strings.
//!
//! [`TreeCrdt::resolve`] derives the active tree from the candidate records.
//! It is a pure function of the record set: equal-priority candidates are
//! tie-broken lexicographically by parent id, so every replica resolves the
//! same structure from the same records no matter the delivery order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, In, Map, MapPrelim, MapRef, Out, ReadTxn, StateVector, Transact, Update};

use super::priority::PriorityQueueBuilder;
use crate::error::{ArborError, Result};

/// The name of the Y.Map containing node records.
const PAGES_MAP_NAME: &str = "pages";

/// Sentinel id of the tree root. The root has no node record.
pub const ROOT_ID: &str = "__root";

/// Reserved key inside each node record holding the parent-candidate map.
const PARENT_KEY: &str = "parent";

/// Snapshot of all node records: node id → (parent id → priority).
type CandidateRecords = BTreeMap<String, BTreeMap<String, i64>>;

/// The derived tree structure, rebuilt from the candidate records.
///
/// Never mutate this directly; all edits go through [`TreeCrdt`] record
/// writes and a rebuild.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedTree {
    /// Resolved parent per node. The root is not present.
    pub parent_of: HashMap<String, String>,
    /// Resolved children per node, sorted by id. Includes the root.
    pub children_of: HashMap<String, BTreeSet<String>>,
    /// Nodes with records that could not be attached under the root,
    /// including malformed records (missing or empty parent map). Sorted.
    pub unrooted: Vec<String>,
    /// Highest candidate priority seen across all records.
    pub max_clock: i64,
}

impl ResolvedTree {
    /// True if the node is part of the resolved tree.
    pub fn is_rooted(&self, id: &str) -> bool {
        id == ROOT_ID || self.parent_of.contains_key(id)
    }

    /// Children of the given node, sorted by id.
    pub fn children(&self, id: &str) -> Vec<String> {
        self.children_of
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Walk the resolved parent chain from `id` up to the root.
    pub fn ancestors(&self, id: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = id;
        while let Some(parent) = self.parent_of.get(current) {
            chain.push(parent.clone());
            current = parent;
        }
        chain
    }
}

/// One node of the JSON projection of the tree.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TreeNodeJson {
    /// Node id.
    pub id: String,
    /// Payload entries (everything except the parent bookkeeping).
    pub value: serde_json::Map<String, serde_json::Value>,
    /// Children sorted by id.
    pub children: Vec<TreeNodeJson>,
}

/// A CRDT document representing the workspace page tree.
pub struct TreeCrdt {
    /// The underlying yrs document
    doc: Doc,

    /// Reference to the pages map (cached for efficiency)
    pages: MapRef,

    /// Highest clock seen, advanced by one on every parent-candidate write
    max_clock: AtomicI64,

    /// Cached resolved structure, rebuilt after every mutation or merge
    structure: RwLock<ResolvedTree>,
}

impl TreeCrdt {
    /// Create a new empty tree.
    pub fn new() -> Self {
        let doc = Doc::new();
        let pages = doc.get_or_insert_map(PAGES_MAP_NAME);
        Self {
            doc,
            pages,
            max_clock: AtomicI64::new(0),
            structure: RwLock::new(ResolvedTree::default()),
        }
    }

    /// Reconstruct a tree from a full-state update blob.
    pub fn from_state(state: &[u8]) -> Result<Self> {
        let tree = Self::new();
        tree.apply_update(state)?;
        Ok(tree)
    }

    /// Get the underlying yrs document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    // ==================== Tree Operations ====================

    /// Add a node under `parent_id` with the given payload.
    ///
    /// The new record's only parent candidate is `(parent_id, clock)` where
    /// clock is the advanced global maximum. Returns the incremental update
    /// to forward to peers.
    pub fn add_child(
        &self,
        parent_id: &str,
        id: &str,
        payload: &[(String, serde_json::Value)],
    ) -> Result<Vec<u8>> {
        if !self.read_structure().is_rooted(parent_id) {
            return Err(ArborError::UnknownNode(parent_id.to_string()));
        }
        if payload.iter().any(|(key, _)| key == PARENT_KEY) {
            return Err(ArborError::ReservedKey(PARENT_KEY.to_string()));
        }

        let sv_before = self.state_vector();
        {
            let mut txn = self.doc.transact_mut();
            let clock = self.next_clock();

            let mut fields: Vec<(String, In)> = Vec::with_capacity(payload.len() + 1);
            fields.push((
                PARENT_KEY.to_string(),
                In::from(MapPrelim::from_iter([(
                    parent_id.to_string(),
                    Any::BigInt(clock),
                )])),
            ));
            for (key, value) in payload {
                fields.push((key.clone(), In::Any(Any::from(serde_json::to_string(value)?))));
            }

            self.pages
                .insert(&mut txn, id, MapPrelim::from_iter(fields));
        }

        self.refresh();
        Ok(self.update_since(&sv_before))
    }

    /// Move `id` under `new_parent`, breaking any cycle by promotion.
    ///
    /// If `new_parent` is currently a descendant of `id`, the child of `id`
    /// on the path toward `new_parent` is first given a candidate pointing
    /// at `id`'s old parent, so the structure stays acyclic after the move.
    /// Returns the incremental update to forward to peers.
    pub fn reparent(&self, id: &str, new_parent: &str) -> Result<Vec<u8>> {
        if id == ROOT_ID {
            return Err(ArborError::RootImmutable);
        }
        if new_parent == id {
            return Ok(Vec::new());
        }

        let structure = self.read_structure();
        let old_parent = structure
            .parent_of
            .get(id)
            .cloned()
            .ok_or_else(|| ArborError::UnknownNode(id.to_string()))?;
        if !structure.is_rooted(new_parent) {
            return Err(ArborError::UnknownNode(new_parent.to_string()));
        }

        let sv_before = self.state_vector();
        {
            let mut txn = self.doc.transact_mut();

            // Probe the ancestor chain of the new parent. If it passes
            // through `id`, the node right below `id` on that chain is
            // promoted into `id`'s old place.
            let mut probe = new_parent.to_string();
            while probe != ROOT_ID {
                let Some(probe_parent) = structure.parent_of.get(&probe) else {
                    break;
                };
                if probe_parent == id {
                    let clock = self.next_clock();
                    self.set_candidate(&mut txn, &probe, &old_parent, clock)?;
                    break;
                }
                probe = probe_parent.clone();
            }

            let clock = self.next_clock();
            self.set_candidate(&mut txn, id, new_parent, clock)?;
        }

        self.refresh();
        Ok(self.update_since(&sv_before))
    }

    /// Remove a node record and all records of its resolved descendants.
    ///
    /// Returns the removed ids and the incremental update to forward.
    pub fn remove_subtree(&self, id: &str) -> Result<(Vec<String>, Vec<u8>)> {
        if id == ROOT_ID {
            return Err(ArborError::RootImmutable);
        }
        let structure = self.read_structure();
        if !structure.is_rooted(id) {
            return Err(ArborError::UnknownNode(id.to_string()));
        }

        let mut removed = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            stack.extend(structure.children(&current));
            removed.push(current);
        }

        let sv_before = self.state_vector();
        {
            let mut txn = self.doc.transact_mut();
            for node in &removed {
                self.pages.remove(&mut txn, node);
            }
        }

        self.refresh();
        let update = self.update_since(&sv_before);
        Ok((removed, update))
    }

    /// Set a payload value on a node. The `"parent"` key is reserved.
    ///
    /// Returns the incremental update to forward to peers.
    pub fn set_value(&self, id: &str, key: &str, value: &serde_json::Value) -> Result<Vec<u8>> {
        if key == PARENT_KEY {
            return Err(ArborError::ReservedKey(key.to_string()));
        }

        let sv_before = self.state_vector();
        {
            let mut txn = self.doc.transact_mut();
            let node = match self.pages.get(&txn, id) {
                Some(Out::YMap(node)) => node,
                _ => return Err(ArborError::UnknownNode(id.to_string())),
            };
            node.insert(&mut txn, key, serde_json::to_string(value)?);
        }

        Ok(self.update_since(&sv_before))
    }

    /// Get a payload value from a node.
    pub fn get_value(&self, id: &str, key: &str) -> Option<serde_json::Value> {
        if key == PARENT_KEY {
            return None;
        }
        let txn = self.doc.transact();
        let node = match self.pages.get(&txn, id) {
            Some(Out::YMap(node)) => node,
            _ => return None,
        };
        match node.get(&txn, key) {
            Some(Out::Any(Any::String(json))) => serde_json::from_str(&json).ok(),
            _ => None,
        }
    }

    /// True if a record exists for the node.
    pub fn contains(&self, id: &str) -> bool {
        let txn = self.doc.transact();
        self.pages.get(&txn, id).is_some()
    }

    /// Number of node records (not counting the root).
    pub fn node_count(&self) -> usize {
        let txn = self.doc.transact();
        self.pages.len(&txn) as usize
    }

    /// Resolved parent of a node, if it is rooted.
    pub fn parent_of(&self, id: &str) -> Option<String> {
        self.read_structure().parent_of.get(id).cloned()
    }

    /// Resolved children of a node, sorted by id.
    pub fn children_of(&self, id: &str) -> Vec<String> {
        self.read_structure().children(id)
    }

    /// Clone of the cached resolved structure.
    pub fn structure(&self) -> ResolvedTree {
        self.read_structure()
    }

    /// Project the resolved tree into a JSON structure, children sorted by
    /// id. The projection is read-only; edits go through the tree API.
    pub fn to_json_structure(&self) -> Vec<TreeNodeJson> {
        let structure = self.read_structure();
        self.json_children(&structure, ROOT_ID)
    }

    fn json_children(&self, structure: &ResolvedTree, id: &str) -> Vec<TreeNodeJson> {
        structure
            .children(id)
            .into_iter()
            .map(|child| TreeNodeJson {
                value: self.payload_of(&child),
                children: self.json_children(structure, &child),
                id: child,
            })
            .collect()
    }

    /// All payload entries of a node (everything except the parent map).
    pub fn payload_of(&self, id: &str) -> serde_json::Map<String, serde_json::Value> {
        let txn = self.doc.transact();
        let mut payload = serde_json::Map::new();
        let node = match self.pages.get(&txn, id) {
            Some(Out::YMap(node)) => node,
            _ => return payload,
        };
        for (key, value) in node.iter(&txn) {
            if key == PARENT_KEY {
                continue;
            }
            if let Out::Any(Any::String(json)) = value {
                if let Ok(parsed) = serde_json::from_str(&json) {
                    payload.insert(key.to_string(), parsed);
                }
            }
        }
        payload
    }

    // ==================== Resolution ====================

    /// Rebuild the resolved structure from the current records.
    pub fn refresh(&self) -> ResolvedTree {
        let records = self.snapshot_records();
        let resolved = resolve_records(&records);
        self.max_clock.fetch_max(resolved.max_clock, Ordering::SeqCst);
        if let Ok(mut cached) = self.structure.write() {
            *cached = resolved.clone();
        }
        resolved
    }

    fn read_structure(&self) -> ResolvedTree {
        self.structure
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn snapshot_records(&self) -> CandidateRecords {
        let txn = self.doc.transact();
        let mut records = CandidateRecords::new();
        for (id, value) in self.pages.iter(&txn) {
            let mut candidates = BTreeMap::new();
            if let Out::YMap(node) = value {
                if let Some(Out::YMap(parents)) = node.get(&txn, PARENT_KEY) {
                    for (parent, priority) in parents.iter(&txn) {
                        let priority = match priority {
                            Out::Any(Any::BigInt(p)) => p,
                            Out::Any(Any::Number(p)) => p as i64,
                            _ => continue,
                        };
                        candidates.insert(parent.to_string(), priority);
                    }
                }
            }
            records.insert(id.to_string(), candidates);
        }
        records
    }

    fn next_clock(&self) -> i64 {
        self.max_clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Write a parent candidate on an existing node record.
    fn set_candidate(
        &self,
        txn: &mut yrs::TransactionMut<'_>,
        id: &str,
        parent: &str,
        clock: i64,
    ) -> Result<()> {
        let node = match self.pages.get(&*txn, id) {
            Some(Out::YMap(node)) => node,
            _ => return Err(ArborError::UnknownNode(id.to_string())),
        };
        let parents = match node.get(&*txn, PARENT_KEY) {
            Some(Out::YMap(parents)) => parents,
            _ => return Err(ArborError::UnknownNode(id.to_string())),
        };
        parents.insert(txn, parent, Any::BigInt(clock));
        Ok(())
    }

    // ==================== Sync Operations ====================

    /// Encode the current state vector for the sync handshake.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode_v1()
    }

    /// Encode the full document state as an update blob.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode only the updates a remote peer is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| ArborError::Codec(format!("failed to decode state vector: {}", e)))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Merge an update from a peer and rebuild the resolved structure.
    pub fn apply_update(&self, update: &[u8]) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| ArborError::Codec(format!("failed to decode update: {}", e)))?;
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| ArborError::Codec(format!("failed to apply update: {}", e)))?;
        }
        self.refresh();
        Ok(())
    }

    fn state_vector(&self) -> StateVector {
        let txn = self.doc.transact();
        txn.state_vector()
    }

    fn update_since(&self, sv_before: &StateVector) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(sv_before)
    }
}

impl Default for TreeCrdt {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TreeCrdt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeCrdt")
            .field("node_count", &self.node_count())
            .field("max_clock", &self.max_clock.load(Ordering::SeqCst))
            .finish()
    }
}

/// Resolve the active tree from a full set of candidate records.
///
/// Idempotent and side-effect-free: the output depends only on the record
/// set, not on the order records were written or supplied.
fn resolve_records(records: &CandidateRecords) -> ResolvedTree {
    let mut max_clock = 0i64;

    // Group nodes under their current (highest-priority) candidate parent.
    let mut pending: HashMap<String, BTreeSet<String>> = HashMap::new();
    let mut unrooted: BTreeSet<String> = BTreeSet::new();

    for (id, candidates) in records {
        for &priority in candidates.values() {
            max_clock = max_clock.max(priority);
        }
        match current_candidate(candidates) {
            Some(parent) => {
                pending.entry(parent.to_string()).or_default().insert(id.clone());
                unrooted.insert(id.clone());
            }
            None => {
                log::warn!("ignoring node '{}' with no parent candidates", id);
                unrooted.insert(id.clone());
            }
        }
    }

    let mut tree = ResolvedTree {
        max_clock,
        ..ResolvedTree::default()
    };
    tree.children_of.insert(ROOT_ID.to_string(), BTreeSet::new());

    // Attach everything reachable from the root through current candidates.
    attach_recursively(ROOT_ID, &mut pending, &mut unrooted, &mut tree);

    // Retry the rest against every candidate, highest priority first.
    let mut builder = PriorityQueueBuilder::new();
    for id in &unrooted {
        if let Some(candidates) = records.get(id) {
            for (parent, &priority) in candidates {
                builder.add_entry(priority, (id.clone(), parent.clone()));
            }
        }
    }
    for (_, (child, parent)) in builder.build() {
        if tree.is_rooted(&parent) && !tree.is_rooted(&child) {
            attach(&child, &parent, &mut unrooted, &mut tree);
            attach_recursively(&child, &mut pending, &mut unrooted, &mut tree);
        }
    }

    if !unrooted.is_empty() {
        log::warn!("nodes left unrooted after resolution: {:?}", unrooted);
    }
    tree.unrooted = unrooted.into_iter().collect();
    tree
}

/// Pick the current candidate: highest priority, ties broken by the
/// lexicographically smaller parent id.
fn current_candidate(candidates: &BTreeMap<String, i64>) -> Option<&str> {
    let mut best: Option<(&str, i64)> = None;
    for (parent, &priority) in candidates {
        // Ascending key order, so strict `>` keeps the smaller id on ties.
        if best.is_none_or(|(_, p)| priority > p) {
            best = Some((parent, priority));
        }
    }
    best.map(|(parent, _)| parent)
}

fn attach(
    child: &str,
    parent: &str,
    unrooted: &mut BTreeSet<String>,
    tree: &mut ResolvedTree,
) {
    tree.parent_of.insert(child.to_string(), parent.to_string());
    tree.children_of
        .entry(parent.to_string())
        .or_default()
        .insert(child.to_string());
    tree.children_of.entry(child.to_string()).or_default();
    unrooted.remove(child);
}

fn attach_recursively(
    id: &str,
    pending: &mut HashMap<String, BTreeSet<String>>,
    unrooted: &mut BTreeSet<String>,
    tree: &mut ResolvedTree,
) {
    let Some(children) = pending.remove(id) else {
        return;
    };
    for child in children {
        if tree.is_rooted(&child) {
            continue;
        }
        attach(&child, id, unrooted, tree);
        attach_recursively(&child, pending, unrooted, tree);
    }
}
