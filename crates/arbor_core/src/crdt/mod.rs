//! CRDT layer: replicated documents, the workspace tree, presence, and the
//! replica lifecycle registry.

mod awareness;
mod memory_storage;
mod priority;
mod registry;
mod replica;
mod storage;
mod tree;
mod types;

pub use awareness::{PresenceDelta, PresenceEntry, PresenceOutcome, PresenceTable};
pub use memory_storage::MemoryStorage;
pub use priority::{PriorityQueue, PriorityQueueBuilder};
pub use registry::{
    DEFAULT_CLOSE_GRACE, ReplicaEvent, ReplicaHandle, ReplicaRegistry,
};
pub use replica::ReplicaDoc;
pub use storage::{DocStorage, SharedStorage};
pub use tree::{ROOT_ID, ResolvedTree, TreeCrdt, TreeNodeJson};
pub use types::{ClientId, ConnectionId, DocumentId, UpdateOrigin};
