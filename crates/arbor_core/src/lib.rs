#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// CRDT layer: tree, presence, replicas, and the lifecycle registry
pub mod crdt;

/// Error (common error types)
pub mod error;

/// Wire protocol messages
pub mod messages;

/// Client-side sync session and status
pub mod sync;
