//! Client-side sync: per-document status tracking and the protocol session.

mod client;
mod status;

pub use client::SyncSession;
pub use status::SyncStatus;
