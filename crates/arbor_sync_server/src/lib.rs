//! Arbor Sync Server
//!
//! Real-time sync server for Arbor collaborative workspaces.
//!
//! ## Features
//!
//! - **Real-time sync**: WebSocket JSON protocol over arbor_core's CRDT replicas
//! - **Presence**: per-document awareness relayed between connected clients
//! - **Persistent storage**: file-per-document state under a data directory
//! - **Token authentication**: static token list with read-only/read-write rights
//!
//! ## Environment Variables
//!
//! - `HOST`: Server host (default: 0.0.0.0)
//! - `PORT`: Server port (default: 3030)
//! - `DATA_DIR`: Directory for persisted document state (default: ./arbor_data)
//! - `CLOSE_GRACE_SECS`: Idle replica grace period in seconds (default: 10)
//! - `CORS_ORIGINS`: Comma-separated list of allowed origins
//! - `ARBOR_TOKENS`: Comma-separated `token:username:rw|ro` entries

pub mod auth;
pub mod config;
pub mod handlers;
pub mod store;

pub use config::Config;
