//! Token authentication for WebSocket connections.

use std::collections::HashMap;
use std::sync::Arc;

use arbor_core::messages::Permission;

use crate::config::TokenEntry;

/// Identity and rights resolved from a presented token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub username: String,
    pub permission: Permission,
}

/// Resolves a bearer token to an identity, or rejects it.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<AuthInfo>;
}

/// Shared authenticator handle.
pub type SharedAuthenticator = Arc<dyn Authenticator>;

/// Authenticator backed by the static token list from `ARBOR_TOKENS`.
#[derive(Debug, Default)]
pub struct StaticTokenAuth {
    tokens: HashMap<String, AuthInfo>,
}

impl StaticTokenAuth {
    pub fn new(entries: &[TokenEntry]) -> Self {
        let tokens = entries
            .iter()
            .map(|entry| {
                let permission = if entry.read_write {
                    Permission::ReadWrite
                } else {
                    Permission::ReadOnly
                };
                (
                    entry.token.clone(),
                    AuthInfo {
                        username: entry.username.clone(),
                        permission,
                    },
                )
            })
            .collect();
        Self { tokens }
    }
}

impl Authenticator for StaticTokenAuth {
    fn authenticate(&self, token: &str) -> Option<AuthInfo> {
        self.tokens.get(token).cloned()
    }
}
