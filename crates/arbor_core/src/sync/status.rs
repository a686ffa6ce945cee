//! Per-document sync status and the aggregate across open documents.

use std::fmt;

/// Connection/sync state of one open document.
///
/// Variants are ordered by severity, so the aggregate status across open
/// documents is simply the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SyncStatus {
    /// Not opened, or closed again.
    #[default]
    None,
    /// Fully caught up with the server.
    Synced,
    /// Local mutations exist that the server has not yet echoed back.
    UnsyncedChanges,
    /// Waiting for the initial sync.
    Connecting,
    /// The transport dropped; a reconnect may recover.
    Disconnected,
    /// Authentication was rejected. Terminal until an explicit reconnect.
    Error,
}

impl SyncStatus {
    /// The document is being opened.
    pub fn begin_connecting(&mut self) {
        if *self != SyncStatus::Error {
            *self = SyncStatus::Connecting;
        }
    }

    /// The initial sync for the document completed.
    pub fn initial_synced(&mut self) {
        if *self == SyncStatus::Connecting {
            *self = SyncStatus::Synced;
        }
    }

    /// A local mutation was made that the server has not yet acknowledged.
    pub fn local_mutation(&mut self) {
        if *self == SyncStatus::Synced {
            *self = SyncStatus::UnsyncedChanges;
        }
    }

    /// A server-originated delta for the document arrived.
    pub fn server_delta(&mut self) {
        if *self == SyncStatus::UnsyncedChanges {
            *self = SyncStatus::Synced;
        }
    }

    /// The transport failed.
    pub fn transport_failed(&mut self) {
        if *self != SyncStatus::Error {
            *self = SyncStatus::Disconnected;
        }
    }

    /// The server rejected this session's credentials.
    pub fn auth_rejected(&mut self) {
        *self = SyncStatus::Error;
    }

    /// Explicit reconnect, the only exit from [`SyncStatus::Error`].
    pub fn reconnect(&mut self) {
        *self = SyncStatus::Connecting;
    }

    /// Maximum-severity status among the given statuses.
    pub fn aggregate(statuses: impl IntoIterator<Item = SyncStatus>) -> SyncStatus {
        statuses
            .into_iter()
            .max()
            .unwrap_or(SyncStatus::None)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncStatus::None => "none",
            SyncStatus::Synced => "synced",
            SyncStatus::UnsyncedChanges => "unsynced-changes",
            SyncStatus::Connecting => "connecting",
            SyncStatus::Disconnected => "disconnected",
            SyncStatus::Error => "error",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut status = SyncStatus::None;
        status.begin_connecting();
        assert_eq!(status, SyncStatus::Connecting);
        status.initial_synced();
        assert_eq!(status, SyncStatus::Synced);
        status.local_mutation();
        assert_eq!(status, SyncStatus::UnsyncedChanges);
        status.server_delta();
        assert_eq!(status, SyncStatus::Synced);
    }

    #[test]
    fn test_local_mutation_only_from_synced() {
        let mut status = SyncStatus::Connecting;
        status.local_mutation();
        assert_eq!(status, SyncStatus::Connecting);
    }

    #[test]
    fn test_error_is_terminal_until_reconnect() {
        let mut status = SyncStatus::Synced;
        status.auth_rejected();
        assert_eq!(status, SyncStatus::Error);

        status.begin_connecting();
        assert_eq!(status, SyncStatus::Error);
        status.transport_failed();
        assert_eq!(status, SyncStatus::Error);

        status.reconnect();
        assert_eq!(status, SyncStatus::Connecting);
    }

    #[test]
    fn test_transport_failure_from_any_live_state() {
        for start in [
            SyncStatus::Connecting,
            SyncStatus::Synced,
            SyncStatus::UnsyncedChanges,
        ] {
            let mut status = start;
            status.transport_failed();
            assert_eq!(status, SyncStatus::Disconnected);
        }
    }

    #[test]
    fn test_aggregate_is_maximum_severity() {
        assert_eq!(SyncStatus::aggregate([]), SyncStatus::None);
        assert_eq!(
            SyncStatus::aggregate([SyncStatus::Synced, SyncStatus::Synced]),
            SyncStatus::Synced
        );
        assert_eq!(
            SyncStatus::aggregate([
                SyncStatus::Synced,
                SyncStatus::UnsyncedChanges,
                SyncStatus::Connecting
            ]),
            SyncStatus::Connecting
        );
        assert_eq!(
            SyncStatus::aggregate([SyncStatus::Disconnected, SyncStatus::Error]),
            SyncStatus::Error
        );
    }
}
