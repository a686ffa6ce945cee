//! Core identifier types for the sync system.
//!
//! Documents live in typed namespaces encoded as string ids on the wire
//! (`"global"`, `"page:<uuid>"`, `"calendar-archive:<year>:<month>"`).
//! Connections and awareness clients are plain numeric ids.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ArborError;

/// Identifier of a replicated document, parsed from its wire string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DocumentId {
    /// The single workspace document holding the page tree and attributes.
    Global,
    /// A page body document, keyed by UUID.
    Page(uuid::Uuid),
    /// A month of archived calendar events.
    CalendarArchive {
        /// Four-digit year.
        year: i32,
        /// 1-based month, 1-12.
        month: u32,
    },
}

impl DocumentId {
    /// Generate a fresh page document id.
    pub fn new_page() -> Self {
        DocumentId::Page(uuid::Uuid::new_v4())
    }

    /// Short namespace label, used for storage dispatch and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            DocumentId::Global => "global",
            DocumentId::Page(_) => "page",
            DocumentId::CalendarArchive { .. } => "calendar-archive",
        }
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentId::Global => write!(f, "global"),
            DocumentId::Page(id) => write!(f, "page:{}", id),
            DocumentId::CalendarArchive { year, month } => {
                write!(f, "calendar-archive:{}:{}", year, month)
            }
        }
    }
}

impl FromStr for DocumentId {
    type Err = ArborError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "global" {
            return Ok(DocumentId::Global);
        }
        if let Some(rest) = s.strip_prefix("page:") {
            let id = uuid::Uuid::parse_str(rest)
                .map_err(|_| ArborError::UnknownDocumentId(s.to_string()))?;
            return Ok(DocumentId::Page(id));
        }
        if let Some(rest) = s.strip_prefix("calendar-archive:") {
            let mut parts = rest.splitn(2, ':');
            let year = parts.next().and_then(|y| {
                // Four digits, matching the original id format.
                (y.len() == 4).then(|| y.parse::<i32>().ok()).flatten()
            });
            let month = parts.next().and_then(|m| {
                (!m.is_empty() && m.len() <= 2)
                    .then(|| m.parse::<u32>().ok())
                    .flatten()
            });
            if let (Some(year), Some(month)) = (year, month) {
                if (1..=12).contains(&month) {
                    return Ok(DocumentId::CalendarArchive { year, month });
                }
            }
            return Err(ArborError::UnknownDocumentId(s.to_string()));
        }
        Err(ArborError::UnknownDocumentId(s.to_string()))
    }
}

impl TryFrom<String> for DocumentId {
    type Error = ArborError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DocumentId> for String {
    fn from(id: DocumentId) -> String {
        id.to_string()
    }
}

/// Identifier for one subscriber of a replica.
///
/// On the server this is a WebSocket connection; on the client it is a local
/// consumer (an editor view, a calendar pane). Origin filtering during event
/// fan-out relies on these being unique per registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identifier for an awareness participant, chosen by the client at connect
/// time and scoped to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Origin of an applied CRDT delta, attached when the delta is merged and
/// carried through event fan-out so subscribers can skip their own writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Produced by this process (server-internal mutation or local user edit).
    Local,
    /// Received from the given subscriber connection.
    Remote(ConnectionId),
    /// Applied while loading persisted state.
    Sync,
}

impl UpdateOrigin {
    /// True if this delta came from the given connection.
    pub fn is_from(&self, conn: ConnectionId) -> bool {
        matches!(self, UpdateOrigin::Remote(c) if *c == conn)
    }
}

impl fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateOrigin::Local => write!(f, "local"),
            UpdateOrigin::Remote(conn) => write!(f, "remote:{}", conn.0),
            UpdateOrigin::Sync => write!(f, "sync"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_roundtrip() {
        let global: DocumentId = "global".parse().unwrap();
        assert_eq!(global, DocumentId::Global);
        assert_eq!(global.to_string(), "global");

        let page_str = format!("page:{}", uuid::Uuid::new_v4());
        let page: DocumentId = page_str.parse().unwrap();
        assert_eq!(page.to_string(), page_str);

        let archive: DocumentId = "calendar-archive:2026:3".parse().unwrap();
        assert_eq!(
            archive,
            DocumentId::CalendarArchive {
                year: 2026,
                month: 3
            }
        );
        assert_eq!(archive.to_string(), "calendar-archive:2026:3");
    }

    #[test]
    fn test_document_id_rejects_unknown_namespace() {
        assert!("settings:abc".parse::<DocumentId>().is_err());
        assert!("".parse::<DocumentId>().is_err());
        assert!("page:not-a-uuid".parse::<DocumentId>().is_err());
    }

    #[test]
    fn test_calendar_archive_validation() {
        assert!("calendar-archive:2026:13".parse::<DocumentId>().is_err());
        assert!("calendar-archive:26:1".parse::<DocumentId>().is_err());
        assert!("calendar-archive:2026:".parse::<DocumentId>().is_err());
        assert!("calendar-archive:2026".parse::<DocumentId>().is_err());
        assert!("calendar-archive:2026:12".parse::<DocumentId>().is_ok());
        assert!("calendar-archive:2026:1".parse::<DocumentId>().is_ok());
    }

    #[test]
    fn test_document_id_serde_as_string() {
        let id = DocumentId::CalendarArchive {
            year: 2025,
            month: 11,
        };
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"calendar-archive:2025:11\"");
        let back: DocumentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_update_origin_filtering() {
        let origin = UpdateOrigin::Remote(ConnectionId(7));
        assert!(origin.is_from(ConnectionId(7)));
        assert!(!origin.is_from(ConnectionId(8)));
        assert!(!UpdateOrigin::Local.is_from(ConnectionId(7)));
    }
}
