use thiserror::Error;

/// Common error type for arbor operations.
#[derive(Error, Debug)]
pub enum ArborError {
    /// IO error from the underlying filesystem or storage backend.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A document id string that does not belong to any known namespace.
    #[error("unknown document id: {0}")]
    UnknownDocumentId(String),

    /// An opaque update blob that could not be decoded.
    #[error("failed to decode update: {0}")]
    Codec(String),

    /// Storage backend failure for a specific document.
    #[error("storage error for '{doc}': {message}")]
    Storage {
        /// Document the operation was for.
        doc: String,
        /// Backend-provided description.
        message: String,
    },

    /// A tree operation referenced a node that does not exist.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// The root node cannot be moved or removed.
    #[error("the root node cannot be modified")]
    RootImmutable,

    /// A payload key that collides with tree bookkeeping.
    #[error("'{0}' is reserved for tree bookkeeping")]
    ReservedKey(String),
}

/// Result type alias using ArborError.
pub type Result<T> = std::result::Result<T, ArborError>;

impl ArborError {
    /// Convenience constructor for storage failures.
    pub fn storage(doc: impl Into<String>, message: impl std::fmt::Display) -> Self {
        ArborError::Storage {
            doc: doc.into(),
            message: message.to_string(),
        }
    }
}
