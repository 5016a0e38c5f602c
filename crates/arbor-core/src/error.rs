//! Error types for Arbor

use thiserror::Error;

use crate::{ObjectId, PeerId, VersionId};

/// Core Arbor errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArborError {
    // Version store errors
    #[error("Cannot insert version {version}: parent {parent} not found in history (known: {known:?})")]
    MissingParent {
        version: VersionId,
        parent: VersionId,
        known: Vec<VersionId>,
    },

    #[error("Cannot insert version {version}: history has no root")]
    Unrooted { version: VersionId },

    #[error("Cannot insert root version {version}: history already rooted at {root:?}")]
    SecondRoot {
        version: VersionId,
        root: Option<VersionId>,
    },

    // Object errors
    #[error("Unknown object: {0}")]
    UnknownObject(ObjectId),

    // Patch errors
    #[error("Invalid key path: {0:?}")]
    InvalidPath(String),

    #[error("Cannot write through non-object value at {path}")]
    NotAnObject { path: String },

    // Wire errors
    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    #[error("Buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    #[error("Unknown message kind: {0}")]
    UnknownMessageKind(u8),

    #[error("Frame too large: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Serialization failed: {0}")]
    Serialization(String),

    // Transport errors
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),
}

impl ArborError {
    /// Insertion referenced a missing parent, an unrooted history, or a
    /// second root
    pub fn is_invalid_version(&self) -> bool {
        matches!(
            self,
            ArborError::MissingParent { .. }
                | ArborError::Unrooted { .. }
                | ArborError::SecondRoot { .. }
        )
    }

    /// The failed insertion may succeed later, once more versions arrive or
    /// local history collapses
    pub fn is_retryable(&self) -> bool {
        self.is_invalid_version()
    }
}

impl From<serde_json::Error> for ArborError {
    fn from(e: serde_json::Error) -> Self {
        ArborError::Serialization(e.to_string())
    }
}

/// Result type for Arbor operations
pub type ArborResult<T> = Result<T, ArborError>;
