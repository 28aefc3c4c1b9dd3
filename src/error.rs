//! Typed error hierarchy for lanswarm
//!
//! Every error type includes context about what went wrong and whether
//! the operation can be retried. Nothing in here is fatal to the protocol
//! loops: receive, heartbeat and reaper tasks log and carry on.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the swarm engine
#[derive(Debug, Error)]
pub enum SwarmError {
    /// Malformed or unrecognized datagram
    #[error("Format error: {message}")]
    Format { message: String },

    /// Socket-level errors (bind, send, receive, group membership)
    #[error("Network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
        retryable: bool,
    },

    /// Storage/filesystem errors
    #[error("Storage error at {path:?}: {message}")]
    Storage {
        kind: StorageErrorKind,
        path: PathBuf,
        message: String,
    },

    /// Protocol-level errors (descriptors, pieces)
    #[error("Protocol error: {message}")]
    Protocol {
        kind: ProtocolErrorKind,
        message: String,
    },

    /// Invalid input from the operator or configuration
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Torrent, file or peer not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Engine is shutting down
    #[error("Engine is shutting down")]
    Shutdown,

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Could not bind a socket
    Bind,
    /// Could not join or configure the multicast group
    Multicast,
    /// Datagram could not be sent
    Send,
    /// Datagram could not be received
    Receive,
    /// Local address could not be determined
    LocalAddress,
}

/// Storage error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// File/directory not found
    NotFound,
    /// Permission denied
    PermissionDenied,
    /// Path is outside the torrent's root (security)
    PathTraversal,
    /// File already exists
    AlreadyExists,
    /// Invalid path
    InvalidPath,
    /// I/O error
    Io,
}

/// Protocol error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Descriptor text could not be parsed
    InvalidDescriptor,
    /// Piece hash verification failed
    HashMismatch,
    /// Torrent is not known locally or on the network
    UnknownTorrent,
    /// File is not part of the torrent
    UnknownFile,
    /// Piece index outside the file
    PieceOutOfRange,
}

impl SwarmError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            Self::Storage { kind, .. } => matches!(kind, StorageErrorKind::Io),
            Self::Protocol { kind, .. } => matches!(kind, ProtocolErrorKind::HashMismatch),
            _ => false,
        }
    }

    /// Create a format error
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(kind, NetworkErrorKind::Send | NetworkErrorKind::Receive);
        Self::Network {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Create a storage error
    pub fn storage(
        kind: StorageErrorKind,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self::Storage {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }
}

/// Result type alias for swarm operations
pub type Result<T> = std::result::Result<T, SwarmError>;

impl From<std::io::Error> for SwarmError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::NotFound => StorageErrorKind::NotFound,
            ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            ErrorKind::AlreadyExists => StorageErrorKind::AlreadyExists,
            _ => StorageErrorKind::Io,
        };
        Self::Storage {
            kind,
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

impl From<std::num::ParseIntError> for SwarmError {
    fn from(err: std::num::ParseIntError) -> Self {
        Self::Format {
            message: format!("invalid integer field: {}", err),
        }
    }
}

impl From<serde_json::Error> for SwarmError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidInput {
            field: "config",
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for SwarmError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("background task failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SwarmError::network(NetworkErrorKind::Send, "x").is_retryable());
        assert!(!SwarmError::network(NetworkErrorKind::Bind, "x").is_retryable());
        assert!(!SwarmError::format("bad").is_retryable());
        assert!(SwarmError::protocol(ProtocolErrorKind::HashMismatch, "x").is_retryable());
    }

    #[test]
    fn test_io_error_mapping() {
        let err: SwarmError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        match err {
            SwarmError::Storage { kind, .. } => assert_eq!(kind, StorageErrorKind::NotFound),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_int_maps_to_format() {
        let err: SwarmError = "x1".parse::<u32>().unwrap_err().into();
        assert!(matches!(err, SwarmError::Format { .. }));
        assert!(err.to_string().starts_with("Format error"));
    }
}
