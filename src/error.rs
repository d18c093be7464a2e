//! Error types for dirsync operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::protocol::MessageType;

/// Errors that can occur during dirsync operations.
#[derive(Error, Debug)]
pub enum DirSyncError {
    /// Socket I/O failure. The connection must be treated as dead.
    #[error("Transport error: {0}")]
    Transport(#[source] std::io::Error),

    /// A real message of a different kind arrived than the stage expects.
    #[error("Type mismatch: expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        /// Kind the receiver asked for
        expected: MessageType,
        /// Kind found on the wire
        actual: MessageType,
    },

    /// A protocol separator arrived where a payload is mandatory.
    #[error("Unexpected stage end while waiting for {expected:?}")]
    UnexpectedStageEnd {
        /// Kind the receiver asked for
        expected: MessageType,
    },

    /// Tag byte outside the fixed message table.
    #[error("Unknown message type: {0:#x}")]
    UnknownMessageType(u8),

    /// Malformed frame or payload.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Filesystem operation failed for a single path.
    #[error("Filesystem error on '{}': {source}", path.display())]
    Filesystem {
        /// Path the operation was applied to
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Peer-supplied relative path escapes the root or is malformed.
    #[error("Invalid relative path: '{0}'")]
    InvalidPath(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DirSyncError {
    /// Wrap an I/O error raised while touching `path`.
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Whether this error ends the session.
    ///
    /// Filesystem and path errors only affect the file or directory being
    /// processed; everything on the wire side desynchronizes the peers.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Filesystem { .. } | Self::InvalidPath(_))
    }
}

/// Result type for dirsync operations.
pub type Result<T> = std::result::Result<T, DirSyncError>;
