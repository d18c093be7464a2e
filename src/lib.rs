//! # dirsync
//!
//! Bidirectional directory synchronization over a single TCP connection.
//!
//! Two peers each snapshot a root directory. The responder compares both
//! snapshots and directs the exchange so that, for every path, the copy with
//! the newer modification time wins and missing directories are created on
//! whichever side lacks them.
//!
//! ## Features
//!
//! - **Snapshots**: recursive walk with BLAKE3 content digests
//! - **Newest wins**: per-file decision from content hash and mtime
//! - **Staged protocol**: tagged, length-prefixed frames with stage separators
//! - **Streaming**: files move in fixed-size chunks, mtimes are preserved
//!
//! ## Example
//!
//! ```rust
//! use dirsync::{FileDiff, FileTree};
//!
//! let dir = tempfile::tempdir().unwrap();
//! std::fs::write(dir.path().join("a.txt"), b"hi").unwrap();
//!
//! let local = FileTree::build(dir.path()).unwrap();
//! let remote = FileTree::default();
//!
//! let diff = FileDiff::compute(&local, &remote);
//! assert_eq!(diff.push, vec!["a.txt"]);
//! assert!(diff.pull.is_empty());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod config;
pub mod diff;
mod error;
mod hash;
pub mod net;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod tree;

pub use config::{ConfigFile, SyncConfig, SyncConfigBuilder, DEFAULT_PORT};
pub use diff::{missing_directories, FileDiff};
pub use error::{DirSyncError, Result};
pub use hash::ContentHash;
pub use net::{connect, serve};
pub use protocol::{Codec, Frame, FrameHeader, Message, MessageType, MAX_PAYLOAD_SIZE};
pub use session::{Role, SessionStats, Stage, SyncSession};
pub use transfer::PART_SIZE;
pub use tree::{DirectoryEntry, FileEntry, FileTree};
