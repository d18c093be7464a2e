//! Session configuration.
//!
//! Values come from the command line and may be overridden by an optional
//! JSON file carrying any of `port`, `strict` and `verbose`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{DirSyncError, Result};

/// Port used when none is configured.
pub const DEFAULT_PORT: u16 = 7878;

/// Allowed clock difference for the sanity check, in seconds.
pub const DEFAULT_CLOCK_TOLERANCE: u64 = 5;

/// Parameters handed to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Root directory being synchronized.
    pub root: PathBuf,
    /// Peer address (initiator) or bind address (responder).
    pub address: String,
    /// TCP port.
    pub port: u16,
    /// Report unresolved conflicts and clock skew at warning level.
    pub strict: bool,
    /// Log debug-level detail.
    pub verbose: bool,
    /// Sanity check tolerance in seconds.
    pub clock_tolerance: u64,
}

/// Overrides read from a JSON config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConfigFile {
    /// Port override.
    pub port: Option<u16>,
    /// Strict flag override.
    pub strict: Option<bool>,
    /// Verbose flag override.
    pub verbose: Option<bool>,
}

impl ConfigFile {
    /// Parse overrides from JSON text.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the text is not a valid config object.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| DirSyncError::Config(format!("invalid config: {e}")))
    }

    /// Load overrides from `path`.
    ///
    /// An unreadable file is only a warning and yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file is readable but malformed.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(text) => {
                let file = Self::parse(&text)?;
                info!(path = %path.display(), "Config file applied");
                Ok(Some(file))
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Config file could not be applied");
                Ok(None)
            }
        }
    }
}

/// Builder for [`SyncConfig`].
///
/// # Example
///
/// ```rust
/// use dirsync::SyncConfigBuilder;
///
/// let dir = std::env::temp_dir();
/// let config = SyncConfigBuilder::new(&dir)
///     .address("127.0.0.1")
///     .port(9000)
///     .strict(true)
///     .build()
///     .unwrap();
/// assert_eq!(config.port, 9000);
/// ```
#[derive(Debug, Clone)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    /// Start from defaults for `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            config: SyncConfig {
                root: root.into(),
                address: "0.0.0.0".to_string(),
                port: DEFAULT_PORT,
                strict: false,
                verbose: false,
                clock_tolerance: DEFAULT_CLOCK_TOLERANCE,
            },
        }
    }

    /// Set the peer or bind address.
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.config.address = address.into();
        self
    }

    /// Set the port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Enable or disable strict reporting.
    #[must_use]
    pub fn strict(mut self, strict: bool) -> Self {
        self.config.strict = strict;
        self
    }

    /// Enable or disable verbose logging.
    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.config.verbose = verbose;
        self
    }

    /// Set the sanity check tolerance in seconds.
    #[must_use]
    pub fn clock_tolerance(mut self, seconds: u64) -> Self {
        self.config.clock_tolerance = seconds;
        self
    }

    /// Apply file overrides on top of the current values.
    #[must_use]
    pub fn overrides(mut self, file: &ConfigFile) -> Self {
        if let Some(port) = file.port {
            self.config.port = port;
        }
        if let Some(strict) = file.strict {
            self.config.strict = strict;
        }
        if let Some(verbose) = file.verbose {
            self.config.verbose = verbose;
        }
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the root is not an accessible directory.
    pub fn build(self) -> Result<SyncConfig> {
        check_root(&self.config.root)?;
        Ok(self.config)
    }
}

fn check_root(root: &Path) -> Result<()> {
    match fs::metadata(root) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(DirSyncError::Config(format!(
            "'{}': Supplied path is not a directory.",
            root.display()
        ))),
        Err(e) => {
            let reason = match e.kind() {
                io::ErrorKind::NotFound => "Directory does not exist.".to_string(),
                io::ErrorKind::PermissionDenied => {
                    "No permission to access supplied directory.".to_string()
                }
                _ => format!("Unknown error: {e}"),
            };
            Err(DirSyncError::Config(format!("'{}': {reason}", root.display())))
        }
    }
}
