//! File tree snapshots.
//!
//! A [`FileTree`] is a point-in-time recursive listing of one root, built
//! fresh for every session and never updated in place.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use filetime::FileTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{DirSyncError, Result};
use crate::hash::ContentHash;

/// Cap on directory descriptors held open during a walk.
pub const MAX_OPEN_DESCRIPTORS: usize = 15;

/// One regular file in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// `/`-separated path relative to the root.
    pub relative_path: String,
    /// Size in bytes.
    pub size: u64,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: i64,
    /// Hex content digest.
    pub hash: String,
}

/// One directory in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// `/`-separated path relative to the root.
    pub relative_path: String,
}

/// Recursive listing of a root directory, root itself excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTree {
    /// Regular files, in no particular order.
    pub files: Vec<FileEntry>,
    /// Directories, in no particular order.
    pub directories: Vec<DirectoryEntry>,
}

impl FileTree {
    /// Walk `root` and snapshot every directory and regular file below it.
    ///
    /// Files that cannot be opened and entries the walk cannot read are
    /// logged and skipped. Symbolic links are not followed.
    ///
    /// # Errors
    ///
    /// Returns `Filesystem` if `root` is missing or not a directory.
    pub fn build(root: &Path) -> Result<Self> {
        let metadata = fs::metadata(root).map_err(|e| DirSyncError::filesystem(root, e))?;
        if !metadata.is_dir() {
            return Err(DirSyncError::filesystem(
                root,
                io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }

        let mut tree = Self::default();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .max_open(MAX_OPEN_DESCRIPTORS)
            .follow_links(false);

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            let Some(relative_path) = wire_path(root, entry.path()) else {
                warn!(path = %entry.path().display(), "Skipping path that is not valid UTF-8");
                continue;
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                tree.directories.push(DirectoryEntry { relative_path });
            } else if file_type.is_file() {
                match snapshot_file(entry.path(), relative_path) {
                    Ok(file) => tree.files.push(file),
                    Err(e) => {
                        warn!(path = %entry.path().display(), error = %e, "Could not open file. Skipping...");
                    }
                }
            } else {
                debug!(path = %entry.path().display(), "Skipping non-regular entry");
            }
        }

        debug!(
            root = %root.display(),
            files = tree.files.len(),
            directories = tree.directories.len(),
            "File tree built"
        );
        Ok(tree)
    }

    /// Number of entries (files and directories).
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len() + self.directories.len()
    }

    /// Whether the snapshot lists nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.directories.is_empty()
    }

    /// Total bytes across all files.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

fn snapshot_file(path: &Path, relative_path: String) -> io::Result<FileEntry> {
    let mut file = File::open(path)?;
    let metadata = file.metadata()?;
    let mtime = FileTime::from_last_modification_time(&metadata).unix_seconds();
    let hash = ContentHash::compute_streaming(&mut file)?;

    Ok(FileEntry {
        relative_path,
        size: metadata.len(),
        mtime,
        hash: hash.to_hex(),
    })
}

/// Render `path` relative to `root` with `/` separators.
///
/// Returns `None` if `path` is outside `root` or not valid UTF-8.
#[must_use]
pub fn wire_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Map a peer-supplied relative path onto `root`.
///
/// Snapshots never list symbolic links, so a path that passes through one
/// below `root` is refused rather than followed out of the tree.
///
/// # Errors
///
/// Returns `InvalidPath` for empty or absolute paths, for any segment that
/// is not a plain name (`..`, `.`, empty, drive prefixes), and for paths
/// with an existing symbolic link at any segment.
pub fn resolve(root: &Path, relative_path: &str) -> Result<PathBuf> {
    if relative_path.is_empty() {
        return Err(DirSyncError::InvalidPath(relative_path.to_string()));
    }

    let mut resolved = root.to_path_buf();
    for segment in relative_path.split('/') {
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) if part == segment => resolved.push(part),
            _ => return Err(DirSyncError::InvalidPath(relative_path.to_string())),
        }
        if is_symlink(&resolved) {
            return Err(DirSyncError::InvalidPath(relative_path.to_string()));
        }
    }
    Ok(resolved)
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|metadata| metadata.file_type().is_symlink())
}
