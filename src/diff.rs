//! Snapshot comparison.
//!
//! Decides, per path, which side holds the copy that should win. The
//! direction depends only on whose mtime is newer, never on which peer
//! initiated the session, so both ends agree on every transfer.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::tree::{FileEntry, FileTree};

/// File actions derived from a local and a remote snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileDiff {
    /// Paths where the local copy wins; send them to the peer.
    pub push: Vec<String>,
    /// Paths where the remote copy wins; request them from the peer.
    pub pull: Vec<String>,
    /// Paths whose content differs but whose mtimes are equal.
    ///
    /// Neither side wins; these are reported and left alone.
    pub ties: Vec<String>,
}

impl FileDiff {
    /// Compare `local` against `remote`.
    ///
    /// | local vs remote                          | result |
    /// |------------------------------------------|--------|
    /// | only local                               | push   |
    /// | only remote                              | pull   |
    /// | same hash                                | none   |
    /// | hash differs, remote mtime < local mtime | push   |
    /// | hash differs, remote mtime > local mtime | pull   |
    /// | hash differs, equal mtime                | tie    |
    ///
    /// Output lists are sorted.
    #[must_use]
    pub fn compute(local: &FileTree, remote: &FileTree) -> Self {
        let remote_index = index_files(remote);
        let local_index = index_files(local);
        let mut diff = Self::default();

        for (path, local_file) in &local_index {
            match remote_index.get(path) {
                None => diff.push.push((*path).to_string()),
                Some(remote_file) if remote_file.hash != local_file.hash => {
                    if remote_file.mtime < local_file.mtime {
                        diff.push.push((*path).to_string());
                    } else if remote_file.mtime > local_file.mtime {
                        diff.pull.push((*path).to_string());
                    } else {
                        diff.ties.push((*path).to_string());
                    }
                }
                Some(_) => {}
            }
        }

        for path in remote_index.keys() {
            if !local_index.contains_key(path) {
                diff.pull.push((*path).to_string());
            }
        }

        diff.push.sort_unstable();
        diff.pull.sort_unstable();
        diff.ties.sort_unstable();
        diff
    }

    /// Whether no file needs to move.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.push.is_empty() && self.pull.is_empty()
    }
}

fn index_files(tree: &FileTree) -> FxHashMap<&str, &FileEntry> {
    let mut index = FxHashMap::with_capacity_and_hasher(tree.files.len(), Default::default());
    for file in &tree.files {
        index.insert(file.relative_path.as_str(), file);
    }
    index
}

/// Directories present in `local` but absent from `remote`, sorted so that
/// parents come before their children.
///
/// Call once per direction to get what each side is missing.
#[must_use]
pub fn missing_directories(local: &FileTree, remote: &FileTree) -> Vec<String> {
    let remote_dirs: FxHashSet<&str> = remote
        .directories
        .iter()
        .map(|d| d.relative_path.as_str())
        .collect();

    let mut missing: Vec<String> = local
        .directories
        .iter()
        .map(|d| d.relative_path.as_str())
        .filter(|path| !remote_dirs.contains(path))
        .map(str::to_string)
        .collect();

    missing.sort_unstable();
    missing.dedup();
    missing
}
