//! Content hash over whole files using BLAKE3.
//!
//! Both peers hash every regular file in full; two files are considered
//! identical iff their digests match. The digest travels on the wire as
//! lowercase hex inside each `FileEntry`.

use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Read buffer for streaming hashes.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Strong digest of a file's full byte content.
///
/// # Example
///
/// ```rust
/// use dirsync::ContentHash;
///
/// let a = ContentHash::compute(b"hello world");
/// let b = ContentHash::compute(b"hello world");
/// assert_eq!(a, b);
/// assert_eq!(a.to_hex().len(), 64);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash an in-memory buffer.
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Hash everything a reader yields, without buffering it all.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if reading fails.
    pub fn compute_streaming<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let mut hasher = blake3::Hasher::new();
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

        loop {
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buffer[..n]);
        }

        Ok(Self(*hasher.finalize().as_bytes()))
    }

    /// Open `path` read-only and hash its content.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be opened or read.
    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        let mut file = File::open(path)?;
        Self::compute_streaming(&mut file)
    }

    /// Raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering used in `FileEntry::hash`.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ContentHash({:016x}...)",
            u64::from_be_bytes(self.0[..8].try_into().unwrap_or([0u8; 8]))
        )
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Streaming and direct produce same result
        #[test]
        fn streaming_equivalence(data in prop::collection::vec(any::<u8>(), 0..10000)) {
            let direct = ContentHash::compute(&data);
            let mut cursor = std::io::Cursor::new(&data);
            let streaming = ContentHash::compute_streaming(&mut cursor).unwrap();
            prop_assert_eq!(direct, streaming);
        }

        /// Hex rendering is a stable function of the digest
        #[test]
        fn hex_deterministic(data in prop::collection::vec(any::<u8>(), 0..200)) {
            prop_assert_eq!(
                ContentHash::compute(&data).to_hex(),
                ContentHash::compute(&data).to_hex()
            );
        }
    }
}
