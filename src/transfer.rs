//! Chunked file streaming.
//!
//! A file travels as one `MinimalFileMetadata`, a run of `FileChunk`
//! messages of at most [`PART_SIZE`] bytes, and a protocol separator. A
//! batch of files is closed by a second separator where the next metadata
//! would be.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tracing::{debug, warn};

use crate::error::{DirSyncError, Result};
use crate::protocol::{Codec, FileChunk, Message, MinimalFileMetadata};
use crate::tree::resolve;

/// Maximum bytes carried by one chunk.
pub const PART_SIZE: usize = 65_536;

/// Sizes of the chunks a file of `size` bytes is split into.
///
/// `ceil(size / PART_SIZE)` chunks, the last one holding the remainder; an
/// empty file still produces one zero-length chunk.
#[must_use]
pub fn chunk_sizes(size: u64) -> Vec<usize> {
    let part = PART_SIZE as u64;
    if size == 0 {
        return vec![0];
    }
    let full = size / part;
    let rest = size % part;
    let mut sizes = vec![PART_SIZE; usize::try_from(full).unwrap_or(usize::MAX)];
    if rest > 0 {
        sizes.push(usize::try_from(rest).unwrap_or(PART_SIZE));
    }
    sizes
}

/// Counters for a receive phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveStats {
    /// Files written and closed.
    pub files: usize,
    /// Content bytes written.
    pub bytes: u64,
    /// Files whose content was drained and discarded.
    pub skipped: usize,
}

/// Stream one file from `root` to the peer. Returns the content bytes sent.
///
/// Nothing is written to the stream if the file cannot be stat'ed or
/// opened. A read failure after the metadata went out still closes the
/// file with a separator so the peer stays aligned.
///
/// # Errors
///
/// `Filesystem`/`InvalidPath` for problems with this one file (the session
/// may continue), `Transport`/`Protocol` for wire failures (fatal).
pub fn send_file<W: Write>(
    codec: &Codec,
    stream: &mut W,
    root: &Path,
    relative_path: &str,
) -> Result<u64> {
    let path = resolve(root, relative_path)?;

    let metadata = fs::metadata(&path).map_err(|e| {
        DirSyncError::filesystem(
            &path,
            io::Error::new(e.kind(), format!("cannot determine modification time: {e}")),
        )
    })?;
    if !metadata.is_file() {
        return Err(DirSyncError::filesystem(
            &path,
            io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
        ));
    }
    let mtime = FileTime::from_last_modification_time(&metadata).unix_seconds();
    let mut file = File::open(&path).map_err(|e| DirSyncError::filesystem(&path, e))?;

    debug!(path = relative_path, mtime, "Sending file");
    codec.send(
        stream,
        &MinimalFileMetadata {
            relative_path: relative_path.to_string(),
            mtime,
        }
        .into(),
    )?;

    let mut buffer = vec![0u8; PART_SIZE];
    let mut sent = 0u64;
    let mut chunks = 0usize;
    loop {
        let n = match fill(&mut file, &mut buffer) {
            Ok(n) => n,
            Err(e) => {
                codec.send_separator(stream)?;
                return Err(DirSyncError::filesystem(&path, e));
            }
        };
        if n == 0 && chunks > 0 {
            break;
        }

        codec.send(
            stream,
            &Message::FileChunk(FileChunk {
                part: buffer[..n].to_vec(),
            }),
        )?;
        chunks += 1;
        sent += n as u64;

        if n < PART_SIZE {
            break;
        }
    }

    codec.send_separator(stream)?;
    Ok(sent)
}

/// Read until `buffer` is full or the reader is exhausted.
fn fill<R: Read>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Receive files into `root` until the peer closes the phase.
///
/// Destinations are truncated before writing. A destination that cannot be
/// opened or written has the rest of its chunks drained and discarded.
///
/// # Errors
///
/// Only wire failures are returned; filesystem problems are logged.
pub fn receive_files<R: Read>(codec: &mut Codec, stream: &mut R, root: &Path) -> Result<ReceiveStats> {
    let mut stats = ReceiveStats::default();

    while let Some(metadata) = codec.receive_payload::<MinimalFileMetadata, _>(stream)? {
        debug!(path = %metadata.relative_path, "Receiving file");

        let mut destination = match open_destination(root, &metadata.relative_path) {
            Ok(destination) => Some(destination),
            Err(e) => {
                warn!(path = %metadata.relative_path, error = %e, "Could not open destination, discarding content");
                None
            }
        };

        let mut written = 0u64;
        while let Some(chunk) = codec.receive_payload::<FileChunk, _>(stream)? {
            let result = match destination.as_mut() {
                Some((_, file)) => file.write_all(&chunk.part),
                None => continue,
            };
            match result {
                Ok(()) => written += chunk.part.len() as u64,
                Err(e) => {
                    warn!(path = %metadata.relative_path, error = %e, "Write failed, discarding rest of file");
                    destination = None;
                }
            }
        }

        let Some((path, file)) = destination else {
            stats.skipped += 1;
            continue;
        };
        if let Err(e) = file.sync_all() {
            warn!(path = %metadata.relative_path, error = %e, "Could not flush file");
        }
        drop(file);

        match filetime::set_file_mtime(&path, FileTime::from_unix_time(metadata.mtime, 0)) {
            Ok(()) => debug!(path = %metadata.relative_path, mtime = metadata.mtime, "Restored mtime"),
            Err(e) => warn!(path = %metadata.relative_path, error = %e, "Could not set mtime"),
        }

        stats.files += 1;
        stats.bytes += written;
    }

    Ok(stats)
}

fn open_destination(root: &Path, relative_path: &str) -> Result<(PathBuf, File)> {
    let path = resolve(root, relative_path)?;
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .map_err(|e| DirSyncError::filesystem(&path, e))?;
    Ok((path, file))
}
