//! Wire protocol for dirsync sessions.
//!
//! Every message travels as a fixed 9-byte header followed by a payload:
//!
//! ```text
//! ┌─────────┬──────────────────┬──────────────────┐
//! │   TAG   │      LENGTH      │     PAYLOAD      │
//! │ 1 byte  │ 8 bytes (LE u64) │  LENGTH bytes    │
//! └─────────┴──────────────────┴──────────────────┘
//! ```
//!
//! Payloads are bincode-encoded structs. The protocol separator carries an
//! empty payload and marks the end of a stage (or of one file's chunk run).

use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{DirSyncError, Result};
use crate::tree::FileTree;

/// Maximum payload size accepted on either side (1 GiB).
pub const MAX_PAYLOAD_SIZE: u64 = 1024 * 1024 * 1024;

/// Protocol message types. The numbering is fixed; new kinds get new values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Full file tree snapshot.
    TreeSnapshot = 1,
    /// Request for one file's content.
    FileRequest = 2,
    /// One chunk of file content.
    FileChunk = 3,
    /// Request to create a directory.
    DirectoryRequest = 4,
    /// Clock sanity check.
    SanityCheck = 5,
    /// Stage terminator.
    ProtocolSeparator = 6,
    /// Path and mtime announcing a file transfer.
    MinimalFileMetadata = 7,
}

impl MessageType {
    /// Convert from the wire tag.
    ///
    /// # Errors
    ///
    /// Returns `UnknownMessageType` if the tag is not in the table.
    pub const fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::TreeSnapshot),
            2 => Ok(Self::FileRequest),
            3 => Ok(Self::FileChunk),
            4 => Ok(Self::DirectoryRequest),
            5 => Ok(Self::SanityCheck),
            6 => Ok(Self::ProtocolSeparator),
            7 => Ok(Self::MinimalFileMetadata),
            _ => Err(DirSyncError::UnknownMessageType(value)),
        }
    }

    /// Wire tag.
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }
}

/// Frame header: tag plus payload length.
///
/// The tag is kept raw so that an unknown kind can still be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw message tag.
    pub tag: u8,
    /// Payload length (little-endian on the wire).
    pub length: u64,
}

impl FrameHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 9;

    /// Create a header for a payload of `length` bytes.
    #[must_use]
    pub const fn new(msg_type: MessageType, length: u64) -> Self {
        Self {
            tag: msg_type.tag(),
            length,
        }
    }

    /// Encode header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.tag;
        buf[1..9].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    /// Decode header from bytes.
    #[must_use]
    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        let mut length = [0u8; 8];
        length.copy_from_slice(&buf[1..9]);
        Self {
            tag: buf[0],
            length: u64::from_le_bytes(length),
        }
    }

    /// Read a header from the stream.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the stream fails or ends.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; Self::SIZE];
        reader.read_exact(&mut buf).map_err(DirSyncError::Transport)?;
        Ok(Self::decode(&buf))
    }
}

/// Ask the peer for one file's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRequest {
    /// Path relative to the peer's root.
    pub relative_path: String,
}

/// One chunk of a file being streamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    /// Raw bytes, at most `PART_SIZE` long.
    pub part: Vec<u8>,
}

/// Ask the peer to create a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRequest {
    /// Path relative to the peer's root.
    pub relative_path: String,
}

/// Sender's wall clock, seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanityCheck {
    /// Seconds since the Unix epoch.
    pub time: i64,
}

impl SanityCheck {
    /// Capture the local clock.
    #[must_use]
    pub fn now() -> Self {
        Self { time: unix_now() }
    }

    /// Whether `self.time` lies strictly within `now ± tolerance` seconds.
    #[must_use]
    pub fn is_within(&self, now: i64, tolerance: u64) -> bool {
        let tolerance = i64::try_from(tolerance).unwrap_or(i64::MAX);
        now.saturating_sub(tolerance) < self.time && self.time < now.saturating_add(tolerance)
    }
}

/// Header sent before each file's chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimalFileMetadata {
    /// Path relative to the receiver's root.
    pub relative_path: String,
    /// Modification time to restore, seconds since the Unix epoch.
    pub mtime: i64,
}

/// Current wall clock in whole seconds since the Unix epoch.
#[must_use]
pub fn unix_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_secs()).map_or(i64::MIN, |s| -s),
    }
}

/// Protocol messages. Each variant statically owns its tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// File tree snapshot.
    TreeSnapshot(FileTree),
    /// File request.
    FileRequest(FileRequest),
    /// File chunk.
    FileChunk(FileChunk),
    /// Directory creation request.
    DirectoryRequest(DirectoryRequest),
    /// Clock sanity check.
    SanityCheck(SanityCheck),
    /// Stage terminator, empty payload.
    ProtocolSeparator,
    /// File transfer header.
    MinimalFileMetadata(MinimalFileMetadata),
}

impl Message {
    /// Get the message type.
    #[must_use]
    pub const fn kind(&self) -> MessageType {
        match self {
            Self::TreeSnapshot(_) => MessageType::TreeSnapshot,
            Self::FileRequest(_) => MessageType::FileRequest,
            Self::FileChunk(_) => MessageType::FileChunk,
            Self::DirectoryRequest(_) => MessageType::DirectoryRequest,
            Self::SanityCheck(_) => MessageType::SanityCheck,
            Self::ProtocolSeparator => MessageType::ProtocolSeparator,
            Self::MinimalFileMetadata(_) => MessageType::MinimalFileMetadata,
        }
    }

    /// Serialize the payload (without header).
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        match self {
            Self::TreeSnapshot(tree) => encode(tree),
            Self::FileRequest(request) => encode(request),
            Self::FileChunk(chunk) => encode(chunk),
            Self::DirectoryRequest(request) => encode(request),
            Self::SanityCheck(check) => encode(check),
            Self::ProtocolSeparator => Ok(Vec::new()),
            Self::MinimalFileMetadata(metadata) => encode(metadata),
        }
    }

    /// Deserialize a payload of the given kind.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the bytes do not decode as `kind`.
    pub fn decode_payload(kind: MessageType, data: &[u8]) -> Result<Self> {
        Ok(match kind {
            MessageType::TreeSnapshot => Self::TreeSnapshot(decode(data)?),
            MessageType::FileRequest => Self::FileRequest(decode(data)?),
            MessageType::FileChunk => Self::FileChunk(decode(data)?),
            MessageType::DirectoryRequest => Self::DirectoryRequest(decode(data)?),
            MessageType::SanityCheck => Self::SanityCheck(decode(data)?),
            MessageType::ProtocolSeparator => Self::ProtocolSeparator,
            MessageType::MinimalFileMetadata => Self::MinimalFileMetadata(decode(data)?),
        })
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| DirSyncError::Protocol(format!("Failed to encode payload: {e}")))
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data)
        .map_err(|e| DirSyncError::Protocol(format!("Failed to decode payload: {e}")))
}

/// A payload struct bound to exactly one message kind.
pub trait Payload: Sized + Into<Message> {
    /// Kind this payload travels as.
    const KIND: MessageType;

    /// Unwrap the payload if `message` is of this kind.
    fn from_message(message: Message) -> Option<Self>;
}

macro_rules! impl_payload {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for Message {
            fn from(payload: $ty) -> Self {
                Message::$variant(payload)
            }
        }

        impl Payload for $ty {
            const KIND: MessageType = MessageType::$variant;

            fn from_message(message: Message) -> Option<Self> {
                match message {
                    Message::$variant(payload) => Some(payload),
                    _ => None,
                }
            }
        }
    };
}

impl_payload!(FileTree, TreeSnapshot);
impl_payload!(FileRequest, FileRequest);
impl_payload!(FileChunk, FileChunk);
impl_payload!(DirectoryRequest, DirectoryRequest);
impl_payload!(SanityCheck, SanityCheck);
impl_payload!(MinimalFileMetadata, MinimalFileMetadata);

/// Outcome of a successful receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A message of the expected kind.
    Message(Message),
    /// The peer closed the current stage.
    StageEnd,
}

/// Protocol codec for reading/writing framed messages.
#[derive(Debug, Default)]
pub struct Codec {
    /// Payload buffer reused across reads.
    read_buf: Vec<u8>,
}

impl Codec {
    /// Create a new codec.
    #[must_use]
    pub fn new() -> Self {
        Self {
            read_buf: Vec::with_capacity(4096),
        }
    }

    /// Write one framed message.
    ///
    /// Header and payload go out in a single `write_all`.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if writing fails, `Protocol` if the payload is
    /// oversized or cannot be encoded.
    pub fn send<W: Write>(&self, writer: &mut W, message: &Message) -> Result<()> {
        let payload = message.encode_payload()?;
        let length = payload.len() as u64;
        if length > MAX_PAYLOAD_SIZE {
            return Err(DirSyncError::Protocol(format!(
                "Payload exceeds maximum size: {length} > {MAX_PAYLOAD_SIZE}"
            )));
        }

        let header = FrameHeader::new(message.kind(), length);
        let mut frame = Vec::with_capacity(FrameHeader::SIZE + payload.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(&payload);

        writer.write_all(&frame).map_err(DirSyncError::Transport)?;
        writer.flush().map_err(DirSyncError::Transport)
    }

    /// Write a protocol separator.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if writing fails.
    pub fn send_separator<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.send(writer, &Message::ProtocolSeparator)
    }

    /// Read one framed message, expecting `expected`.
    ///
    /// The payload is consumed in full before the tag is judged, so the
    /// stream stays aligned after a mismatch.
    ///
    /// # Errors
    ///
    /// `TypeMismatch` for another real kind, `UnknownMessageType` for an
    /// unassigned tag, `Protocol` for an undecodable payload, `Transport`
    /// for stream failures.
    pub fn receive<R: Read>(&mut self, reader: &mut R, expected: MessageType) -> Result<Frame> {
        let header = FrameHeader::read_from(reader)?;
        if header.length > MAX_PAYLOAD_SIZE {
            return Err(DirSyncError::Protocol(format!(
                "Payload too large: {} > {MAX_PAYLOAD_SIZE}",
                header.length
            )));
        }

        self.read_buf.clear();
        let read = reader
            .by_ref()
            .take(header.length)
            .read_to_end(&mut self.read_buf)
            .map_err(DirSyncError::Transport)?;
        if read as u64 != header.length {
            return Err(DirSyncError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("payload truncated: {read} of {} bytes", header.length),
            )));
        }

        let actual = MessageType::from_u8(header.tag)?;
        if actual == MessageType::ProtocolSeparator {
            return Ok(Frame::StageEnd);
        }
        if actual != expected {
            return Err(DirSyncError::TypeMismatch { expected, actual });
        }

        Message::decode_payload(actual, &self.read_buf).map(Frame::Message)
    }

    /// Typed receive: `Ok(None)` means the stage ended.
    ///
    /// # Errors
    ///
    /// Same as [`Codec::receive`].
    pub fn receive_payload<T: Payload, R: Read>(&mut self, reader: &mut R) -> Result<Option<T>> {
        match self.receive(reader, T::KIND)? {
            Frame::StageEnd => Ok(None),
            Frame::Message(message) => {
                let actual = message.kind();
                T::from_message(message).map(Some).ok_or(DirSyncError::TypeMismatch {
                    expected: T::KIND,
                    actual,
                })
            }
        }
    }

    /// Typed receive for stages where a payload is mandatory.
    ///
    /// # Errors
    ///
    /// `UnexpectedStageEnd` if the peer sent a separator instead, otherwise
    /// the same as [`Codec::receive`].
    pub fn expect_payload<T: Payload, R: Read>(&mut self, reader: &mut R) -> Result<T> {
        self.receive_payload(reader)?
            .ok_or(DirSyncError::UnexpectedStageEnd { expected: T::KIND })
    }
}
