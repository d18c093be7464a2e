//! Sync session state machine.
//!
//! One session drives one connection through a fixed sequence of stages.
//! The responder owns the decisions: it diffs both trees and tells the
//! initiator which directories to create, which files are coming, and which
//! files it wants back.
//!
//! ```text
//! Initiator                          Responder
//! ─────────                          ─────────
//! SendSanityCheck   ── SanityCheck ─▶ AwaitSanityCheck
//! SendTree          ── FileTree ────▶ AwaitRemoteTree
//!                                     ComputeDiff
//! ReceiveDirectories ◀─ DirectoryRequest*, End ── ExchangeDirectories
//! PullFiles          ◀─ (Metadata, Chunk*, End)*, End ── PushFiles
//! ServeRequests      ◀─ FileRequest*, End ── RequestFiles
//!                    ── (Metadata, Chunk*, End)*, End ─▶ PullFiles
//! ```
//!
//! Any transport error or protocol mismatch aborts the session on the spot.
//! Filesystem changes already made stay in place.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, info_span, warn};

use crate::config::SyncConfig;
use crate::diff::{missing_directories, FileDiff};
use crate::error::{DirSyncError, Result};
use crate::protocol::{unix_now, Codec, DirectoryRequest, FileRequest, SanityCheck};
use crate::transfer::{receive_files, send_file};
use crate::tree::{resolve, FileTree};

/// Which end of the connection a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connects, sends its tree, serves the responder's requests.
    Initiator,
    /// Accepts, diffs, and directs the exchange.
    Responder,
}

/// Session stages, in protocol order per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Responder: read the peer's clock.
    AwaitSanityCheck,
    /// Initiator: send the local clock.
    SendSanityCheck,
    /// Responder: read the peer's tree and snapshot the local one.
    AwaitRemoteTree,
    /// Initiator: snapshot and send the local tree.
    SendTree,
    /// Responder: diff files and directories.
    ComputeDiff,
    /// Responder: create local directories, request remote ones.
    ExchangeDirectories,
    /// Initiator: create directories the responder asks for.
    ReceiveDirectories,
    /// Responder: stream the files where the local copy wins.
    PushFiles,
    /// Responder: request the files where the remote copy wins.
    RequestFiles,
    /// Receive files until the peer ends the phase.
    PullFiles,
    /// Initiator: stream every file the responder requested.
    ServeRequests,
    /// Terminal.
    ConnectionClosed,
}

impl Stage {
    /// Stages a role walks through, terminal stage included.
    #[must_use]
    pub const fn sequence(role: Role) -> &'static [Self] {
        match role {
            Role::Responder => &[
                Self::AwaitSanityCheck,
                Self::AwaitRemoteTree,
                Self::ComputeDiff,
                Self::ExchangeDirectories,
                Self::PushFiles,
                Self::RequestFiles,
                Self::PullFiles,
                Self::ConnectionClosed,
            ],
            Role::Initiator => &[
                Self::SendSanityCheck,
                Self::SendTree,
                Self::ReceiveDirectories,
                Self::PullFiles,
                Self::ServeRequests,
                Self::ConnectionClosed,
            ],
        }
    }

    /// Entry stage for `role`.
    #[must_use]
    pub const fn first(role: Role) -> Self {
        Self::sequence(role)[0]
    }

    /// Successor of `self` for `role`, `None` once closed.
    #[must_use]
    pub fn next(self, role: Role) -> Option<Self> {
        let sequence = Self::sequence(role);
        let position = sequence.iter().position(|stage| *stage == self)?;
        sequence.get(position + 1).copied()
    }
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Directories created locally.
    pub directories_created: usize,
    /// Directory creations requested from the peer.
    pub directories_requested: usize,
    /// Files streamed to the peer.
    pub files_sent: usize,
    /// Files received and written.
    pub files_received: usize,
    /// Files requested from the peer.
    pub files_requested: usize,
    /// Files skipped on either side because of local filesystem errors.
    pub files_skipped: usize,
    /// Content bytes sent.
    pub bytes_sent: u64,
    /// Content bytes received.
    pub bytes_received: u64,
    /// Paths left alone because neither copy is newer.
    pub unresolved: usize,
}

/// Per-connection state. Created on connect/accept, dropped on close.
#[derive(Debug)]
pub struct SyncSession {
    role: Role,
    stage: Stage,
    root: PathBuf,
    strict: bool,
    clock_tolerance: u64,
    codec: Codec,
    local: Option<FileTree>,
    remote: Option<FileTree>,
    file_diff: Option<FileDiff>,
    missing_locally: Vec<String>,
    missing_remotely: Vec<String>,
    stats: SessionStats,
}

impl SyncSession {
    /// New session for `role` over `config.root`.
    #[must_use]
    pub fn new(role: Role, config: &SyncConfig) -> Self {
        Self {
            role,
            stage: Stage::first(role),
            root: config.root.clone(),
            strict: config.strict,
            clock_tolerance: config.clock_tolerance,
            codec: Codec::new(),
            local: None,
            remote: None,
            file_diff: None,
            missing_locally: Vec::new(),
            missing_remotely: Vec::new(),
            stats: SessionStats::default(),
        }
    }

    /// Role of this session.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Current stage.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Counters so far.
    #[must_use]
    pub const fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Local snapshot, once built.
    #[must_use]
    pub const fn local_tree(&self) -> Option<&FileTree> {
        self.local.as_ref()
    }

    /// Peer snapshot (responder only), once received.
    #[must_use]
    pub const fn remote_tree(&self) -> Option<&FileTree> {
        self.remote.as_ref()
    }

    /// File actions (responder only), once computed.
    #[must_use]
    pub const fn file_diff(&self) -> Option<&FileDiff> {
        self.file_diff.as_ref()
    }

    /// Run every stage over `stream`.
    ///
    /// The session ends in [`Stage::ConnectionClosed`] whether it succeeds
    /// or not.
    ///
    /// # Errors
    ///
    /// Returns the first session-fatal error: transport failure, protocol
    /// mismatch, or an unusable local root.
    pub fn run<S: Read + Write>(&mut self, stream: &mut S) -> Result<SessionStats> {
        let span = info_span!("session", role = ?self.role);
        let _guard = span.enter();

        let result = match self.role {
            Role::Responder => self.run_responder(stream),
            Role::Initiator => self.run_initiator(stream),
        };
        self.stage = Stage::ConnectionClosed;

        match result {
            Ok(()) => {
                info!(
                    sent = self.stats.files_sent,
                    received = self.stats.files_received,
                    skipped = self.stats.files_skipped,
                    directories = self.stats.directories_created,
                    "Sync complete"
                );
                Ok(self.stats)
            }
            Err(e) => {
                warn!(error = %e, "Session aborted");
                Err(e)
            }
        }
    }

    fn advance(&mut self) {
        if let Some(next) = self.stage.next(self.role) {
            debug!(from = ?self.stage, to = ?next, "Stage complete");
            self.stage = next;
        }
    }

    fn run_responder<S: Read + Write>(&mut self, stream: &mut S) -> Result<()> {
        // AwaitSanityCheck
        let check: SanityCheck = self.codec.expect_payload(stream)?;
        self.check_clock(check);
        self.advance();

        // AwaitRemoteTree
        let remote: FileTree = self.codec.expect_payload(stream)?;
        debug!(
            files = remote.files.len(),
            directories = remote.directories.len(),
            "File tree received"
        );
        self.local = Some(FileTree::build(&self.root)?);
        self.remote = Some(remote);
        self.advance();

        // ComputeDiff
        self.compute_diff();
        self.advance();

        // ExchangeDirectories
        let created = create_directories(&self.root, &self.missing_locally);
        self.stats.directories_created += created;
        for path in &self.missing_remotely {
            self.codec.send(
                stream,
                &DirectoryRequest {
                    relative_path: path.clone(),
                }
                .into(),
            )?;
            self.stats.directories_requested += 1;
        }
        self.codec.send_separator(stream)?;
        self.advance();

        // PushFiles
        let push = self.file_diff.as_ref().map(|d| d.push.clone()).unwrap_or_default();
        push_files(&self.codec, stream, &self.root, &push, &mut self.stats)?;
        self.codec.send_separator(stream)?;
        self.advance();

        // RequestFiles
        let pull = self.file_diff.as_ref().map(|d| d.pull.clone()).unwrap_or_default();
        for path in pull {
            debug!(path = %path, "Requesting file");
            self.codec.send(stream, &FileRequest { relative_path: path }.into())?;
            self.stats.files_requested += 1;
        }
        self.codec.send_separator(stream)?;
        self.advance();

        // PullFiles
        self.pull_files(stream)?;
        self.advance();

        Ok(())
    }

    fn run_initiator<S: Read + Write>(&mut self, stream: &mut S) -> Result<()> {
        // SendSanityCheck
        self.codec.send(stream, &SanityCheck::now().into())?;
        self.advance();

        // SendTree
        let local = FileTree::build(&self.root)?;
        self.codec.send(stream, &local.clone().into())?;
        self.local = Some(local);
        self.advance();

        // ReceiveDirectories
        while let Some(request) = self.codec.receive_payload::<DirectoryRequest, _>(stream)? {
            debug!(path = %request.relative_path, "Creating directory");
            self.stats.directories_created +=
                create_directories(&self.root, std::slice::from_ref(&request.relative_path));
        }
        debug!("Received directories");
        self.advance();

        // PullFiles
        self.pull_files(stream)?;
        debug!("Received files");
        self.advance();

        // ServeRequests
        let mut requested = Vec::new();
        while let Some(request) = self.codec.receive_payload::<FileRequest, _>(stream)? {
            debug!(path = %request.relative_path, "File requested");
            requested.push(request.relative_path);
        }
        push_files(&self.codec, stream, &self.root, &requested, &mut self.stats)?;
        self.codec.send_separator(stream)?;
        debug!("Processed file requests");
        self.advance();

        Ok(())
    }

    fn check_clock(&self, check: SanityCheck) {
        let now = unix_now();
        if check.is_within(now, self.clock_tolerance) {
            debug!("Peer clock is sane");
        } else {
            warn!(
                peer = check.time,
                local = now,
                tolerance = self.clock_tolerance,
                "Sanity check failed, peer clock is skewed"
            );
        }
    }

    fn compute_diff(&mut self) {
        let (Some(local), Some(remote)) = (self.local.as_ref(), self.remote.as_ref()) else {
            return;
        };

        let diff = FileDiff::compute(local, remote);
        self.missing_remotely = missing_directories(local, remote);
        self.missing_locally = missing_directories(remote, local);

        debug!(files = ?diff.push, "Files slated for send");
        debug!(files = ?diff.pull, "File requests");
        debug!(directories = ?self.missing_remotely, "Directory creation requests");
        debug!(directories = ?self.missing_locally, "Creating directories");
        for path in &diff.ties {
            if self.strict {
                warn!(path = %path, "Content differs but mtimes are equal, leaving both copies");
            } else {
                debug!(path = %path, "Content differs but mtimes are equal, leaving both copies");
            }
        }

        self.stats.unresolved = diff.ties.len();
        self.file_diff = Some(diff);
    }

    fn pull_files<R: Read>(&mut self, stream: &mut R) -> Result<()> {
        let received = receive_files(&mut self.codec, stream, &self.root)?;
        self.stats.files_received += received.files;
        self.stats.files_skipped += received.skipped;
        self.stats.bytes_received += received.bytes;
        Ok(())
    }
}

/// Stream `paths` to the peer, skipping files with local problems.
fn push_files<W: Write>(
    codec: &Codec,
    stream: &mut W,
    root: &Path,
    paths: &[String],
    stats: &mut SessionStats,
) -> Result<()> {
    for path in paths {
        match send_file(codec, stream, root, path) {
            Ok(bytes) => {
                stats.files_sent += 1;
                stats.bytes_sent += bytes;
            }
            Err(e) if !e.is_fatal() => {
                warn!(path = %path, error = %e, "Could not send file");
                stats.files_skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Create each directory under `root`, in order. Returns how many were made.
fn create_directories(root: &Path, paths: &[String]) -> usize {
    let mut created = 0;
    for path in paths {
        let result = resolve(root, path)
            .and_then(|dir| fs::create_dir(&dir).map_err(|e| DirSyncError::filesystem(dir, e)));
        match result {
            Ok(()) => created += 1,
            Err(e) => warn!(path = %path, error = %e, "Could not create directory"),
        }
    }
    created
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfigBuilder;
    use crate::protocol::{Frame, Message, MessageType};
    use std::io::Cursor;

    /// In-memory duplex: reads from a scripted buffer, records writes.
    struct ScriptedStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl ScriptedStream {
        fn new(input: Vec<u8>) -> Self {
            Self {
                input: Cursor::new(input),
                output: Vec::new(),
            }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn config(root: &Path) -> SyncConfig {
        SyncConfigBuilder::new(root).build().unwrap()
    }

    // ==========================================================================
    // STAGE ORDER
    // ==========================================================================

    #[test]
    fn responder_stage_order() {
        let mut stage = Stage::first(Role::Responder);
        let mut walked = vec![stage];
        while let Some(next) = stage.next(Role::Responder) {
            walked.push(next);
            stage = next;
        }
        assert_eq!(walked, Stage::sequence(Role::Responder));
        assert_eq!(walked.last(), Some(&Stage::ConnectionClosed));
    }

    #[test]
    fn initiator_stage_order() {
        assert_eq!(Stage::first(Role::Initiator), Stage::SendSanityCheck);
        assert_eq!(
            Stage::ServeRequests.next(Role::Initiator),
            Some(Stage::ConnectionClosed)
        );
        assert_eq!(Stage::ConnectionClosed.next(Role::Initiator), None);
        assert_eq!(Stage::PushFiles.next(Role::Initiator), None);
    }

    #[test]
    fn stages_are_unique_per_role() {
        for role in [Role::Initiator, Role::Responder] {
            let sequence = Stage::sequence(role);
            for (i, stage) in sequence.iter().enumerate() {
                assert!(!sequence[i + 1..].contains(stage), "{stage:?} repeats");
            }
        }
    }

    // ==========================================================================
    // RESPONDER
    // ==========================================================================

    #[test]
    fn responder_rejects_wrong_first_message() {
        let dir = tempfile::tempdir().unwrap();
        let mut input = Vec::new();
        Codec::new()
            .send(&mut input, &FileTree::default().into())
            .unwrap();

        let mut session = SyncSession::new(Role::Responder, &config(dir.path()));
        let err = session.run(&mut ScriptedStream::new(input)).unwrap_err();
        assert!(matches!(
            err,
            DirSyncError::TypeMismatch {
                expected: MessageType::SanityCheck,
                actual: MessageType::TreeSnapshot,
            }
        ));
        assert_eq!(session.stage(), Stage::ConnectionClosed);
    }

    #[test]
    fn responder_aborts_on_stage_end_instead_of_tree() {
        let dir = tempfile::tempdir().unwrap();
        let codec = Codec::new();
        let mut input = Vec::new();
        codec.send(&mut input, &SanityCheck::now().into()).unwrap();
        codec.send_separator(&mut input).unwrap();

        let mut session = SyncSession::new(Role::Responder, &config(dir.path()));
        let err = session.run(&mut ScriptedStream::new(input)).unwrap_err();
        assert!(matches!(err, DirSyncError::UnexpectedStageEnd { .. }));
    }

    #[test]
    fn responder_tolerates_clock_skew() {
        let dir = tempfile::tempdir().unwrap();
        let codec = Codec::new();
        let mut input = Vec::new();
        codec.send(&mut input, &SanityCheck { time: 0 }.into()).unwrap();
        codec.send(&mut input, &FileTree::default().into()).unwrap();
        codec.send_separator(&mut input).unwrap();

        let mut session = SyncSession::new(Role::Responder, &config(dir.path()));
        let stats = session.run(&mut ScriptedStream::new(input)).unwrap();
        assert_eq!(stats, SessionStats::default());
    }

    #[test]
    fn responder_emits_stages_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("local_dir")).unwrap();
        fs::write(dir.path().join("local.txt"), b"mine").unwrap();

        let remote = FileTree {
            files: vec![crate::tree::FileEntry {
                relative_path: "remote.txt".to_string(),
                size: 1,
                mtime: 1,
                hash: "ff".to_string(),
            }],
            directories: vec![crate::tree::DirectoryEntry {
                relative_path: "remote_dir".to_string(),
            }],
        };

        let codec = Codec::new();
        let mut input = Vec::new();
        codec.send(&mut input, &SanityCheck::now().into()).unwrap();
        codec.send(&mut input, &remote.into()).unwrap();
        codec.send_separator(&mut input).unwrap();

        let mut stream = ScriptedStream::new(input);
        let mut session = SyncSession::new(Role::Responder, &config(dir.path()));
        let stats = session.run(&mut stream).unwrap();

        assert!(dir.path().join("remote_dir").is_dir());
        assert_eq!(stats.directories_created, 1);
        assert_eq!(stats.directories_requested, 1);
        assert_eq!(stats.files_sent, 1);
        assert_eq!(stats.files_requested, 1);

        let diff = session.file_diff().unwrap();
        assert_eq!(diff.push, vec!["local.txt"]);
        assert_eq!(diff.pull, vec!["remote.txt"]);

        // Directory stage
        let mut reader = Codec::new();
        let mut out = Cursor::new(stream.output);
        let dir_request: DirectoryRequest = reader.expect_payload(&mut out).unwrap();
        assert_eq!(dir_request.relative_path, "local_dir");
        assert_eq!(
            reader.receive(&mut out, MessageType::DirectoryRequest).unwrap(),
            Frame::StageEnd
        );

        // Push stage: one file then the phase end
        let sink = tempfile::tempdir().unwrap();
        let pushed = receive_files(&mut reader, &mut out, sink.path()).unwrap();
        assert_eq!(pushed.files, 1);

        // Request stage
        let request: FileRequest = reader.expect_payload(&mut out).unwrap();
        assert_eq!(request.relative_path, "remote.txt");
        assert_eq!(
            reader.receive(&mut out, MessageType::FileRequest).unwrap(),
            Frame::StageEnd
        );
        assert_eq!(out.position() as usize, out.get_ref().len());
    }

    #[test]
    fn responder_skips_unsendable_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut stats = SessionStats::default();
        let mut out = Vec::new();

        fs::write(dir.path().join("present"), b"ok").unwrap();
        push_files(
            &Codec::new(),
            &mut out,
            dir.path(),
            &["gone".to_string(), "present".to_string()],
            &mut stats,
        )
        .unwrap();

        assert_eq!(stats.files_sent, 1);
        assert_eq!(stats.files_skipped, 1);
        let mut reader = Codec::new();
        let first = reader
            .receive(&mut Cursor::new(out), MessageType::MinimalFileMetadata)
            .unwrap();
        assert!(matches!(
            first,
            Frame::Message(Message::MinimalFileMetadata(ref m)) if m.relative_path == "present"
        ));
    }

    // ==========================================================================
    // INITIATOR
    // ==========================================================================

    #[test]
    fn initiator_sends_check_and_tree_first() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hi").unwrap();

        let codec = Codec::new();
        let mut input = Vec::new();
        for _ in 0..3 {
            codec.send_separator(&mut input).unwrap();
        }

        let mut stream = ScriptedStream::new(input);
        let mut session = SyncSession::new(Role::Initiator, &config(dir.path()));
        session.run(&mut stream).unwrap();
        assert_eq!(session.stage(), Stage::ConnectionClosed);
        assert!(session.remote_tree().is_none());

        let mut reader = Codec::new();
        let mut out = Cursor::new(stream.output);
        let check: SanityCheck = reader.expect_payload(&mut out).unwrap();
        assert!(check.is_within(unix_now(), 5));
        let tree: FileTree = reader.expect_payload(&mut out).unwrap();
        assert_eq!(tree.files.len(), 1);
        assert_eq!(Some(&tree), session.local_tree());
        assert_eq!(
            reader.receive(&mut out, MessageType::MinimalFileMetadata).unwrap(),
            Frame::StageEnd
        );
    }

    #[test]
    fn initiator_creates_requested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let codec = Codec::new();
        let mut input = Vec::new();
        for path in ["x", "x/y", "../outside"] {
            codec
                .send(
                    &mut input,
                    &DirectoryRequest {
                        relative_path: path.to_string(),
                    }
                    .into(),
                )
                .unwrap();
        }
        for _ in 0..3 {
            codec.send_separator(&mut input).unwrap();
        }

        let mut session = SyncSession::new(Role::Initiator, &config(dir.path()));
        let stats = session.run(&mut ScriptedStream::new(input)).unwrap();
        assert!(dir.path().join("x/y").is_dir());
        assert_eq!(stats.directories_created, 2);
    }

    #[test]
    fn initiator_aborts_on_truncated_stream() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = SyncSession::new(Role::Initiator, &config(dir.path()));
        let err = session.run(&mut ScriptedStream::new(Vec::new())).unwrap_err();
        assert!(matches!(err, DirSyncError::Transport(_)));
        assert_eq!(session.stage(), Stage::ConnectionClosed);
    }
}
