//! TCP bootstrap for both roles.

use std::net::{Shutdown, TcpListener, TcpStream};

use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::error::{DirSyncError, Result};
use crate::session::{Role, SessionStats, SyncSession};

/// Bind `config.address:config.port` and serve responder sessions forever.
///
/// # Errors
///
/// Returns `Transport` if the listener cannot be bound.
pub fn serve(config: &SyncConfig) -> Result<()> {
    let listener =
        TcpListener::bind((config.address.as_str(), config.port)).map_err(DirSyncError::Transport)?;
    info!(address = %config.address, port = config.port, "Listening");
    serve_on(&listener, config)
}

/// Accept connections on `listener` one at a time.
///
/// A failed session is logged and the loop moves on to the next peer.
///
/// # Errors
///
/// Only returns if the listener itself stops yielding connections.
pub fn serve_on(listener: &TcpListener, config: &SyncConfig) -> Result<()> {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(e) = handle_connection(stream, config) {
                    error!(error = %e, "Session failed");
                }
            }
            Err(e) => error!(error = %e, "Connection could not be established"),
        }
    }
    Ok(())
}

/// Run one responder session on an accepted connection.
///
/// # Errors
///
/// Returns the session's fatal error, if any.
pub fn handle_connection(stream: TcpStream, config: &SyncConfig) -> Result<SessionStats> {
    match stream.peer_addr() {
        Ok(peer) => info!(%peer, "Connection established"),
        Err(_) => info!("Connection established"),
    }
    run_session(stream, Role::Responder, config)
}

/// Connect to `config.address:config.port` and run one initiator session.
///
/// # Errors
///
/// Returns `Transport` if the connection fails, or the session's fatal error.
pub fn connect(config: &SyncConfig) -> Result<SessionStats> {
    let stream =
        TcpStream::connect((config.address.as_str(), config.port)).map_err(DirSyncError::Transport)?;
    info!(address = %config.address, port = config.port, "Connected");
    run_session(stream, Role::Initiator, config)
}

fn run_session(mut stream: TcpStream, role: Role, config: &SyncConfig) -> Result<SessionStats> {
    // Many small frames; don't wait to coalesce them.
    if let Err(e) = stream.set_nodelay(true) {
        warn!(error = %e, "Could not disable Nagle's algorithm");
    }

    let mut session = SyncSession::new(role, config);
    let result = session.run(&mut stream);
    let _ = stream.shutdown(Shutdown::Both);
    info!("Connection closed");
    result
}
