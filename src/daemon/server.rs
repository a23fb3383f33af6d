// pyzy/src/daemon/server.rs
//
// Copyright (c) 2025 Arcella Team
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE>
// or the MIT license <LICENSE-MIT>, at your option.
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Listening socket of the daemon.
//!
//! The server:
//! - Binds a filesystem socket with `0o600` permissions
//! - Refuses to start when something already exists at the socket path
//! - Waits for either a connection or a supervision event, one at a time
//! - Removes the socket file exactly once, when the accept loop ends

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};

use super::supervisor::{Supervisor, SupervisorEvent};
use crate::error::{PyzyError, Result as PyzyResult};

/// Something the accept loop has to act on.
#[derive(Debug)]
pub enum ServerEvent {
    Accepted(io::Result<UnixStream>),
    Supervisor(SupervisorEvent),
}

/// Binds the daemon socket at `socket_path`.
///
/// A stale socket file is not removed: an existing path makes the bind fail
/// and the daemon refuses to start. Must be called within the tokio runtime.
///
/// # Errors
///
/// Returns an error if:
/// - The socket cannot be bound (existing file, missing directory, permissions).
/// - The socket file permissions cannot be set.
pub fn bind(socket_path: &Path) -> PyzyResult<UnixListener> {
    let listener =
        UnixListener::bind(socket_path).map_err(|e| PyzyError::io_with_path(socket_path, e))?;
    tracing::debug!("Bind server to socket: {:?}", socket_path);

    if let Err(e) = fs::set_permissions(socket_path, fs::Permissions::from_mode(0o600)) {
        let _ = fs::remove_file(socket_path);
        return Err(PyzyError::io_with_path(socket_path, e));
    }
    tracing::debug!("Set permissions on socket: {:?}", socket_path);

    Ok(listener)
}

/// Removes the socket file when dropped.
///
/// Only the template process drops it: workers leave through `_exit`.
#[derive(Debug)]
pub struct SocketGuard {
    path: PathBuf,
}

impl SocketGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Removed socket {:?}", self.path),
            Err(e) => tracing::error!("Failed to remove socket {:?}: {}", self.path, e),
        }
    }
}

/// Waits for the next connection or supervision event.
///
/// # Arguments
///
/// * `listener` - The bound daemon socket.
/// * `supervisor` - Signal streams and idle deadline.
pub async fn next_event(listener: &UnixListener, supervisor: &mut Supervisor) -> ServerEvent {
    tokio::select! {
        accepted = listener.accept() => ServerEvent::Accepted(accepted.map(|(stream, _addr)| stream)),
        event = supervisor.next() => ServerEvent::Supervisor(event),
    }
}
