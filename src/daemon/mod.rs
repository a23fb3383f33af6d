// pyzy/src/daemon/mod.rs
//
// Copyright (c) 2025 Arcella Team
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE>
// or the MIT license <LICENSE-MIT>, at your option.
// This file may not be copied, modified, or distributed
// except according to those terms.

//! The daemon's control loop.
//!
//! A `current_thread` tokio runtime is used only to wait for the next event.
//! Each connection is then handled synchronously, outside the runtime, so
//! that `fork` always happens on the one and only thread of the process.

use std::io;
use std::os::fd::AsRawFd;

use tokio::runtime::Runtime;

use crate::error::{PyzyError, Result as PyzyResult};
use crate::runtime::PyzyRuntime;

pub mod handler;
pub mod server;
pub mod supervisor;

use server::{ServerEvent, SocketGuard};
use supervisor::{reap_children, Supervisor, SupervisorEvent};

/// Runs the daemon until shutdown.
///
/// Binds the socket, then serves connections strictly one at a time until
/// the idle deadline passes, SIGTERM or SIGINT arrives, or a warm-up leaves
/// threads behind. The socket file is removed on every one of those paths.
///
/// # Arguments
///
/// * `rt` - A `current_thread` runtime with I/O and time drivers enabled.
/// * `state` - The template process state.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound or signal handlers cannot
/// be registered, and a [`PyzyError::WarmupViolation`] when a warm-up was unsafe.
pub fn run(rt: &Runtime, mut state: PyzyRuntime) -> PyzyResult<()> {
    let socket_path = state.config.socket_path.clone();
    let idle_timeout = state.config.idle_timeout();

    // Signal handlers go in before the socket becomes connectable.
    let (listener, guard, mut supervisor) = rt.block_on(async {
        let supervisor = Supervisor::new(idle_timeout)?;
        let listener = server::bind(&socket_path)?;
        let guard = SocketGuard::new(socket_path.clone());
        Ok::<_, PyzyError>((listener, guard, supervisor))
    })?;
    let listener_fd = listener.as_raw_fd();

    tracing::info!(
        socket = ?socket_path,
        runtime = %state.config.runtime_tag,
        idle_timeout = ?idle_timeout,
        "Listening for requests"
    );

    let result = loop {
        match rt.block_on(server::next_event(&listener, &mut supervisor)) {
            ServerEvent::Accepted(Ok(stream)) => {
                supervisor.rearm_idle();
                state.counters.connections += 1;

                let stream = match stream.into_std() {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::error!("Failed to detach connection: {}", e);
                        continue;
                    }
                };
                if let Err(e) = stream.set_nonblocking(false) {
                    tracing::error!("Failed to make connection blocking: {}", e);
                    continue;
                }

                match handler::handle_connection(&mut state, stream, listener_fd) {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => {
                        tracing::error!("Stopping daemon: {}", e);
                        break Err(e);
                    }
                    Err(e) => tracing::warn!("Dropped connection: {}", e),
                }
            }
            ServerEvent::Accepted(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            ServerEvent::Accepted(Err(e)) => tracing::error!("Listener accept error: {}", e),
            ServerEvent::Supervisor(SupervisorEvent::ChildExited) => {
                state.counters.reaped += reap_children();
            }
            ServerEvent::Supervisor(SupervisorEvent::Shutdown(reason)) => {
                tracing::info!("Shutting down: {}", reason);
                break Ok(());
            }
        }
    };

    state.counters.reaped += reap_children();
    drop(listener);
    drop(guard);
    tracing::info!("{}", state.status().summary());

    result
}
