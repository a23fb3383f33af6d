// pyzy/src/daemon/handler.rs
//
// Copyright (c) 2025 Arcella Team
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE>
// or the MIT license <LICENSE-MIT>, at your option.
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::io;
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::unistd::{fork, ForkResult};

use crate::cache::ScriptIdentity;
use crate::env::EnvironmentScope;
use crate::error::{PyzyError, Result as PyzyResult};
use crate::runtime::PyzyRuntime;
use crate::wire::Request;
use crate::worker::{self, WorkerTask};

/// Serves one connection: read the request, maybe warm, fork a worker.
///
/// Returns as soon as the worker exists; the worker talks to the client on
/// its own. The daemon environment and search path are restored before
/// returning, whatever happened.
///
/// # Arguments
///
/// * `state` - The template process state.
/// * `stream` - The accepted connection, in blocking mode.
/// * `listener_fd` - The listening socket, closed in the worker.
///
/// # Errors
///
/// Framing and fork failures are connection-scoped. A
/// [`PyzyError::WarmupViolation`] is fatal and must stop the daemon.
pub fn handle_connection(
    state: &mut PyzyRuntime,
    mut stream: UnixStream,
    listener_fd: RawFd,
) -> PyzyResult<()> {
    let request = Request::read_from(&mut stream).map_err(|e| match e.kind() {
        io::ErrorKind::InvalidData => PyzyError::Protocol(e.to_string()),
        _ => PyzyError::Io(e),
    })?;
    tracing::debug!(
        cwd = %request.working_directory,
        args = ?request.arguments,
        "Received request"
    );

    let mut scope = EnvironmentScope::enter(&request.environment, &mut state.search_path);

    let identity = request
        .script_argument()
        .map(|argument| ScriptIdentity::resolve(Path::new(&request.working_directory), argument));
    let deferred_error = deferred_error(&request, identity.is_some(), &state.config.runtime_tag);

    let mut violation = None;
    if let (None, Some(identity)) = (&deferred_error, &identity) {
        if request.cache_requested() && !state.cache.contains(identity) {
            match state.cache.warm(&state.engine, identity) {
                Ok(()) => {}
                Err(PyzyError::WarmupViolation(v)) => {
                    tracing::error!("{}", v);
                    violation = Some(v);
                }
                Err(e) => tracing::warn!(script = %identity, "Warm-up error: {}", e),
            }
        }
    }

    // SAFETY: the template process is single threaded at this point. The
    // child only runs the worker and leaves through `_exit`.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            state.counters.spawned += 1;
            tracing::debug!(pid = child.as_raw(), "Spawned worker");
            drop(stream);
            drop(scope);
            match violation {
                Some(v) => Err(v.into()),
                None => Ok(()),
            }
        }
        Ok(ForkResult::Child) => {
            scope.prepend_search_path(request.extra_search_path());
            let search_path = scope.search_path().to_vec();
            // The worker keeps the merged environment until it exits.
            std::mem::forget(scope);

            let warm = identity.as_ref().and_then(|id| state.cache.take(id));
            worker::run(WorkerTask {
                stream,
                request,
                identity,
                deferred_error,
                violation,
                warm,
                engine: &state.engine,
                search_path,
                listener_fd,
            })
        }
        Err(e) => {
            drop(scope);
            tracing::error!("Failed to fork worker: {}", e);
            match violation {
                Some(v) => Err(v.into()),
                None => Err(PyzyError::Sys(e)),
            }
        }
    }
}

/// Request-level error reported through the worker's status, if any.
fn deferred_error(request: &Request, has_script: bool, daemon_tag: &str) -> Option<String> {
    if let Some(tag) = request.runtime_tag().filter(|tag| !tag.is_empty()) {
        if tag != daemon_tag {
            return Some(format!(
                "runtime mismatch: client expects {:?} but the daemon runs {:?}",
                tag, daemon_tag
            ));
        }
    }
    if !has_script {
        return Some("missing script argument".to_string());
    }
    None
}
