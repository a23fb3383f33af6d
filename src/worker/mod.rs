// pyzy/src/worker/mod.rs
//
// Copyright (c) 2025 Arcella Team
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE>
// or the MIT license <LICENSE-MIT>, at your option.
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Worker process: the forked child that serves exactly one request.
//!
//! Lifecycle: `spawned → pid-sent → streams-bound → context-established →
//! executing → status-sent → terminated`. Nothing is retried; every failure
//! jumps straight to reporting a status and `_exit`.

use std::io::{self, Write};
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use nix::libc;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{close, dup2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cache::{ScriptIdentity, WarmupViolation};
use crate::engine::{ScriptContext, ScriptEngine, ScriptOutcome, WarmScript};
use crate::wire::{self, Request};

/// Exit code when the pid could not be sent to the client.
pub const STATUS_PID_NOT_SENT: u32 = 70;

/// Status when the client's standard streams could not be received.
pub const STATUS_STREAMS_NOT_RECEIVED: u32 = 71;

/// Status for request-level errors such as a runtime tag mismatch.
pub const STATUS_REQUEST_ERROR: u32 = 255;

/// Status for script failures and warm-up violations.
pub const STATUS_FAILURE: u32 = 1;

/// Everything the child needs, captured in the template before `fork`.
pub struct WorkerTask<'a> {
    pub stream: UnixStream,
    pub request: Request,
    pub identity: Option<ScriptIdentity>,
    pub deferred_error: Option<String>,
    pub violation: Option<WarmupViolation>,
    pub warm: Option<WarmScript>,
    pub engine: &'a ScriptEngine,
    pub search_path: Vec<PathBuf>,
    pub listener_fd: RawFd,
}

/// Runs the worker to completion and terminates the process.
pub fn run(mut task: WorkerTask<'_>) -> ! {
    reset_inherited_state(task.listener_fd);

    let pid = std::process::id();
    if let Err(e) = wire::write_u32(&mut &task.stream, pid) {
        tracing::error!(pid, "Failed to send worker pid: {}", e);
        terminate(STATUS_PID_NOT_SENT);
    }

    if let Err(e) = bind_standard_streams(&task.stream) {
        tracing::error!(pid, "Failed to receive standard streams: {}", e);
        report(&task.stream, STATUS_STREAMS_NOT_RECEIVED, pid);
    }
    tracing::debug!(pid, "Worker streams bound");

    let status = execute(&mut task);
    report(&task.stream, status, pid)
}

/// Restores default signal handling and closes the inherited listener.
fn reset_inherited_state(listener_fd: RawFd) {
    for sig in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGCHLD] {
        // SAFETY: installing SIG_DFL does not run any handler code.
        if let Err(e) = unsafe { signal(sig, SigHandler::SigDfl) } {
            tracing::warn!("Failed to reset {:?}: {}", sig, e);
        }
    }
    if let Err(e) = close(listener_fd) {
        tracing::warn!("Failed to close inherited listener: {}", e);
    }
}

/// Receives stdin, stdout and stderr in that order and installs them as fds 0-2.
fn bind_standard_streams(stream: &UnixStream) -> io::Result<()> {
    let received = [
        wire::receive_descriptor(stream)?,
        wire::receive_descriptor(stream)?,
        wire::receive_descriptor(stream)?,
    ];
    for (target, fd) in received.into_iter().enumerate() {
        let target = target as RawFd;
        if fd.as_raw_fd() == target {
            let _ = fd.into_raw_fd();
            continue;
        }
        dup2(fd.as_raw_fd(), target)?;
    }
    Ok(())
}

fn execute(task: &mut WorkerTask<'_>) -> u32 {
    if let Some(message) = &task.deferred_error {
        let _ = writeln!(io::stderr(), "pyzy: {}", message);
        return STATUS_REQUEST_ERROR;
    }
    if let Some(violation) = &task.violation {
        let _ = writeln!(io::stderr(), "pyzy: {}", violation);
        return STATUS_FAILURE;
    }
    let Some(identity) = &task.identity else {
        let _ = writeln!(io::stderr(), "pyzy: no script to run");
        return STATUS_REQUEST_ERROR;
    };

    let working_directory = PathBuf::from(&task.request.working_directory);
    if let Err(e) = std::env::set_current_dir(&working_directory) {
        let _ = writeln!(
            io::stderr(),
            "pyzy: cannot enter {}: {}",
            working_directory.display(),
            e
        );
        return STATUS_FAILURE;
    }

    let context = ScriptContext {
        arguments: task.request.script_arguments().to_vec(),
        working_directory: Some(working_directory),
        search_path: task.search_path.clone(),
        random_seed: StdRng::from_entropy().gen(),
    };

    let warm = task.warm.take();
    tracing::debug!(script = %identity, cached = warm.is_some(), "Running script");
    let outcome = task.engine.run_main(identity.path(), warm, &context);

    match &outcome {
        ScriptOutcome::Failed(message) => {
            let _ = writeln!(io::stderr(), "{}", message);
        }
        other => tracing::debug!(script = %identity, "Script finished: {:?}", other),
    }
    outcome.status()
}

/// Flushes the script's output, sends `status` and `pid`, and exits.
fn report(stream: &UnixStream, status: u32, pid: u32) -> ! {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();

    let mut writer = stream;
    let sent = wire::write_u32(&mut writer, status).and_then(|()| wire::write_u32(&mut writer, pid));
    if let Err(e) = sent {
        tracing::warn!(pid, "Failed to send final status {}: {}", status, e);
    }
    tracing::debug!(pid, status, "Worker finished");
    terminate(status)
}

fn terminate(status: u32) -> ! {
    // SAFETY: `_exit` ends the process without running the template's
    // destructors or at-exit handlers.
    unsafe { libc::_exit(status as i32) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_distinct_exit_codes() {
        let codes = [
            STATUS_FAILURE,
            STATUS_PID_NOT_SENT,
            STATUS_STREAMS_NOT_RECEIVED,
            STATUS_REQUEST_ERROR,
        ];
        for (i, code) in codes.iter().enumerate() {
            assert!(*code <= 255);
            assert!(!codes[i + 1..].contains(code));
        }
    }
}
