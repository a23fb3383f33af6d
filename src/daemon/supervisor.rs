// pyzy/src/daemon/supervisor.rs
//
// Copyright (c) 2025 Arcella Team
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE>
// or the MIT license <LICENSE-MIT>, at your option.
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Process supervision: reaping workers, the idle deadline and termination signals.

use std::fmt;
use std::io;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::time::{sleep_until, Instant};

/// Why the daemon is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Idle,
    Terminated,
    Interrupted,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Idle => write!(f, "idle timeout"),
            ShutdownReason::Terminated => write!(f, "SIGTERM"),
            ShutdownReason::Interrupted => write!(f, "SIGINT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// At least one worker changed state; call [`reap_children`].
    ChildExited,
    Shutdown(ShutdownReason),
}

/// Deadline after which an idle daemon shuts down. Disabled when `timeout` is `None`.
#[derive(Debug)]
pub struct IdleTimer {
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl IdleTimer {
    /// Creates a timer that is already armed.
    pub fn new(timeout: Option<Duration>) -> Self {
        let mut timer = Self {
            timeout,
            deadline: None,
        };
        timer.rearm();
        timer
    }

    /// Pushes the deadline to `timeout` from now.
    pub fn rearm(&mut self) {
        self.deadline = self.timeout.map(|timeout| Instant::now() + timeout);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Completes when the deadline passes. Never completes when disabled.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

/// Signal streams and the idle timer of the template process.
pub struct Supervisor {
    child: Signal,
    terminate: Signal,
    interrupt: Signal,
    idle: IdleTimer,
}

impl Supervisor {
    /// Registers the signal handlers. Must be called within the tokio runtime.
    pub fn new(idle_timeout: Option<Duration>) -> io::Result<Self> {
        Ok(Self {
            child: signal(SignalKind::child())?,
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            idle: IdleTimer::new(idle_timeout),
        })
    }

    /// Re-arms the idle deadline; called for every accepted connection.
    pub fn rearm_idle(&mut self) {
        self.idle.rearm();
    }

    /// Waits for the next supervision event.
    pub async fn next(&mut self) -> SupervisorEvent {
        tokio::select! {
            _ = self.child.recv() => SupervisorEvent::ChildExited,
            _ = self.terminate.recv() => SupervisorEvent::Shutdown(ShutdownReason::Terminated),
            _ = self.interrupt.recv() => SupervisorEvent::Shutdown(ShutdownReason::Interrupted),
            _ = self.idle.expired() => SupervisorEvent::Shutdown(ShutdownReason::Idle),
        }
    }
}

/// Reaps every finished child without blocking and returns how many were collected.
///
/// Having no children left is normal. Other `waitpid` failures are logged.
pub fn reap_children() -> u64 {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(WaitStatus::Exited(pid, code)) => {
                reaped += 1;
                tracing::debug!(pid = pid.as_raw(), code, "Reaped worker");
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                reaped += 1;
                tracing::debug!(pid = pid.as_raw(), "Reaped worker killed by {:?}", sig);
            }
            Ok(other) => tracing::trace!("Ignoring child state change {:?}", other),
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(e) => {
                tracing::warn!("Failed to reap workers: {}", e);
                break;
            }
        }
    }
    reaped
}
