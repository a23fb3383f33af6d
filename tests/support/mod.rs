// pyzy/tests/support/mod.rs
//
// Copyright (c) 2025 Arcella Team
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE>
// or the MIT license <LICENSE-MIT>, at your option.
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Test client and daemon harness.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use pyzy::wire::{self, Request};
use tempfile::TempDir;

const DAEMON_ENV: &[&str] = &[
    "PYZY_SOCKET",
    "PYZY_IDLE_TIMEOUT",
    "PYZY_RUNTIME",
    "PYZY_SEARCH_PATH",
    "PYZY_CONFIG",
    "PYZY_DEBUG",
];

/// A daemon process running on a private socket.
pub struct Daemon {
    pub dir: TempDir,
    pub socket: PathBuf,
    log_path: PathBuf,
    child: Child,
}

impl Daemon {
    /// Starts a daemon and waits until its socket accepts connections.
    pub fn start(extra_args: &[&str]) -> Self {
        let daemon = Self::spawn(extra_args, |_| {});
        daemon.wait_ready();
        daemon
    }

    /// Starts a daemon without waiting; `prepare` may populate the directory first.
    pub fn spawn(extra_args: &[&str], prepare: impl FnOnce(&Path)) -> Self {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("pyzy.sock");
        let log_path = dir.path().join("daemon.log");
        let config_path = dir.path().join("pyzy.toml");
        std::fs::write(&config_path, "").unwrap();
        prepare(dir.path());

        let mut command = Command::new(env!("CARGO_BIN_EXE_pyzy"));
        command
            .arg("--socket")
            .arg(&socket)
            .arg("--config")
            .arg(&config_path)
            .args(extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(File::create(&log_path).unwrap()));
        for key in DAEMON_ENV {
            command.env_remove(key);
        }
        let child = command.spawn().unwrap();

        Self {
            dir,
            socket,
            log_path,
            child,
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn wait_ready(&self) {
        let deadline = Instant::now() + Duration::from_secs(20);
        while Instant::now() < deadline {
            if UnixStream::connect(&self.socket).is_ok() {
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("daemon did not start; log:\n{}", self.log());
    }

    /// Waits for the daemon to exit on its own.
    pub fn wait_exit(&mut self, timeout: Duration) -> ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status;
            }
            if Instant::now() >= deadline {
                panic!("daemon still running; log:\n{}", self.log());
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn log(&self) -> String {
        std::fs::read_to_string(&self.log_path).unwrap_or_default()
    }

    /// Connection that has not sent anything yet.
    pub fn connect(&self) -> UnixStream {
        UnixStream::connect(&self.socket).unwrap()
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Everything the client observed for one invocation.
#[derive(Debug)]
pub struct Outcome {
    pub pid: u32,
    pub status: u32,
    pub status_pid: u32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs one invocation through the daemon like the real client does.
pub fn invoke(socket: &Path, cwd: &Path, env: &[(&str, &str)], args: &[&str]) -> Outcome {
    let request = Request {
        working_directory: cwd.to_string_lossy().into_owned(),
        environment: env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        arguments: args.iter().map(|a| a.to_string()).collect(),
    };

    let mut stream = UnixStream::connect(socket).unwrap();
    request.write_to(&mut stream).unwrap();
    let pid = wire::read_u32(&mut stream).unwrap();

    let stdin = tempfile::tempfile().unwrap();
    let mut stdout = tempfile::tempfile().unwrap();
    let mut stderr = tempfile::tempfile().unwrap();
    for file in [&stdin, &stdout, &stderr] {
        wire::send_descriptor(&stream, file.as_raw_fd()).unwrap();
    }

    let status = wire::read_u32(&mut stream).unwrap();
    let status_pid = wire::read_u32(&mut stream).unwrap();

    Outcome {
        pid,
        status,
        status_pid,
        stdout: read_back(&mut stdout),
        stderr: read_back(&mut stderr),
    }
}

fn read_back(file: &mut File) -> String {
    file.seek(SeekFrom::Start(0)).unwrap();
    let mut contents = String::new();
    file.read_to_string(&mut contents).unwrap();
    contents
}

pub fn write_script(dir: &Path, name: &str, source: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, source).unwrap();
    path
}

/// A command module whose `_start` calls `proc_exit(code)`.
pub fn exit_script(code: u32) -> String {
    format!(
        r#"(module
            (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
            (memory (export "memory") 1)
            (func (export "_start") (call $exit (i32.const {}))))"#,
        code
    )
}

/// Increments a byte of linear memory, then prints it.
pub const COUNTER_SCRIPT: &str = r#"(module
    (import "wasi_snapshot_preview1" "fd_write"
        (func $fd_write (param i32 i32 i32 i32) (result i32)))
    (memory (export "memory") 1)
    (data (i32.const 100) "0")
    (func (export "_start")
        (i32.store8 (i32.const 100)
            (i32.add (i32.load8_u (i32.const 100)) (i32.const 1)))
        (i32.store (i32.const 0) (i32.const 100))
        (i32.store (i32.const 4) (i32.const 1))
        (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))))"#;

/// Prints its whole environment block (NUL-separated) to stdout.
pub const ENVIRON_SCRIPT: &str = r#"(module
    (import "wasi_snapshot_preview1" "environ_sizes_get"
        (func $sizes (param i32 i32) (result i32)))
    (import "wasi_snapshot_preview1" "environ_get"
        (func $get (param i32 i32) (result i32)))
    (import "wasi_snapshot_preview1" "fd_write"
        (func $fd_write (param i32 i32 i32 i32) (result i32)))
    (memory (export "memory") 4)
    (func (export "_start")
        (drop (call $sizes (i32.const 0) (i32.const 4)))
        (drop (call $get (i32.const 1024) (i32.const 16384)))
        (i32.store (i32.const 16) (i32.const 16384))
        (i32.store (i32.const 20) (i32.load (i32.const 4)))
        (drop (call $fd_write (i32.const 1) (i32.const 16) (i32.const 1) (i32.const 24)))))"#;

/// Traps as soon as `_start` runs.
pub const TRAP_SCRIPT: &str = r#"(module
    (memory (export "memory") 1)
    (func (export "_start") unreachable))"#;

/// Writes to stdout from its start section, which runs during warm-up.
pub const START_WRITE_SCRIPT: &str = r#"(module
    (import "wasi_snapshot_preview1" "fd_write"
        (func $fd_write (param i32 i32 i32 i32) (result i32)))
    (memory (export "memory") 1)
    (data (i32.const 100) "w")
    (func $init
        (i32.store (i32.const 0) (i32.const 100))
        (i32.store (i32.const 4) (i32.const 1))
        (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8))))
    (start $init)
    (func (export "_start")))"#;

/// Writes to stdout from its start section, then traps there.
pub const START_WRITE_TRAP_SCRIPT: &str = r#"(module
    (import "wasi_snapshot_preview1" "fd_write"
        (func $fd_write (param i32 i32 i32 i32) (result i32)))
    (memory (export "memory") 1)
    (data (i32.const 100) "w")
    (func $init
        (i32.store (i32.const 0) (i32.const 100))
        (i32.store (i32.const 4) (i32.const 1))
        (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))
        unreachable)
    (start $init)
    (func (export "_start")))"#;

/// Exits with the errno of `fd_prestat_get(4)`: 0 when a search path
/// directory follows the working directory preopen, 8 (EBADF) otherwise.
pub const SEARCH_PATH_SCRIPT: &str = r#"(module
    (import "wasi_snapshot_preview1" "fd_prestat_get"
        (func $prestat (param i32 i32) (result i32)))
    (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
    (memory (export "memory") 1)
    (func (export "_start")
        (call $exit (call $prestat (i32.const 4) (i32.const 16)))))"#;
