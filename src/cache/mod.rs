// pyzy/src/cache/mod.rs
//
// Copyright (c) 2025 Arcella Team
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE>
// or the MIT license <LICENSE-MIT>, at your option.
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Zygote cache: scripts warmed once in the template process.
//!
//! Entries are added for the lifetime of the daemon and never removed. A
//! forked worker inherits every warmed instance through copy-on-write and
//! takes its own copy out of the cache before running it.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use thiserror::Error;

use crate::engine::{ScriptEngine, WarmScript};
use crate::error::Result as PyzyResult;

/// Normalized absolute path of a script, used as the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptIdentity(PathBuf);

impl ScriptIdentity {
    /// Resolves `argument` against `working_directory` and normalizes it lexically.
    ///
    /// Symlinks are not followed: `/a/link/../b` becomes `/a/b`.
    pub fn resolve(working_directory: &Path, argument: &str) -> Self {
        Self(normalize(&working_directory.join(argument)))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for ScriptIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Extra threads found in the template process after a warm-up.
#[derive(Debug, Clone, Error)]
#[error(
    "warm-up of {} left {} extra thread(s) running in the template process: {}",
    .script.display(),
    .threads.len(),
    .threads.join(", ")
)]
pub struct WarmupViolation {
    script: PathBuf,
    threads: Vec<String>,
}

impl WarmupViolation {
    pub fn new(script: PathBuf, threads: Vec<String>) -> Self {
        Self { script, threads }
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    pub fn threads(&self) -> &[String] {
        &self.threads
    }
}

/// Describes every thread of this process other than the calling one.
///
/// Returns an empty list on platforms without `/proc/self/task`.
pub fn extra_threads() -> io::Result<Vec<String>> {
    #[cfg(target_os = "linux")]
    {
        let current = nix::unistd::gettid().as_raw();
        let mut extra = Vec::new();
        for entry in std::fs::read_dir("/proc/self/task")? {
            let entry = entry?;
            let Some(tid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i32>().ok())
            else {
                continue;
            };
            if tid == current {
                continue;
            }
            let name = std::fs::read_to_string(entry.path().join("comm"))
                .map(|comm| comm.trim_end().to_string())
                .unwrap_or_else(|_| "?".to_string());
            extra.push(format!("tid {} ({})", tid, name));
        }
        extra.sort();
        Ok(extra)
    }

    #[cfg(not(target_os = "linux"))]
    {
        Ok(Vec::new())
    }
}

/// Returns freed heap pages to the OS where the allocator supports it.
pub fn compact_heap() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        // SAFETY: malloc_trim only walks the allocator's own free lists.
        let released = unsafe { nix::libc::malloc_trim(0) };
        tracing::trace!(released = released != 0, "Compacted template heap");
    }
}

/// Scripts warmed in the template process, keyed by identity.
#[derive(Default)]
pub struct ZygoteCache {
    entries: HashMap<ScriptIdentity, WarmScript>,
    warmups: u64,
}

impl ZygoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, identity: &ScriptIdentity) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of warm-up evaluations performed so far.
    pub fn warmups(&self) -> u64 {
        self.warmups
    }

    /// Warms `identity` in this process and records it.
    ///
    /// A script that fails to load or instantiate is logged and left out of
    /// the cache. The thread census runs after every attempt, and the only
    /// error returned is a [`WarmupViolation`], which is fatal to the daemon.
    pub fn warm(&mut self, engine: &ScriptEngine, identity: &ScriptIdentity) -> PyzyResult<()> {
        self.warm_with(engine, identity, extra_threads)
    }

    fn warm_with<F>(
        &mut self,
        engine: &ScriptEngine,
        identity: &ScriptIdentity,
        census: F,
    ) -> PyzyResult<()>
    where
        F: FnOnce() -> io::Result<Vec<String>>,
    {
        if self.contains(identity) {
            return Ok(());
        }

        let started = Instant::now();
        self.warmups += 1;
        let evaluated = engine.warm(identity.path());

        // A start section may have started threads even when it then failed.
        let threads = match census() {
            Ok(threads) => threads,
            Err(e) => {
                tracing::warn!("Thread census unavailable: {}", e);
                Vec::new()
            }
        };
        compact_heap();

        match evaluated {
            Ok(warm) => {
                self.entries.insert(identity.clone(), warm);
                tracing::info!(script = %identity, "Warmed script in {:?}", started.elapsed());
            }
            Err(e) => {
                tracing::warn!(script = %identity, "Warm-up failed, running uncached: {}", e);
            }
        }

        if threads.is_empty() {
            Ok(())
        } else {
            Err(WarmupViolation::new(identity.path().to_path_buf(), threads).into())
        }
    }

    /// Removes and returns the warm instance for `identity`.
    ///
    /// Called in a worker, which owns a private copy of the cache.
    pub fn take(&mut self, identity: &ScriptIdentity) -> Option<WarmScript> {
        self.entries.remove(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PyzyError;
    use tempfile::TempDir;

    const EXIT_SEVEN: &str = r#"(module
        (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
        (memory (export "memory") 1)
        (func (export "_start") (call $exit (i32.const 7))))"#;

    fn no_threads() -> io::Result<Vec<String>> {
        Ok(Vec::new())
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let cwd = Path::new("/srv/jobs");
        assert_eq!(
            ScriptIdentity::resolve(cwd, "./bin/../run.wasm").path(),
            Path::new("/srv/jobs/run.wasm")
        );
        assert_eq!(
            ScriptIdentity::resolve(cwd, "/opt/./tool.wat").path(),
            Path::new("/opt/tool.wat")
        );
        assert_eq!(
            ScriptIdentity::resolve(Path::new("/"), "../../x.wasm").path(),
            Path::new("/x.wasm")
        );
    }

    #[test]
    fn test_same_script_different_spelling_is_same_identity() {
        let a = ScriptIdentity::resolve(Path::new("/tmp"), "ok.wat");
        let b = ScriptIdentity::resolve(Path::new("/var"), "../tmp/./ok.wat");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "/tmp/ok.wat");
    }

    #[test]
    fn test_warm_once_per_identity() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("seven.wat"), EXIT_SEVEN).unwrap();
        let identity = ScriptIdentity::resolve(dir.path(), "seven.wat");
        let engine = ScriptEngine::new().unwrap();
        let mut cache = ZygoteCache::new();

        cache.warm_with(&engine, &identity, no_threads).unwrap();
        cache.warm_with(&engine, &identity, no_threads).unwrap();

        assert!(cache.contains(&identity));
        assert_eq!(cache.warmups(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failed_warm_up_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let identity = ScriptIdentity::resolve(dir.path(), "missing.wasm");
        let engine = ScriptEngine::new().unwrap();
        let mut cache = ZygoteCache::new();

        cache.warm_with(&engine, &identity, no_threads).unwrap();

        assert!(!cache.contains(&identity));
        assert!(cache.is_empty());
        assert_eq!(cache.warmups(), 1);
    }

    #[test]
    fn test_extra_threads_are_a_violation() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("seven.wat"), EXIT_SEVEN).unwrap();
        let identity = ScriptIdentity::resolve(dir.path(), "seven.wat");
        let engine = ScriptEngine::new().unwrap();
        let mut cache = ZygoteCache::new();

        let err = cache
            .warm_with(&engine, &identity, || Ok(vec!["tid 4242 (helper)".to_string()]))
            .unwrap_err();

        assert!(err.is_fatal());
        match err {
            PyzyError::WarmupViolation(violation) => {
                assert_eq!(violation.script(), identity.path());
                assert_eq!(violation.threads(), &["tid 4242 (helper)".to_string()]);
                assert!(violation.to_string().contains("helper"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        // The script stays cached; the daemon is about to stop anyway.
        assert!(cache.contains(&identity));
    }

    #[test]
    fn test_failed_warm_up_with_extra_threads_is_a_violation() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("trap_in_start.wat"),
            r#"(module
                (func $init unreachable)
                (start $init)
                (func (export "_start")))"#,
        )
        .unwrap();
        let identity = ScriptIdentity::resolve(dir.path(), "trap_in_start.wat");
        let engine = ScriptEngine::new().unwrap();
        let mut cache = ZygoteCache::new();

        let err = cache
            .warm_with(&engine, &identity, || Ok(vec!["tid 4243 (io)".to_string()]))
            .unwrap_err();

        assert!(err.is_fatal());
        assert!(matches!(err, PyzyError::WarmupViolation(_)));
        assert!(!cache.contains(&identity));
        assert_eq!(cache.warmups(), 1);
    }

    #[test]
    fn test_take_removes_entry() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("seven.wat"), EXIT_SEVEN).unwrap();
        let identity = ScriptIdentity::resolve(dir.path(), "seven.wat");
        let engine = ScriptEngine::new().unwrap();
        let mut cache = ZygoteCache::new();
        cache.warm_with(&engine, &identity, no_threads).unwrap();

        assert!(cache.take(&identity).is_some());
        assert!(cache.take(&identity).is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_census_sees_spawned_thread() {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let probe = std::thread::Builder::new()
            .name("census-probe".into())
            .spawn(move || {
                ready_tx.send(()).unwrap();
                let _ = stop_rx.recv();
            })
            .unwrap();
        ready_rx.recv().unwrap();

        let threads = extra_threads().unwrap();
        assert!(threads.iter().any(|t| t.contains("census-probe")));

        drop(stop_tx);
        probe.join().unwrap();
    }
}
