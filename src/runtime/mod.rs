// pyzy/src/runtime/mod.rs
//
// Copyright (c) 2025 Arcella Team
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE>
// or the MIT license <LICENSE-MIT>, at your option.
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::cache::ZygoteCache;
use crate::config::PyzyConfig;
use crate::engine::ScriptEngine;
use crate::error::Result as PyzyResult;

/// Counters kept by the template process.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DaemonCounters {
    pub connections: u64,
    pub spawned: u64,
    pub reaped: u64,
}

struct PyzyRuntimeEnvironment {
    pid: u32,
    start_instant: Instant,
    start_utc: OffsetDateTime,
}

pub struct PyzyRuntimeStatus {
    pub pid: u32,
    pub start_time: OffsetDateTime,
    pub uptime: Duration,
    pub counters: DaemonCounters,
    pub cached_scripts: usize,
    pub warmups: u64,
}

impl PyzyRuntimeStatus {
    /// One-line summary for the shutdown log.
    pub fn summary(&self) -> String {
        let started = self
            .start_time
            .format(&Rfc3339)
            .unwrap_or_else(|_| "<invalid-timestamp>".to_string());
        format!(
            "pid {} started {} up {:?}: {} connections, {} workers spawned, {} reaped, {} scripts cached after {} warm-ups",
            self.pid,
            started,
            self.uptime,
            self.counters.connections,
            self.counters.spawned,
            self.counters.reaped,
            self.cached_scripts,
            self.warmups,
        )
    }
}

/// State of the template process.
///
/// Lives on the daemon's control thread only. Workers receive a
/// copy-on-write image of it through `fork`.
pub struct PyzyRuntime {
    pub config: PyzyConfig,
    pub engine: ScriptEngine,
    pub cache: ZygoteCache,
    /// Host directories preopened for every script.
    pub search_path: Vec<PathBuf>,
    pub counters: DaemonCounters,
    environment: PyzyRuntimeEnvironment,
}

impl PyzyRuntime {
    pub fn new(config: PyzyConfig) -> PyzyResult<Self> {
        let engine = ScriptEngine::new()?;
        tracing::debug!("Initialize script engine");

        let environment = PyzyRuntimeEnvironment {
            pid: std::process::id(),
            start_instant: Instant::now(),
            start_utc: OffsetDateTime::now_utc(),
        };

        Ok(Self {
            search_path: config.search_path.clone(),
            config,
            engine,
            cache: ZygoteCache::new(),
            counters: DaemonCounters::default(),
            environment,
        })
    }

    pub fn uptime(&self) -> Duration {
        self.environment.start_instant.elapsed()
    }

    pub fn status(&self) -> PyzyRuntimeStatus {
        PyzyRuntimeStatus {
            pid: self.environment.pid,
            start_time: self.environment.start_utc,
            uptime: self.uptime(),
            counters: self.counters,
            cached_scripts: self.cache.len(),
            warmups: self.cache.warmups(),
        }
    }
}
