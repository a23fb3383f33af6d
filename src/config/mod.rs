// pyzy/src/config/mod.rs
//
// Copyright (c) 2025 Arcella Team
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE>
// or the MIT license <LICENSE-MIT>, at your option.
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Daemon configuration.
//!
//! Values are resolved in layers, each overriding the previous one:
//! built-in defaults, the TOML config file, `PYZY_*` environment variables
//! and finally command-line flags.
//!
//! ```toml
//! socket_path = "/run/user/1000/pyzy.sock"
//! idle_timeout = 600
//! runtime_tag = "wasmtime-wasi-p1"
//! search_path = ["/opt/pyzy/lib"]
//!
//! [log]
//! default_level = "info"
//! file = true
//! dir = "/var/log/pyzy"
//!
//! [log.modules]
//! wasmtime = "warn"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::unistd::{getuid, User};
use serde::Deserialize;
use tracing_subscriber::filter::LevelFilter;

use crate::error::{PyzyError, Result as PyzyResult};
use crate::log::TracingConfig;

pub const ENV_SOCKET: &str = "PYZY_SOCKET";
pub const ENV_IDLE_TIMEOUT: &str = "PYZY_IDLE_TIMEOUT";
pub const ENV_RUNTIME: &str = "PYZY_RUNTIME";
pub const ENV_SEARCH_PATH: &str = "PYZY_SEARCH_PATH";
pub const ENV_CONFIG: &str = "PYZY_CONFIG";
pub const ENV_DEBUG: &str = "PYZY_DEBUG";

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_RUNTIME_TAG: &str = "wasmtime-wasi-p1";

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct PyzyConfig {
    pub socket_path: PathBuf,
    /// Seconds without a new connection before shutdown; `0` disables.
    pub idle_timeout_secs: u64,
    pub runtime_tag: String,
    pub search_path: Vec<PathBuf>,
    pub log: TracingConfig,
    /// The file the configuration was read from, if any.
    pub config_file: Option<PathBuf>,
}

impl PyzyConfig {
    /// Defaults for the invoking user, before any file or override.
    pub fn defaults() -> Self {
        Self {
            socket_path: default_socket_path(),
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            runtime_tag: DEFAULT_RUNTIME_TAG.to_string(),
            search_path: Vec::new(),
            log: TracingConfig::default(),
            config_file: None,
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// Values given on the command line. `None` leaves the lower layers alone.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_file: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
    pub idle_timeout_secs: Option<u64>,
    pub runtime_tag: Option<String>,
    pub search_path: Vec<PathBuf>,
    pub verbose: bool,
}

/// Shape of the TOML config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    socket_path: Option<PathBuf>,
    idle_timeout: Option<u64>,
    runtime_tag: Option<String>,
    search_path: Option<Vec<PathBuf>>,
    log: Option<TracingConfig>,
}

/// `/tmp/pyzy-<username>.sock` for the real uid, falling back to the numeric uid.
pub fn default_socket_path() -> PathBuf {
    let uid = getuid();
    let user = match User::from_uid(uid) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    };
    PathBuf::from(format!("/tmp/pyzy-{}.sock", user))
}

fn default_config_file() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".pyzy").join("pyzy.toml"))
}

/// Loads the configuration.
///
/// # Arguments
///
/// * `overrides` - Command-line values, applied last.
/// * `lookup` - Environment lookup, usually `|key| std::env::var(key).ok()`.
///
/// # Errors
///
/// Returns [`PyzyError::Config`] for an unreadable explicit config file, a
/// malformed file or an invalid environment value.
pub fn load<F>(overrides: &ConfigOverrides, lookup: F) -> PyzyResult<PyzyConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = PyzyConfig::defaults();

    // 1. Config file
    let explicit = overrides
        .config_file
        .clone()
        .or_else(|| lookup(ENV_CONFIG).filter(|v| !v.is_empty()).map(PathBuf::from));
    let file = match explicit {
        Some(path) => Some((read_config_file(&path)?, path)),
        None => match default_config_file().filter(|path| path.is_file()) {
            Some(path) => Some((read_config_file(&path)?, path)),
            None => None,
        },
    };
    if let Some((file, path)) = file {
        apply_file(&mut config, file);
        config.config_file = Some(path);
    }

    // 2. Environment
    if let Some(socket) = lookup(ENV_SOCKET).filter(|v| !v.is_empty()) {
        config.socket_path = PathBuf::from(socket);
    }
    if let Some(raw) = lookup(ENV_IDLE_TIMEOUT) {
        config.idle_timeout_secs = raw.trim().parse().map_err(|e| {
            PyzyError::Config(format!("{}={:?} is not a number of seconds: {}", ENV_IDLE_TIMEOUT, raw, e))
        })?;
    }
    if let Some(tag) = lookup(ENV_RUNTIME).filter(|v| !v.is_empty()) {
        config.runtime_tag = tag;
    }
    if let Some(path) = lookup(ENV_SEARCH_PATH) {
        config.search_path = split_search_path(&path);
    }
    if lookup(ENV_DEBUG).is_some_and(|v| !v.is_empty() && v != "0") {
        config.log.default_level = LevelFilter::DEBUG;
    }

    // 3. Command line
    if let Some(socket) = &overrides.socket_path {
        config.socket_path = socket.clone();
    }
    if let Some(secs) = overrides.idle_timeout_secs {
        config.idle_timeout_secs = secs;
    }
    if let Some(tag) = &overrides.runtime_tag {
        config.runtime_tag = tag.clone();
    }
    if !overrides.search_path.is_empty() {
        config.search_path = overrides.search_path.clone();
    }
    if overrides.verbose {
        config.log.default_level = LevelFilter::DEBUG;
    }

    if config.runtime_tag.is_empty() {
        return Err(PyzyError::Config("runtime tag must not be empty".into()));
    }
    Ok(config)
}

fn read_config_file(path: &Path) -> PyzyResult<FileConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| PyzyError::Config(format!("cannot read {:?}: {}", path, e)))?;
    toml::from_str(&contents).map_err(|e| PyzyError::Config(format!("{:?}: {}", path, e)))
}

fn apply_file(config: &mut PyzyConfig, file: FileConfig) {
    if let Some(socket) = file.socket_path {
        config.socket_path = socket;
    }
    if let Some(secs) = file.idle_timeout {
        config.idle_timeout_secs = secs;
    }
    if let Some(tag) = file.runtime_tag {
        config.runtime_tag = tag;
    }
    if let Some(search_path) = file.search_path {
        config.search_path = search_path;
    }
    if let Some(log) = file.log {
        config.log = log;
    }
}

/// Splits a colon-separated path list, dropping empty entries.
pub fn split_search_path(value: &str) -> Vec<PathBuf> {
    value
        .split(':')
        .filter(|entry| !entry.is_empty())
        .map(PathBuf::from)
        .collect()
}
