// pyzy/src/log/mod.rs
//
// Copyright (c) 2025 Arcella Team
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE>
// or the MIT license <LICENSE-MIT>, at your option.
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, IsTerminal};
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Deserializer};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    Layer,
};

use crate::error::{PyzyError, Result as PyzyResult};

/// Name of the log file inside [`TracingConfig::dir`].
pub const LOG_FILE_NAME: &str = "pyzy.log";

/// Installs the global tracing subscriber.
///
/// Every writer is synchronous: the template process must stay single
/// threaded, so no background appender thread is started. The stderr layer
/// writes to a duplicate of the daemon's stderr taken here, which workers
/// keep using after they rebind fd 2 to the client's stream.
pub fn init(config: &TracingConfig) -> PyzyResult<()> {
    // Build filter directives
    let mut directives = vec![format!("pyzy={}", config.default_level)];
    for (target, level) in &config.modules {
        directives.push(format!("{}={}", target, level));
    }
    let env_filter = EnvFilter::try_new(directives.join(","))
        .map_err(|e| PyzyError::Config(format!("invalid log filter: {}", e)))?;

    let mut layers = Vec::new();

    // 1. File layer
    if config.file {
        let dir = config
            .dir
            .clone()
            .ok_or_else(|| PyzyError::Config("log.file is set but log.dir is not".into()))?;
        fs::create_dir_all(&dir).map_err(|e| PyzyError::io_with_path(&dir, e))?;

        let file_appender = tracing_appender::rolling::never(&dir, LOG_FILE_NAME);
        let file_layer = if config.structured {
            fmt::layer()
                .json()
                .with_writer(file_appender)
                .with_ansi(false)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .boxed()
        };
        layers.push(file_layer);
    }

    // 2. StdErr layer
    if config.stderr {
        let ansi = io::stderr().is_terminal();
        let daemon_stderr = Mutex::new(File::from(io::stderr().as_fd().try_clone_to_owned()?));
        let console_layer = if config.structured {
            fmt::layer()
                .json()
                .with_writer(daemon_stderr)
                .with_ansi(false)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(daemon_stderr)
                .with_ansi(ansi)
                .boxed()
        };
        layers.push(console_layer);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| PyzyError::Internal(format!("failed to init tracing: {}", e)))?;

    Ok(())
}

/// Helper: deserialize LevelFilter from string (e.g., "info", "debug")
fn deserialize_level_filter<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse::<LevelFilter>().map_err(serde::de::Error::custom)
}

fn deserialize_module_levels<'de, D>(deserializer: D) -> Result<HashMap<String, LevelFilter>, D::Error>
where
    D: Deserializer<'de>,
{
    let map: HashMap<String, String> = Deserialize::deserialize(deserializer)?;
    map.into_iter()
        .map(|(target, level)| {
            level
                .parse::<LevelFilter>()
                .map(|level| (target, level))
                .map_err(serde::de::Error::custom)
        })
        .collect()
}

/// The `[log]` section of the config file.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct TracingConfig {
    #[serde(default = "default_log_level", deserialize_with = "deserialize_level_filter")]
    pub default_level: LevelFilter,

    /// JSON lines instead of human-readable text.
    #[serde(default)]
    pub structured: bool,

    #[serde(default = "default_stderr")]
    pub stderr: bool,

    #[serde(default)]
    pub file: bool,

    /// Directory for [`LOG_FILE_NAME`] when `file` is enabled.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    #[serde(default, deserialize_with = "deserialize_module_levels")]
    pub modules: HashMap<String, LevelFilter>,
}

fn default_log_level() -> LevelFilter { LevelFilter::INFO }
fn default_stderr() -> bool { true }

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_level: default_log_level(),
            structured: false,
            stderr: default_stderr(),
            file: false,
            dir: None,
            modules: HashMap::new(),
        }
    }
}
