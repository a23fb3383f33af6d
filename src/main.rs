// pyzy/src/main.rs
//
// Copyright (c) 2025 Arcella Team
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE>
// or the MIT license <LICENSE-MIT>, at your option.
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::path::PathBuf;

use clap::Parser;

use pyzy::config::{self, ConfigOverrides};
use pyzy::error::AnyResult;
use pyzy::{daemon, log, runtime};

/// pyzy: warm-start daemon for WebAssembly scripts
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path of the listening socket [default: /tmp/pyzy-<user>.sock]
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Seconds without connections before shutting down (0 disables)
    #[arg(long, value_name = "SECS")]
    idle_timeout: Option<u64>,

    /// Runtime tag clients must match
    #[arg(long, value_name = "TAG")]
    runtime_tag: Option<String>,

    /// Directory preopened for every script (repeatable)
    #[arg(long = "search-path", value_name = "DIR")]
    search_path: Vec<PathBuf>,

    /// Config file [default: ~/.pyzy/pyzy.toml]
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            config_file: self.config.clone(),
            socket_path: self.socket.clone(),
            idle_timeout_secs: self.idle_timeout,
            runtime_tag: self.runtime_tag.clone(),
            search_path: self.search_path.clone(),
            verbose: self.verbose,
        }
    }
}

fn main() -> AnyResult<()> {
    // 1. Load configuration
    let cli = Cli::parse();
    let config = config::load(&cli.overrides(), |key| std::env::var(key).ok())?;

    // 2. Initialize logging (should be the first side effect)
    log::init(&config.log)?;
    tracing::info!("Starting up (v{})", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config.config_file {
        tracing::debug!("Loaded config from {:?}", path);
    }

    // 3. Template process state: engine and zygote cache
    let state = runtime::PyzyRuntime::new(config)?;
    tracing::debug!("Initialize core runtime");

    // 4. Single-threaded event loop; forking requires exactly one thread
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    if let Err(e) = daemon::run(&rt, state) {
        tracing::error!("Daemon failed: {}", e);
        return Err(e.into());
    }

    tracing::info!("Shutting down");
    Ok(())
}
