// pyzy/src/engine/mod.rs
//
// Copyright (c) 2025 Arcella Team
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE>
// or the MIT license <LICENSE-MIT>, at your option.
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Script engine: Wasmtime with the WASI preview 1 host.
//!
//! A script is a WASI command module. Warming it compiles, links and
//! instantiates it in a store owned by the template process, which runs the
//! module's `start` section but never its `_start` export. A worker later
//! swaps in its own WASI context and calls `_start` on that instance, or
//! loads the module from scratch when nothing was warmed.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use wasmtime::{Config, Engine, Instance, Linker, Module, Store, WasmBacktraceDetails};
use wasmtime_wasi::p1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, WasiCtxBuilder};

use crate::error::{PyzyError, Result as PyzyResult};

/// Name of the exported main entry of a WASI command module.
pub const MAIN_ENTRY: &str = "_start";

/// Compiles and runs scripts.
pub struct ScriptEngine {
    engine: Engine,
    linker: Linker<WasiP1Ctx>,
}

/// A script instantiated in the template process, ready for `_start`.
pub struct WarmScript {
    store: Store<WasiP1Ctx>,
    instance: Instance,
}

impl fmt::Debug for WarmScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarmScript").finish_non_exhaustive()
    }
}

/// How a script run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOutcome {
    /// `_start` returned normally.
    Completed,
    /// The script called `proc_exit` with this code.
    Exited(i32),
    /// Load, link, trap or host error, with a printable description.
    Failed(String),
}

impl ScriptOutcome {
    /// Status code reported to the client for this outcome.
    pub fn status(&self) -> u32 {
        match self {
            ScriptOutcome::Completed => 0,
            ScriptOutcome::Exited(code) => u32::try_from(*code).unwrap_or(1),
            ScriptOutcome::Failed(_) => 1,
        }
    }

    fn from_error(error: wasmtime::Error) -> Self {
        match error.downcast_ref::<I32Exit>() {
            Some(exit) => ScriptOutcome::Exited(exit.0),
            None => ScriptOutcome::Failed(format!("{:?}", error)),
        }
    }
}

/// The WASI view a worker gives its script.
#[derive(Debug, Clone, Default)]
pub struct ScriptContext {
    /// Guest `argv`, starting with the script path.
    pub arguments: Vec<String>,
    /// Host directory preopened as `.`.
    pub working_directory: Option<PathBuf>,
    /// Host directories preopened under their own path, in lookup order.
    pub search_path: Vec<PathBuf>,
    /// Seed for the guest's insecure random source.
    pub random_seed: u128,
}

impl ScriptContext {
    /// Builds the WASI context, inheriting stdio and the process environment.
    ///
    /// Variables whose name or value is not UTF-8 are left out.
    ///
    /// Search path entries that cannot be opened are skipped with a warning.
    pub fn build(&self) -> PyzyResult<WasiP1Ctx> {
        let mut builder = WasiCtxBuilder::new();
        builder
            .args(self.arguments.as_slice())
            .envs(process_environment().as_slice())
            .inherit_stdio()
            .insecure_random_seed(self.random_seed);

        if let Some(dir) = &self.working_directory {
            builder
                .preopened_dir(dir, ".", DirPerms::all(), FilePerms::all())
                .map_err(|e| PyzyError::Internal(format!("cannot preopen {:?}: {}", dir, e)))?;
        }
        for dir in &self.search_path {
            let guest = dir.to_string_lossy().into_owned();
            if let Err(e) = builder.preopened_dir(dir, &guest, DirPerms::all(), FilePerms::all()) {
                tracing::warn!("Skipping search path entry {:?}: {}", dir, e);
            }
        }
        Ok(builder.build_p1())
    }
}

/// The current process environment as WASI sees it.
fn process_environment() -> Vec<(String, String)> {
    utf8_variables(std::env::vars_os())
}

fn utf8_variables(vars: impl IntoIterator<Item = (OsString, OsString)>) -> Vec<(String, String)> {
    vars.into_iter()
        .filter_map(|(key, value)| match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => Some((key, value)),
            (Err(key), _) => {
                tracing::debug!("Skipping non UTF-8 variable {:?}", key);
                None
            }
            (Ok(key), Err(_)) => {
                tracing::debug!("Skipping variable {} with a non UTF-8 value", key);
                None
            }
        })
        .collect()
}

impl ScriptEngine {
    /// Creates the engine and a linker with the WASI preview 1 imports.
    ///
    /// Compilation runs on the calling thread so that the template process
    /// never owns a compiler thread pool when it forks.
    pub fn new() -> PyzyResult<Self> {
        let mut config = Config::default();
        config.wasm_backtrace_details(WasmBacktraceDetails::Enable);
        config.parallel_compilation(false);
        let engine = Engine::new(&config)?;

        let mut linker: Linker<WasiP1Ctx> = Linker::new(&engine);
        p1::add_to_linker_sync(&mut linker, |ctx| ctx)?;

        Ok(Self { engine, linker })
    }

    /// Reads and compiles a `.wat` or `.wasm` file.
    pub fn load_module(&self, path: &Path) -> PyzyResult<Module> {
        let is_wat = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("wat"));

        let module = if is_wat {
            let source = std::fs::read_to_string(path)
                .map_err(|e| PyzyError::io_with_path(path, e))?;
            let binary = wat::parse_str(&source)?;
            Module::from_binary(&self.engine, &binary)?
        } else {
            let binary = std::fs::read(path).map_err(|e| PyzyError::io_with_path(path, e))?;
            Module::from_binary(&self.engine, &binary)?
        };
        Ok(module)
    }

    /// Compiles, links and instantiates `script` without entering `_start`.
    ///
    /// The placeholder context has no arguments, stdin or preopens. It sees
    /// the current process environment and writes to the daemon's stdout and
    /// stderr.
    pub fn warm(&self, script: &Path) -> PyzyResult<WarmScript> {
        let module = self.load_module(script)?;
        let pre = self.linker.instantiate_pre(&module)?;

        let ctx = WasiCtxBuilder::new()
            .envs(process_environment().as_slice())
            .inherit_stdout()
            .inherit_stderr()
            .build_p1();
        let mut store = Store::new(&self.engine, ctx);
        let instance = pre.instantiate(&mut store)?;

        Ok(WarmScript { store, instance })
    }

    /// Runs `script` under its main entry with `context` as its WASI view.
    ///
    /// Uses `warm` when the template already instantiated the script,
    /// otherwise loads and instantiates it here.
    pub fn run_main(
        &self,
        script: &Path,
        warm: Option<WarmScript>,
        context: &ScriptContext,
    ) -> ScriptOutcome {
        let ctx = match context.build() {
            Ok(ctx) => ctx,
            Err(e) => return ScriptOutcome::Failed(e.to_string()),
        };

        let (mut store, instance) = match warm {
            Some(WarmScript { mut store, instance }) => {
                *store.data_mut() = ctx;
                (store, instance)
            }
            None => {
                let module = match self.load_module(script) {
                    Ok(module) => module,
                    Err(e) => return ScriptOutcome::Failed(e.to_string()),
                };
                let mut store = Store::new(&self.engine, ctx);
                match self.linker.instantiate(&mut store, &module) {
                    Ok(instance) => (store, instance),
                    Err(e) => return ScriptOutcome::from_error(e),
                }
            }
        };

        let entry = match instance.get_typed_func::<(), ()>(&mut store, MAIN_ENTRY) {
            Ok(entry) => entry,
            Err(e) => {
                return ScriptOutcome::Failed(format!(
                    "{} has no usable `{}` export: {}",
                    script.display(),
                    MAIN_ENTRY,
                    e
                ))
            }
        };

        match entry.call(&mut store, ()) {
            Ok(()) => ScriptOutcome::Completed,
            Err(e) => ScriptOutcome::from_error(e),
        }
    }
}
