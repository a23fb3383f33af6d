// pyzy/src/error/mod.rs
//
// Copyright (c) 2025 Arcella Team
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE>
// or the MIT license <LICENSE-MIT>, at your option.
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Centralized error handling for pyzy.
//!
//! Uses `thiserror` to define structured errors and `anyhow` for convenient propagation.
//! All modules return `Result<T, PyzyError>` for internal logic,
//! and `anyhow::Result<T>` (aliased as `AnyResult<T>`) is used by `main`.

use std::path::PathBuf;
use thiserror::Error;

use crate::cache::WarmupViolation;

/// The root error type for all pyzy failures.
#[derive(Error, Debug)]
pub enum PyzyError {
    /// General-purpose error for unexpected conditions.
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O error (socket closed, permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// IO error with associated path for better diagnostics
    #[error("I/O error at {path:?}: {source}")]
    IoWithPath {
        source: std::io::Error,
        path: PathBuf,
    },

    /// System call failure reported by `nix`.
    #[error("System error: {0}")]
    Sys(#[from] nix::Error),

    /// Malformed request framing on a client connection.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// WASM compilation, linking or runtime error from Wasmtime.
    #[error("Wasmtime error: {0}")]
    Wasmtime(#[from] wasmtime::Error),

    /// Failed to parse WebAssembly Text Format (`.wat`).
    #[error("WAT parsing error: {0}")]
    Wat(#[from] wat::Error),

    /// Configuration loading or parsing error.
    #[error("Config error: {0}")]
    Config(String),

    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A warmed script left extra threads running in the template process.
    #[error(transparent)]
    WarmupViolation(#[from] WarmupViolation),
}

impl PyzyError {
    /// Creates an `IoWithPath` error from a path and an I/O error.
    pub fn io_with_path(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoWithPath {
            source,
            path: path.into(),
        }
    }

    /// Returns `true` for errors that must terminate the daemon rather than
    /// just the connection that raised them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PyzyError::WarmupViolation(_))
    }
}

/// Convenient alias for `Result<T, PyzyError>`.
///
/// Use this in internal module APIs (e.g., `ZygoteCache::warm`).
pub type Result<T> = std::result::Result<T, PyzyError>;

pub use anyhow::Result as AnyResult;
