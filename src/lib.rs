// pyzy/src/lib.rs
//
// Copyright (c) 2025 Arcella Team
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE>
// or the MIT license <LICENSE-MIT>, at your option.
// This file may not be copied, modified, or distributed
// except according to those terms.

//! pyzy: a warm-start zygote daemon for WebAssembly scripts.
//!
//! A client connects over a Unix socket, describes an invocation and hands
//! over its standard streams. The daemon forks a worker from its template
//! process, which may already hold the script compiled and instantiated, and
//! reports the worker's pid and final status back to the client.

pub mod cache;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod env;
pub mod error;
pub mod log;
pub mod runtime;
pub mod wire;
pub mod worker;

pub use error::{PyzyError, Result};
