// pyzy/src/wire/protocol.rs
//
// Copyright (c) 2025 Arcella Team
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE>
// or the MIT license <LICENSE-MIT>, at your option.
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use super::{read_blob, read_string, read_u32, write_string, write_u32, MAX_ARGUMENTS};

/// Request-environment key carrying the client's runtime identity tag.
pub const ENV_RUNTIME: &str = "PYZY_RUNTIME";

/// Request-environment key that enables warm-up caching for the script.
pub const ENV_CACHE_SCRIPT: &str = "PYZY_CACHE_SCRIPT";

/// Request-environment key with extra search path entries, colon-separated.
pub const ENV_PATH: &str = "PYZY_PATH";

/// One invocation described by a client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Request {
    pub working_directory: String,
    pub environment: BTreeMap<String, String>,
    pub arguments: Vec<String>,
}

impl Request {
    /// Reads a complete request: working directory, environment block, arguments.
    pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let working_directory = read_string(reader)?;

        let env_len = read_u32(reader)?;
        let env_block = read_blob(reader, env_len)?;
        let environment = parse_environment_block(&env_block)?;

        let argc = read_u32(reader)?;
        if argc > MAX_ARGUMENTS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("argument count {} exceeds limit of {}", argc, MAX_ARGUMENTS),
            ));
        }
        let arguments = (0..argc)
            .map(|_| read_string(reader))
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            working_directory,
            environment,
            arguments,
        })
    }

    /// Writes the request in the same framing [`Request::read_from`] expects.
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        write_string(writer, self.working_directory.as_bytes())?;
        write_string(writer, &encode_environment_block(&self.environment))?;
        let argc = u32::try_from(self.arguments.len())
            .ok()
            .filter(|argc| *argc <= MAX_ARGUMENTS)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "too many arguments"))?;
        write_u32(writer, argc)?;
        for argument in &self.arguments {
            write_string(writer, argument.as_bytes())?;
        }
        Ok(())
    }

    /// The script path as given by the client (`arguments[1]`).
    pub fn script_argument(&self) -> Option<&str> {
        self.arguments.get(1).map(String::as_str)
    }

    /// Arguments seen by the script: everything after the launcher slot.
    pub fn script_arguments(&self) -> &[String] {
        self.arguments.get(1..).unwrap_or(&[])
    }

    /// Runtime tag the client expects the daemon to run, if any.
    pub fn runtime_tag(&self) -> Option<&str> {
        self.environment.get(ENV_RUNTIME).map(String::as_str)
    }

    /// Whether the client asked for the script to be warmed in the template.
    pub fn cache_requested(&self) -> bool {
        self.environment
            .get(ENV_CACHE_SCRIPT)
            .is_some_and(|value| value != "0")
    }

    /// Extra search path entries declared by the client, in order.
    pub fn extra_search_path(&self) -> Vec<String> {
        self.environment
            .get(ENV_PATH)
            .map(|value| {
                value
                    .split(':')
                    .filter(|entry| !entry.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Parses a NUL-separated `KEY=VALUE` block.
///
/// A bare `KEY` maps to an empty value. Empty entries and entries with an
/// empty key are skipped.
pub fn parse_environment_block(block: &[u8]) -> io::Result<BTreeMap<String, String>> {
    let mut environment = BTreeMap::new();
    for entry in block.split(|byte| *byte == 0) {
        if entry.is_empty() {
            continue;
        }
        let entry = std::str::from_utf8(entry).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid UTF-8 in environment: {}", e),
            )
        })?;
        let (key, value) = entry.split_once('=').unwrap_or((entry, ""));
        if key.is_empty() {
            tracing::debug!("Skipping environment entry with empty key");
            continue;
        }
        environment.insert(key.to_string(), value.to_string());
    }
    Ok(environment)
}

/// Encodes an environment map as a NUL-separated `KEY=VALUE` block.
pub fn encode_environment_block(environment: &BTreeMap<String, String>) -> Vec<u8> {
    let mut block = Vec::new();
    for (key, value) in environment {
        if !block.is_empty() {
            block.push(0);
        }
        block.extend_from_slice(key.as_bytes());
        block.push(b'=');
        block.extend_from_slice(value.as_bytes());
    }
    block
}
