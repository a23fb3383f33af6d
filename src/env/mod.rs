// pyzy/src/env/mod.rs
//
// Copyright (c) 2025 Arcella Team
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE>
// or the MIT license <LICENSE-MIT>, at your option.
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Scoped mutation of the daemon's process-global state.
//!
//! A connection temporarily merges the client's environment into the daemon
//! so that warm-up and the forked worker observe it. [`EnvironmentScope`]
//! journals every change and undoes it on `Drop`, which is how the template
//! process gets back to exactly the state it had before the connection.
//! The worker branch forgets the scope and keeps the merged state.

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

/// Guard over the process environment and the daemon search path.
pub struct EnvironmentScope<'a> {
    /// Previous value for every key this scope touched, `None` if it was unset.
    journal: Vec<(OsString, Option<OsString>)>,
    search_path: &'a mut Vec<PathBuf>,
    saved_search_path: Vec<PathBuf>,
}

impl<'a> EnvironmentScope<'a> {
    /// Merges `environment` into the live process environment.
    ///
    /// # Arguments
    ///
    /// * `environment` - Variables sent by the client. Empty keys are ignored.
    /// * `search_path` - The daemon's search path, restored along with the environment.
    pub fn enter(
        environment: &BTreeMap<String, String>,
        search_path: &'a mut Vec<PathBuf>,
    ) -> Self {
        let saved_search_path = search_path.clone();
        let mut journal = Vec::with_capacity(environment.len());

        for (key, value) in environment {
            if key.is_empty() {
                continue;
            }
            let previous = env::var_os(key);
            if previous.as_deref() == Some(value.as_ref()) {
                continue;
            }
            journal.push((OsString::from(key), previous));
            env::set_var(key, value);
        }

        tracing::trace!(changed = journal.len(), "Entered environment scope");
        Self {
            journal,
            search_path,
            saved_search_path,
        }
    }

    /// Prepends `entries` to the search path for the rest of this scope.
    pub fn prepend_search_path<I>(&mut self, entries: I)
    where
        I: IntoIterator,
        I::Item: Into<PathBuf>,
    {
        let mut merged: Vec<PathBuf> = entries.into_iter().map(Into::into).collect();
        merged.extend(self.search_path.drain(..));
        *self.search_path = merged;
    }

    /// The search path as seen inside the scope.
    pub fn search_path(&self) -> &[PathBuf] {
        self.search_path
    }

    /// Number of environment variables added or overwritten by this scope.
    pub fn changed(&self) -> usize {
        self.journal.len()
    }
}

impl Drop for EnvironmentScope<'_> {
    fn drop(&mut self) {
        for (key, previous) in self.journal.drain(..).rev() {
            match previous {
                Some(value) => env::set_var(&key, value),
                None => env::remove_var(&key),
            }
        }
        *self.search_path = std::mem::take(&mut self.saved_search_path);
    }
}
