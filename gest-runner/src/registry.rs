// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The registry of test modules.
//!
//! Test files are compiled into the test binary, and each file registers a constructor for its
//! [`TestModule`] under its path. Both the main process and worker processes build the same registry,
//! so a worker can load a module knowing only its path.

use crate::{errors::ModuleLoadError, suite::Suite};
use camino::{Utf8Path, Utf8PathBuf};
use debug_ignore::DebugIgnore;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};

/// A test file as seen by the runner: its path and, optionally, its location map.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSuiteEntry {
    /// The path of the test file.
    pub test_file: Utf8PathBuf,

    /// The location map for the test file, used to resolve links in reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_file: Option<Utf8PathBuf>,
}

/// A built test module.
#[derive(Clone, Debug)]
pub struct TestModule {
    /// The module's default export. Must be a suite for the module to run.
    pub default_export: ModuleExport,

    /// Overrides the default per-unit timeout for every unit in the module.
    pub timeout: Option<Duration>,
}

impl TestModule {
    /// Creates a module exporting `suite`.
    pub fn new(suite: Suite) -> Self {
        Self {
            default_export: ModuleExport::Suite(suite),
            timeout: None,
        }
    }

    /// Sets the per-unit timeout for this module.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What a test module exports.
#[derive(Clone, Debug)]
pub enum ModuleExport {
    /// A suite tree, built with [`describe`](crate::suite::describe).
    Suite(Suite),

    /// Something else, described for error messages.
    Other(String),
}

type ModuleFactory = Arc<dyn Fn() -> TestModule + Send + Sync>;

/// Maps test file paths to module constructors.
#[derive(Clone, Debug, Default)]
pub struct SuiteRegistry {
    modules: IndexMap<Utf8PathBuf, RegisteredModule>,
}

#[derive(Clone, Debug)]
struct RegisteredModule {
    map_file: Option<Utf8PathBuf>,
    factory: DebugIgnore<ModuleFactory>,
}

impl SuiteRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a test module under `test_file`, replacing any module already registered there.
    pub fn register<F>(&mut self, test_file: impl Into<Utf8PathBuf>, factory: F) -> &mut Self
    where
        F: Fn() -> TestModule + Send + Sync + 'static,
    {
        self.insert(test_file.into(), None, Arc::new(factory))
    }

    /// Registers a test module along with the location map for its file.
    pub fn register_with_map<F>(
        &mut self,
        test_file: impl Into<Utf8PathBuf>,
        map_file: impl Into<Utf8PathBuf>,
        factory: F,
    ) -> &mut Self
    where
        F: Fn() -> TestModule + Send + Sync + 'static,
    {
        self.insert(test_file.into(), Some(map_file.into()), Arc::new(factory))
    }

    fn insert(
        &mut self,
        test_file: Utf8PathBuf,
        map_file: Option<Utf8PathBuf>,
        factory: ModuleFactory,
    ) -> &mut Self {
        self.modules.insert(
            test_file,
            RegisteredModule {
                map_file,
                factory: DebugIgnore(factory),
            },
        );
        self
    }

    /// Returns every registered test file, in registration order.
    pub fn entries(&self) -> Vec<TestSuiteEntry> {
        self.modules
            .iter()
            .map(|(test_file, module)| TestSuiteEntry {
                test_file: test_file.clone(),
                map_file: module.map_file.clone(),
            })
            .collect()
    }

    /// Returns the number of registered modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns true if no modules are registered.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Builds the module registered under `test_file`.
    pub fn load(&self, test_file: &Utf8Path) -> Result<TestModule, ModuleLoadError> {
        let module = self
            .modules
            .get(test_file)
            .ok_or_else(|| ModuleLoadError::new(test_file))?;
        Ok((module.factory.0)())
    }
}
