// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The suite tree model, and the builder used to collect it.
//!
//! A test module describes its tests with [`describe`]:
//!
//! ```
//! use gest_runner::suite::describe;
//!
//! let suite = describe("math", |s| {
//!     s.before_each(|| async { Ok(()) });
//!     s.it("adds", |_cx| async { Ok(()) });
//!     s.describe("nested", |s| {
//!         s.it_skip("not yet", |_cx| async { Ok(()) });
//!     });
//! });
//! assert_eq!(suite.units().len(), 1);
//! assert_eq!(suite.children().len(), 1);
//! ```
//!
//! The builder is an explicit value threaded through the `describe` closures, so collecting
//! several modules concurrently is safe.

mod context;

pub use context::*;

use crate::errors::TestError;
use debug_ignore::DebugIgnore;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::{fmt, future::Future, panic::Location, sync::Arc};

/// The result of a unit, hook or deferred task.
pub type TestResult = Result<(), TestError>;

/// A unit callback.
pub type UnitCallback = Arc<dyn Fn(UnitContext) -> BoxFuture<'static, TestResult> + Send + Sync>;

/// A hook callback.
pub type HookCallback = Arc<dyn Fn() -> BoxFuture<'static, TestResult> + Send + Sync>;

/// A location in a source file.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// The file.
    pub file: String,

    /// The line, starting from 1.
    pub line: u32,

    /// The column, starting from 1.
    pub column: u32,
}

impl SourceLocation {
    /// Creates a new source location.
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }

    /// Returns the location of the caller.
    #[track_caller]
    pub fn caller() -> Self {
        Location::caller().into()
    }
}

impl From<&Location<'_>> for SourceLocation {
    fn from(location: &Location<'_>) -> Self {
        Self::new(location.file(), location.line(), location.column())
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// A `describe` block: a named group of hooks, units and nested suites.
#[derive(Clone, Debug)]
pub struct Suite {
    name: String,
    location: SourceLocation,
    before_all: Vec<Hook>,
    before_each: Vec<Hook>,
    after_each: Vec<Hook>,
    after_all: Vec<Hook>,
    units: Vec<Unit>,
    children: Vec<Suite>,
}

impl Suite {
    fn new(name: String, location: SourceLocation) -> Self {
        Self {
            name,
            location,
            before_all: Vec::new(),
            before_each: Vec::new(),
            after_each: Vec::new(),
            after_all: Vec::new(),
            units: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Returns the name of this suite.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns where this suite was declared.
    pub fn location(&self) -> &SourceLocation {
        &self.location
    }

    /// Returns the hooks of the given kind, in declaration order.
    pub fn hooks(&self, kind: HookKind) -> &[Hook] {
        match kind {
            HookKind::BeforeAll => &self.before_all,
            HookKind::BeforeEach => &self.before_each,
            HookKind::AfterEach => &self.after_each,
            HookKind::AfterAll => &self.after_all,
        }
    }

    /// Returns the units declared directly in this suite.
    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    /// Returns the suites nested directly in this suite.
    pub fn children(&self) -> &[Suite] {
        &self.children
    }

    /// Returns a copy of `child` that inherits this suite's `before_each` and `after_each` hooks.
    ///
    /// Both lists are concatenated in ancestor to descendant order.
    pub fn derive_child(&self, child: &Suite) -> Suite {
        let mut derived = child.clone();
        derived.before_each = concat(&self.before_each, &child.before_each);
        derived.after_each = concat(&self.after_each, &child.after_each);
        derived
    }

    /// Returns the total number of units in this suite and all nested suites.
    pub fn unit_count(&self) -> usize {
        self.units.len() + self.children.iter().map(Suite::unit_count).sum::<usize>()
    }
}

fn concat(parent: &[Hook], own: &[Hook]) -> Vec<Hook> {
    parent.iter().chain(own).cloned().collect()
}

/// An `it` block: a single test case.
#[derive(Clone, Debug)]
pub struct Unit {
    name: String,
    location: SourceLocation,
    skip: bool,
    callback: DebugIgnore<UnitCallback>,
}

impl Unit {
    /// Returns the name of this unit.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns where this unit was declared.
    pub fn location(&self) -> &SourceLocation {
        &self.location
    }

    /// Returns true if this unit was declared as skipped.
    pub fn skip(&self) -> bool {
        self.skip
    }

    pub(crate) fn callback(&self) -> &UnitCallback {
        &self.callback
    }

    /// Returns a serializable reference to this unit.
    pub fn to_ref(&self) -> UnitRef {
        UnitRef {
            name: self.name.clone(),
            location: self.location.clone(),
        }
    }
}

/// A serializable reference to a [`Unit`], used for link resolution in reports.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UnitRef {
    /// The name of the unit.
    pub name: String,

    /// Where the unit was declared.
    pub location: SourceLocation,
}

/// The kind of a lifecycle hook.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookKind {
    /// Runs once, before any unit in the suite.
    BeforeAll,

    /// Runs before every unit, including units in nested suites.
    BeforeEach,

    /// Runs after every unit, including units in nested suites.
    AfterEach,

    /// Runs once, after everything else in the suite.
    AfterAll,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BeforeAll => "beforeAll",
            Self::BeforeEach => "beforeEach",
            Self::AfterEach => "afterEach",
            Self::AfterAll => "afterAll",
        };
        f.write_str(s)
    }
}

/// A lifecycle hook.
#[derive(Clone, Debug)]
pub struct Hook {
    kind: HookKind,
    location: SourceLocation,
    callback: DebugIgnore<HookCallback>,
}

impl Hook {
    /// Returns the kind of this hook.
    pub fn kind(&self) -> HookKind {
        self.kind
    }

    /// Returns where this hook was declared.
    pub fn location(&self) -> &SourceLocation {
        &self.location
    }

    pub(crate) fn callback(&self) -> &HookCallback {
        &self.callback
    }

    /// Returns a serializable reference to this hook.
    pub fn to_ref(&self) -> HookRef {
        HookRef {
            kind: self.kind,
            location: self.location.clone(),
        }
    }
}

/// A serializable reference to a [`Hook`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HookRef {
    /// The kind of hook.
    pub kind: HookKind,

    /// Where the hook was declared.
    pub location: SourceLocation,
}

/// Collects a suite tree. See the [module documentation](self).
#[track_caller]
pub fn describe(name: impl Into<String>, f: impl FnOnce(&mut SuiteBuilder)) -> Suite {
    let mut builder = SuiteBuilder {
        suite: Suite::new(name.into(), SourceLocation::caller()),
    };
    f(&mut builder);
    builder.suite
}

/// Registers hooks, units and nested suites into the suite currently being collected.
#[derive(Debug)]
pub struct SuiteBuilder {
    suite: Suite,
}

impl SuiteBuilder {
    /// Adds a nested suite.
    #[track_caller]
    pub fn describe(&mut self, name: impl Into<String>, f: impl FnOnce(&mut SuiteBuilder)) -> &mut Self {
        let child = describe(name, f);
        self.suite.children.push(child);
        self
    }

    /// Adds a unit.
    #[track_caller]
    pub fn it<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(UnitContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.push_unit(name.into(), false, f)
    }

    /// Adds a unit that is always skipped.
    #[track_caller]
    pub fn it_skip<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(UnitContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.push_unit(name.into(), true, f)
    }

    /// Adds a hook that runs once before any unit in this suite.
    #[track_caller]
    pub fn before_all<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.push_hook(HookKind::BeforeAll, f)
    }

    /// Adds a hook that runs before every unit in this suite and its nested suites.
    #[track_caller]
    pub fn before_each<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.push_hook(HookKind::BeforeEach, f)
    }

    /// Adds a hook that runs after every unit in this suite and its nested suites.
    #[track_caller]
    pub fn after_each<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.push_hook(HookKind::AfterEach, f)
    }

    /// Adds a hook that runs once after everything else in this suite.
    #[track_caller]
    pub fn after_all<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        self.push_hook(HookKind::AfterAll, f)
    }

    #[track_caller]
    fn push_unit<F, Fut>(&mut self, name: String, skip: bool, f: F) -> &mut Self
    where
        F: Fn(UnitContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        let callback: UnitCallback = Arc::new(move |cx| Box::pin(f(cx)));
        self.suite.units.push(Unit {
            name,
            location: SourceLocation::caller(),
            skip,
            callback: DebugIgnore(callback),
        });
        self
    }

    #[track_caller]
    fn push_hook<F, Fut>(&mut self, kind: HookKind, f: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestResult> + Send + 'static,
    {
        let callback: HookCallback = Arc::new(move || Box::pin(f()));
        let hook = Hook {
            kind,
            location: SourceLocation::caller(),
            callback: DebugIgnore(callback),
        };
        let hooks = match kind {
            HookKind::BeforeAll => &mut self.suite.before_all,
            HookKind::BeforeEach => &mut self.suite.before_each,
            HookKind::AfterEach => &mut self.suite.after_each,
            HookKind::AfterAll => &mut self.suite.after_all,
        };
        hooks.push(hook);
        self
    }
}
