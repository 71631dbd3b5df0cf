// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test modules shared by the fixture binary and the integration tests.

use gest_runner::{
    errors::TestError,
    matchers::expect,
    registry::{ModuleExport, SuiteRegistry, TestModule},
    suite::{describe, LogType},
};
use serde_json::json;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// If set, the registry also contains [`CRASH_FILE`], ahead of every other file.
pub const CRASH_ENV: &str = "GEST_FIXTURES_CRASH";

/// A test file whose unit exits the process. Only meaningful with multiprocessing.
pub const CRASH_FILE: &str = "fixtures/crash.rs";

/// The exit code used by [`CRASH_FILE`].
pub const CRASH_EXIT_CODE: i32 = 3;

/// Every test file in [`fixture_registry`], in registration order (excluding [`CRASH_FILE`]).
pub const FIXTURE_FILES: &[&str] = &[
    "fixtures/math.rs",
    "fixtures/failing.rs",
    "fixtures/hooks.rs",
    "fixtures/timeout.rs",
    "fixtures/teardown.rs",
    "fixtures/not_a_test.rs",
];

/// Returns the registry of fixture test modules.
pub fn fixture_registry() -> SuiteRegistry {
    let mut registry = SuiteRegistry::new();
    // Registered first so that a single worker has to be respawned for the remaining files.
    if std::env::var_os(CRASH_ENV).is_some() {
        registry.register(CRASH_FILE, crash);
    }

    registry
        .register("fixtures/math.rs", math)
        .register("fixtures/failing.rs", failing)
        .register("fixtures/hooks.rs", hooks)
        .register("fixtures/timeout.rs", timeout)
        .register("fixtures/teardown.rs", teardown)
        .register("fixtures/not_a_test.rs", || TestModule {
            default_export: ModuleExport::Other("a plain object".to_owned()),
            timeout: None,
        });
    registry
}

fn math() -> TestModule {
    TestModule::new(describe("math", |s| {
        s.it("adds", |_| async { expect(1 + 1).to_be(2) });
        s.it("compares structurally", |_| async {
            expect(json!({ "a": [1, 2], "b": null })).to_equal(json!({ "b": null, "a": [1.0, 2] }))
        });
        s.describe("nested", |s| {
            s.it("multiplies", |_| async { expect(6 * 7).to_be(42) });
            s.it("contains", |_| async {
                expect(json!([1, 2, 3])).to_contain([json!(3), json!(1)])
            });
        });
        s.it_skip("divides by zero", |_| async {
            Err(TestError::new("never runs"))
        });
    }))
}

fn failing() -> TestModule {
    TestModule::new(describe("failing", |s| {
        s.it("passes", |_| async { Ok(()) });
        s.it("compares the wrong number", |_| async { expect(2).to_be(3) });
        s.it("returns an error", |_| async {
            Err(TestError::new("explicit failure"))
        });
    }))
}

fn hooks() -> TestModule {
    let before_each = Arc::new(AtomicUsize::new(0));
    let after_each = Arc::new(AtomicUsize::new(0));

    TestModule::new(describe("hooks", |s| {
        let counter = before_each.clone();
        s.before_each(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let counter = after_each.clone();
        s.after_each(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let (before, after) = (before_each.clone(), after_each.clone());
        s.it("sees the first before_each", move |cx| {
            let (before, after) = (before.clone(), after.clone());
            async move {
                cx.log(LogType::Info, format!("hello from {}", cx.full_title()));
                expect(before.load(Ordering::SeqCst)).to_be(1)?;
                expect(after.load(Ordering::SeqCst)).to_be(0)
            }
        });

        let (before, after) = (before_each.clone(), after_each.clone());
        s.it("sees the second before_each", move |_| {
            let (before, after) = (before.clone(), after.clone());
            async move {
                expect(before.load(Ordering::SeqCst)).to_be(2)?;
                expect(after.load(Ordering::SeqCst)).to_be(1)
            }
        });

        s.it("runs deferred tasks", |cx| async move {
            cx.defer(|| async { Ok(()) });
            Ok(())
        });

        let after = after_each.clone();
        s.after_all(move || {
            let after = after.clone();
            async move { expect(after.load(Ordering::SeqCst)).to_be(3) }
        });
    }))
}

fn timeout() -> TestModule {
    TestModule::new(describe("timeout", |s| {
        s.it("sleeps too long", |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        s.it("finishes quickly", |_| async { Ok(()) });
    }))
    .with_timeout(Duration::from_millis(100))
}

fn teardown() -> TestModule {
    TestModule::new(describe("teardown", |s| {
        s.after_each(|| async { Err(TestError::new("teardown broke")) });
        s.it("passes", |_| async { Ok(()) });
    }))
}

fn crash() -> TestModule {
    TestModule::new(describe("crash", |s| {
        s.it("exits the process", |_| async { exit_process() });
    }))
}

fn exit_process() -> Result<(), TestError> {
    eprintln!("worker crashing on purpose");
    std::process::exit(CRASH_EXIT_CODE)
}
