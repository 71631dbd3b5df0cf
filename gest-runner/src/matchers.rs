// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Assertions over JSON values.
//!
//! Matchers are looked up by name in a [`MatcherRegistry`]. An [`Expectation`] runs a matcher
//! against a tested value, optionally negated, and turns a failed match into an
//! [`ExpectError`] pointing at the caller.
//!
//! ```
//! use gest_runner::matchers::expect;
//! use serde_json::json;
//!
//! # fn main() -> Result<(), gest_runner::errors::TestError> {
//! expect(2 + 2).to_be(4)?;
//! expect(json!([1, 2, 3])).to_contain([json!(2)])?;
//! expect(json!({"a": 1})).not().to_equal(json!({"a": 2}))?;
//! # Ok(())
//! # }
//! ```

use crate::{
    errors::{ExpectError, TestError},
    suite::SourceLocation,
};
use serde_json::Value;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::LazyLock,
};
use swrite::{swriteln, SWrite};

/// Why a matcher failed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MatchFailure {
    /// A description of the failure.
    pub reason: String,

    /// A rendering of what was expected.
    pub expected: Option<String>,

    /// A rendering of what was received.
    pub received: Option<String>,

    /// A diff between the tested and expected values.
    pub diff: Option<String>,
}

impl MatchFailure {
    /// Creates a new failure with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ..Default::default()
        }
    }

    fn expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    fn received(mut self, received: impl Into<String>) -> Self {
        self.received = Some(received.into());
        self
    }

    fn diff(mut self, diff: String) -> Self {
        self.diff = Some(diff);
        self
    }
}

/// The outcome of running a matcher.
pub type MatchOutcome = Result<(), MatchFailure>;

/// A matcher: takes the tested value and the matcher's arguments.
pub type Matcher = fn(&Value, &[Value]) -> MatchOutcome;

/// Maps matcher names to matchers.
#[derive(Clone, Debug, Default)]
pub struct MatcherRegistry {
    matchers: BTreeMap<String, Matcher>,
}

impl MatcherRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in matchers: `toBe`, `toEqual`, `toBeUndefined`,
    /// `toBeDefined`, `toBeOfType` and `toContain`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .add("toBe", to_be)
            .add("toEqual", to_equal)
            .add("toBeUndefined", to_be_undefined)
            .add("toBeDefined", to_be_defined)
            .add("toBeOfType", to_be_of_type)
            .add("toContain", to_contain);
        registry
    }

    /// Adds a matcher, replacing any existing matcher with the same name.
    pub fn add(&mut self, name: impl Into<String>, matcher: Matcher) -> &mut Self {
        self.matchers.insert(name.into(), matcher);
        self
    }

    /// Looks up a matcher by name.
    pub fn get(&self, name: &str) -> Option<Matcher> {
        self.matchers.get(name).copied()
    }

    /// Returns the names of every registered matcher.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.matchers.keys().map(String::as_str)
    }

    /// Starts an expectation about `value`.
    pub fn expect(&self, value: impl Into<Value>) -> Expectation<'_> {
        Expectation {
            registry: self,
            value: value.into(),
            negate: false,
        }
    }
}

static BUILTINS: LazyLock<MatcherRegistry> = LazyLock::new(MatcherRegistry::with_builtins);

/// Starts an expectation about `value`, using the built-in matchers.
pub fn expect(value: impl Into<Value>) -> Expectation<'static> {
    BUILTINS.expect(value)
}

/// An expectation about a value, created by [`MatcherRegistry::expect`] or [`expect`].
#[derive(Clone, Debug)]
pub struct Expectation<'a> {
    registry: &'a MatcherRegistry,
    value: Value,
    negate: bool,
}

impl Expectation<'_> {
    /// Negates the expectation: it passes if the matcher fails.
    pub fn not(mut self) -> Self {
        self.negate = !self.negate;
        self
    }

    /// Runs the matcher called `name` with `args`.
    #[track_caller]
    pub fn check(&self, name: &str, args: &[Value]) -> Result<(), TestError> {
        let location = SourceLocation::caller();
        let Some(matcher) = self.registry.get(name) else {
            return Err(TestError::Failure {
                message: format!("Invalid matcher: '{name}'"),
                location: Some(location),
            });
        };

        match (matcher(&self.value, args), self.negate) {
            (Ok(()), false) | (Err(_), true) => Ok(()),
            (Err(failure), false) => Err(TestError::Expect(ExpectError::new(
                failure.reason,
                failure.expected,
                failure.received,
                failure.diff,
                location,
            ))),
            (Ok(()), true) => Err(TestError::Expect(ExpectError::new(
                "Assertion was expected to fail, but it passed.",
                None,
                None,
                None,
                location,
            ))),
        }
    }

    /// Checks that the value is strictly equal to `expected`.
    #[track_caller]
    pub fn to_be(&self, expected: impl Into<Value>) -> Result<(), TestError> {
        self.check("toBe", &[expected.into()])
    }

    /// Checks that the value is deeply equal to `expected`.
    #[track_caller]
    pub fn to_equal(&self, expected: impl Into<Value>) -> Result<(), TestError> {
        self.check("toEqual", &[expected.into()])
    }

    /// Checks that the value is null.
    #[track_caller]
    pub fn to_be_undefined(&self) -> Result<(), TestError> {
        self.check("toBeUndefined", &[])
    }

    /// Checks that the value is not null.
    #[track_caller]
    pub fn to_be_defined(&self) -> Result<(), TestError> {
        self.check("toBeDefined", &[])
    }

    /// Checks the type of the value: one of `undefined`, `boolean`, `number`, `string` or
    /// `object` (arrays included).
    #[track_caller]
    pub fn to_be_of_type(&self, expected: &str) -> Result<(), TestError> {
        self.check("toBeOfType", &[Value::from(expected)])
    }

    /// Checks that the value is an array containing every one of `required`.
    #[track_caller]
    pub fn to_contain(&self, required: impl IntoIterator<Item = Value>) -> Result<(), TestError> {
        let required: Vec<_> = required.into_iter().collect();
        self.check("toContain", &required)
    }
}

fn to_be(tested: &Value, args: &[Value]) -> MatchOutcome {
    let expected = first_arg(args);
    if tested != expected {
        return Err(MatchFailure::new("Equality test has failed.")
            .received(presentation(tested))
            .expected(presentation(expected)));
    }
    Ok(())
}

fn to_equal(tested: &Value, args: &[Value]) -> MatchOutcome {
    let expected = first_arg(args);
    if !deep_equal(tested, expected) {
        let mut diff = String::new();
        write_diff("$", tested, expected, &mut diff);
        return Err(MatchFailure::new("Deep equality test has failed.")
            .received(presentation(tested))
            .expected(presentation(expected))
            .diff(diff));
    }
    Ok(())
}

fn to_be_undefined(tested: &Value, _args: &[Value]) -> MatchOutcome {
    if !tested.is_null() {
        return Err(MatchFailure::new("Expected value to be undefined.")
            .received(presentation(tested))
            .expected("undefined"));
    }
    Ok(())
}

fn to_be_defined(tested: &Value, _args: &[Value]) -> MatchOutcome {
    if tested.is_null() {
        return Err(MatchFailure::new("Expected value to be defined.")
            .received(presentation(tested))
            .expected("Any"));
    }
    Ok(())
}

fn to_be_of_type(tested: &Value, args: &[Value]) -> MatchOutcome {
    let expected = first_arg(args);
    if expected.as_str() != Some(type_name(tested)) {
        return Err(MatchFailure::new("Expected value to be of different type.")
            .received(presentation(tested))
            .expected(format!("typeof {}", presentation(expected))));
    }
    Ok(())
}

fn to_contain(tested: &Value, required: &[Value]) -> MatchOutcome {
    let Value::Array(values) = tested else {
        return Err(MatchFailure::new("Expected value to be an array.")
            .received(presentation(tested))
            .expected("Array"));
    };

    for value in required {
        if !values.contains(value) {
            let items: Vec<_> = values.iter().map(presentation).collect();
            return Err(MatchFailure::new("Expected array to contain a certain value.")
                .received(format!("[{}]", items.join(", ")))
                .expected(format!("array containing: {}", presentation(value))));
        }
    }
    Ok(())
}

fn first_arg(args: &[Value]) -> &Value {
    args.first().unwrap_or(&Value::Null)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "undefined",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) | Value::Object(_) => "object",
    }
}

/// A short rendering of a value for failure messages. Composite values are not expanded.
fn presentation(value: &Value) -> String {
    match value {
        Value::Null => "undefined".to_owned(),
        Value::String(s) => format!("\"{s}\""),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(_) => "Array{...}".to_owned(),
        Value::Object(_) => "Object".to_owned(),
    }
}

// Numbers compare by value, so 1 and 1.0 are deeply equal.
fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| deep_equal(a, b))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, a)| b.get(key).is_some_and(|b| deep_equal(a, b)))
        }
        _ => a == b,
    }
}

/// Writes one line per difference: `-` for the received value, `+` for the expected value.
fn write_diff(path: &str, received: &Value, expected: &Value, out: &mut String) {
    match (received, expected) {
        (Value::Object(r), Value::Object(e)) => {
            let keys: BTreeSet<_> = r.keys().chain(e.keys()).collect();
            for key in keys {
                let path = format!("{path}.{key}");
                match (r.get(key), e.get(key)) {
                    (Some(r), Some(e)) => write_diff(&path, r, e, out),
                    (Some(r), None) => swriteln!(out, "- {path}: {r}"),
                    (None, Some(e)) => swriteln!(out, "+ {path}: {e}"),
                    (None, None) => {}
                }
            }
        }
        (Value::Array(r), Value::Array(e)) => {
            for index in 0..r.len().max(e.len()) {
                let path = format!("{path}[{index}]");
                match (r.get(index), e.get(index)) {
                    (Some(r), Some(e)) => write_diff(&path, r, e, out),
                    (Some(r), None) => swriteln!(out, "- {path}: {r}"),
                    (None, Some(e)) => swriteln!(out, "+ {path}: {e}"),
                    (None, None) => {}
                }
            }
        }
        _ if deep_equal(received, expected) => {}
        _ => {
            swriteln!(out, "- {path}: {received}");
            swriteln!(out, "+ {path}: {expected}");
        }
    }
}
