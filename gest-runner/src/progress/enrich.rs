// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resolving source locations into links when a suite finishes.

use super::records::{
    ErrorOrigin, ParsedError, ProgressError, SuiteFinishState, SuiteMeta, UnitErrorReport,
    UnitFinishState, UnitProgress,
};
use crate::{errors::EnrichError, helpers::display_relative, suite::SourceLocation};
use camino::Utf8Path;
use std::{collections::BTreeMap, fmt, time::Duration};

/// Produces a [`LocationResolver`] for a test file.
///
/// Enrichment runs on a blocking thread once a suite finishes, so implementations may do file I/O.
pub trait SourceEnricher: Send + Sync + 'static {
    /// Loads the resolver for a test file.
    fn load(&self, meta: &SuiteMeta) -> Result<Box<dyn LocationResolver>, EnrichError>;
}

/// Maps locations in built test modules back to their original positions.
pub trait LocationResolver: Send {
    /// Returns the original position of `location`, or `None` if it can't be resolved.
    fn original_position(&self, location: &SourceLocation) -> Option<SourceLocation>;
}

/// The default [`SourceEnricher`].
///
/// If a suite has a map file, it's read as a JSON object mapping generated line numbers to original
/// line numbers (e.g. `{"12": 4}`); locations on lines not in the map resolve to nothing. Without a
/// map file, every location resolves to itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileLinkEnricher;

impl SourceEnricher for FileLinkEnricher {
    fn load(&self, meta: &SuiteMeta) -> Result<Box<dyn LocationResolver>, EnrichError> {
        let Some(map_file) = &meta.map_file else {
            return Ok(Box::new(IdentityResolver));
        };
        let contents = std::fs::read_to_string(map_file)
            .map_err(|err| EnrichError::new(map_file.clone(), err))?;
        let lines: BTreeMap<u32, u32> = serde_json::from_str(&contents).map_err(|err| {
            EnrichError::new(
                map_file.clone(),
                std::io::Error::new(std::io::ErrorKind::InvalidData, err),
            )
        })?;
        Ok(Box::new(LineMapResolver { lines }))
    }
}

struct IdentityResolver;

impl LocationResolver for IdentityResolver {
    fn original_position(&self, location: &SourceLocation) -> Option<SourceLocation> {
        Some(location.clone())
    }
}

struct LineMapResolver {
    lines: BTreeMap<u32, u32>,
}

impl LocationResolver for LineMapResolver {
    fn original_position(&self, location: &SourceLocation) -> Option<SourceLocation> {
        let line = *self.lines.get(&location.line)?;
        Some(SourceLocation::new(location.file.clone(), line, location.column))
    }
}

/// A suite's accumulated progress, frozen at finish time.
#[derive(Clone)]
pub(super) struct FinishSnapshot {
    pub(super) meta: SuiteMeta,
    pub(super) duration: Duration,
    pub(super) units: Vec<UnitProgress>,
    pub(super) errors: Vec<ProgressError>,
    pub(super) skipped: bool,
}

impl fmt::Debug for FinishSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinishSnapshot")
            .field("filepath", &self.meta.filepath)
            .field("units", &self.units.len())
            .field("errors", &self.errors.len())
            .finish_non_exhaustive()
    }
}

impl FinishSnapshot {
    /// Renders the snapshot into finish states, resolving links if a resolver is available.
    pub(super) fn render(
        self,
        cwd: &Utf8Path,
        resolver: Option<&dyn LocationResolver>,
    ) -> (SuiteFinishState, Vec<UnitFinishState>) {
        let renderer = Renderer {
            cwd,
            suite_path: display_relative(cwd, &self.meta.filepath),
            resolver,
        };

        let suite = SuiteFinishState {
            test_filepath: renderer.suite_path.clone(),
            duration: self.duration,
            errors: self.errors.iter().map(|e| renderer.parse(e)).collect(),
            skipped: self.skipped,
        };
        let units = self.units.iter().map(|u| renderer.unit(u)).collect();
        (suite, units)
    }
}

struct Renderer<'a> {
    cwd: &'a Utf8Path,
    suite_path: String,
    resolver: Option<&'a dyn LocationResolver>,
}

impl Renderer<'_> {
    fn link(&self, location: &SourceLocation) -> Option<String> {
        let resolved = self.resolver?.original_position(location)?;
        Some(format!(
            "{}:{}:{}",
            display_relative(self.cwd, Utf8Path::new(&resolved.file)),
            resolved.line,
            resolved.column
        ))
    }

    fn parse(&self, error: &ProgressError) -> ParsedError {
        let link = match (&error.hook, error.origin) {
            (Some(hook), ErrorOrigin::LifecycleHook) => self.link(&hook.location),
            _ => None,
        };
        ParsedError {
            origin: error.origin,
            error_type: error.thrown.name().to_owned(),
            message: error.thrown.to_string(),
            stack: error.thrown.stack(),
            link,
            thrown: error.thrown.clone(),
        }
    }

    fn unit(&self, progress: &UnitProgress) -> UnitFinishState {
        let enriched = self.resolver.is_some();
        let unit_link = match &progress.unit {
            Some(unit) if enriched => {
                Some(self.link(&unit.location).unwrap_or_else(|| self.suite_path.clone()))
            }
            _ => None,
        };

        let error = progress.error.as_ref().map(|error| {
            let expect_link = enriched.then(|| {
                let location = error.thrown.location().filter(|_| error.thrown.is_expect_error());
                location
                    .and_then(|location| self.link(location))
                    .unwrap_or_else(|| self.suite_path.clone())
            });
            UnitErrorReport {
                error: self.parse(error),
                is_expect_error: error.thrown.is_expect_error(),
                expect_link,
            }
        });

        UnitFinishState {
            unit_name: progress.unit_name.clone(),
            duration: progress.duration,
            error,
            additional_errors: progress
                .additional_errors
                .iter()
                .map(|e| self.parse(e))
                .collect(),
            timed_out: progress.timed_out,
            skipped: progress.skipped,
            unit_link,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::{ExpectError, TestError},
        suite::{HookKind, HookRef, UnitRef},
    };
    use camino_tempfile::Utf8TempDir;
    use pretty_assertions::assert_eq;

    fn snapshot(meta: SuiteMeta) -> FinishSnapshot {
        let location = SourceLocation::new("/work/tests/math.rs", 10, 5);
        let unit = UnitRef {
            name: "adds".to_owned(),
            location: location.clone(),
        };
        let expect = TestError::Expect(ExpectError::new(
            "Expected values to be equal",
            None,
            None,
            None,
            SourceLocation::new("/work/tests/math.rs", 11, 9),
        ));
        FinishSnapshot {
            meta,
            duration: Duration::from_millis(3),
            units: vec![UnitProgress::failed(
                vec!["math".to_owned(), "adds".to_owned()],
                ProgressError::new(ErrorOrigin::Test, expect),
                Vec::new(),
                unit,
            )],
            errors: vec![ProgressError::hook(
                TestError::new("hook failed"),
                HookRef {
                    kind: HookKind::AfterAll,
                    location: SourceLocation::new("/work/tests/math.rs", 2, 3),
                },
            )],
            skipped: false,
        }
    }

    #[test]
    fn identity_links() {
        let meta = SuiteMeta::new("/work/tests/math.rs");
        let resolver = FileLinkEnricher.load(&meta).unwrap();
        let (suite, units) = snapshot(meta).render(Utf8Path::new("/work"), Some(&*resolver));

        assert_eq!(suite.test_filepath, "./tests/math.rs");
        assert_eq!(suite.errors[0].link.as_deref(), Some("./tests/math.rs:2:3"));
        assert_eq!(units[0].unit_link.as_deref(), Some("./tests/math.rs:10:5"));
        let error = units[0].error.as_ref().unwrap();
        assert!(error.is_expect_error);
        assert_eq!(error.expect_link.as_deref(), Some("./tests/math.rs:11:9"));
    }

    #[test]
    fn line_map_links() {
        let dir = Utf8TempDir::new().unwrap();
        let map_file = dir.path().join("math.map.json");
        std::fs::write(&map_file, r#"{"10": 3, "2": 1}"#).unwrap();

        let meta = SuiteMeta {
            filepath: "/work/tests/math.rs".into(),
            map_file: Some(map_file),
        };
        let resolver = FileLinkEnricher.load(&meta).unwrap();
        let (suite, units) = snapshot(meta).render(Utf8Path::new("/work"), Some(&*resolver));

        assert_eq!(suite.errors[0].link.as_deref(), Some("./tests/math.rs:1:3"));
        assert_eq!(units[0].unit_link.as_deref(), Some("./tests/math.rs:3:5"));
        // Line 11 isn't in the map, so the expect link falls back to the test file.
        assert_eq!(
            units[0].error.as_ref().unwrap().expect_link.as_deref(),
            Some("./tests/math.rs")
        );
    }

    #[test]
    fn missing_map_file() {
        let meta = SuiteMeta {
            filepath: "tests/math.rs".into(),
            map_file: Some("/nonexistent/math.map.json".into()),
        };
        let err = FileLinkEnricher
            .load(&meta)
            .err()
            .expect("map file doesn't exist");
        assert_eq!(err.map_file().as_str(), "/nonexistent/math.map.json");
    }

    #[test]
    fn unenriched_render_has_no_links() {
        let meta = SuiteMeta::new("/work/tests/math.rs");
        let (suite, units) = snapshot(meta).render(Utf8Path::new("/work"), None);

        assert_eq!(suite.errors[0].link, None);
        assert_eq!(units[0].unit_link, None);
        assert_eq!(units[0].error.as_ref().unwrap().expect_link, None);
        assert_eq!(suite.errors[0].message, "hook failed");
    }
}
