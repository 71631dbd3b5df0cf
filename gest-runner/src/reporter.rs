// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Aggregating finished suites into a run report, and displaying it.
//!
//! Every count in here satisfies `passed + failed + skipped == total`, both per suite and for the
//! run as a whole.

use crate::{
    errors::FlushError,
    progress::{
        SuiteFinishState, SuiteHandle, SuiteMeta, TrackerEvent, UnitFinishState, UnitStatus,
    },
};
use chrono::{DateTime, Local};
use owo_colors::{OwoColorize, Style};
use std::{collections::HashMap, io, time::Duration};
use tracing::warn;

/// Unit counts for a suite, or for a whole run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SuiteSummary {
    /// The number of units that were attempted, including skipped ones.
    pub total: usize,

    /// The number of units that passed.
    pub passed: usize,

    /// The number of units that failed or timed out.
    pub failed: usize,

    /// The number of units that were skipped.
    pub skipped: usize,
}

impl SuiteSummary {
    /// Counts the given units.
    pub fn from_units(units: &[UnitFinishState]) -> Self {
        units.iter().fold(Self::default(), |mut summary, unit| {
            summary.record(unit.status());
            summary
        })
    }

    fn record(&mut self, status: UnitStatus) {
        self.total += 1;
        match status {
            UnitStatus::Passed => self.passed += 1,
            UnitStatus::Failed => self.failed += 1,
            UnitStatus::Skipped => self.skipped += 1,
        }
    }

    fn add(&mut self, other: &Self) {
        self.total += other.total;
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

/// The status of a finished suite.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SuiteStatus {
    /// No unit failed, and no suite-level error was reported.
    Passed,

    /// A unit failed, or a suite-level error was reported.
    Failed,

    /// The whole test file was skipped.
    Skipped,
}

/// A finished suite.
#[derive(Clone, Debug)]
pub struct SuiteReport {
    /// The suite's handle.
    pub handle: SuiteHandle,

    /// Information about the test file.
    pub meta: SuiteMeta,

    /// The final state of the suite.
    pub state: SuiteFinishState,

    /// The final states of the suite's units.
    pub units: Vec<UnitFinishState>,

    /// Unit counts.
    pub summary: SuiteSummary,
}

impl SuiteReport {
    /// Returns the status of the suite.
    pub fn status(&self) -> SuiteStatus {
        if self.state.skipped {
            SuiteStatus::Skipped
        } else if self.summary.failed > 0 || !self.state.errors.is_empty() {
            SuiteStatus::Failed
        } else {
            SuiteStatus::Passed
        }
    }
}

/// Statistics for a run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunStats {
    /// Suite counts.
    pub suites: SuiteSummary,

    /// Unit counts across every suite.
    pub units: SuiteSummary,
}

impl RunStats {
    fn record(&mut self, report: &SuiteReport) {
        self.suites.record(match report.status() {
            SuiteStatus::Passed => UnitStatus::Passed,
            SuiteStatus::Failed => UnitStatus::Failed,
            SuiteStatus::Skipped => UnitStatus::Skipped,
        });
        self.units.add(&report.summary);
    }
}

/// The outcome of a whole run.
#[derive(Debug)]
pub struct RunReport {
    /// When the run started.
    pub start_time: DateTime<Local>,

    /// How long the run took.
    pub elapsed: Duration,

    /// Every finished suite, in the order the suites were added.
    pub suites: Vec<SuiteReport>,

    /// Statistics for the run.
    pub stats: RunStats,

    /// True if no runner slot observed a failing unit or suite, and no suite report failed.
    pub success: bool,

    /// Errors encountered while finalizing suite reports. These don't affect `success`.
    pub flush_errors: Vec<FlushError>,
}

/// Turns tracker events into [`SuiteReport`]s.
#[derive(Debug, Default)]
pub(crate) struct ReportAggregator {
    // Each suite is keyed by the order it was added in.
    pending: HashMap<SuiteHandle, (usize, SuiteMeta)>,
    added: usize,
    suites: Vec<(usize, SuiteReport)>,
    stats: RunStats,
}

impl ReportAggregator {
    pub(crate) fn record(&mut self, event: TrackerEvent) {
        match event {
            TrackerEvent::SuiteAdded { handle, meta } => {
                self.pending.insert(handle, (self.added, meta));
                self.added += 1;
            }
            TrackerEvent::Finished {
                handle,
                suite,
                units,
            } => {
                let Some((index, meta)) = self.pending.remove(&handle) else {
                    warn!(%handle, "finished suite was never added");
                    return;
                };
                let report = SuiteReport {
                    handle,
                    meta,
                    summary: SuiteSummary::from_units(&units),
                    state: suite,
                    units,
                };
                self.stats.record(&report);
                self.suites.push((index, report));
            }
        }
    }

    pub(crate) fn finish(
        self,
        start_time: DateTime<Local>,
        elapsed: Duration,
        success: bool,
        flush_errors: Vec<FlushError>,
    ) -> RunReport {
        for (_, meta) in self.pending.values() {
            warn!(test_file = %meta.filepath, "suite was added but never finished");
        }

        let mut suites = self.suites;
        suites.sort_by_key(|(index, _)| *index);
        let suites: Vec<_> = suites.into_iter().map(|(_, report)| report).collect();

        // Hook failures that don't change a suite's verdict still fail its report.
        let any_failed = suites
            .iter()
            .any(|suite| suite.status() == SuiteStatus::Failed);
        RunReport {
            start_time,
            elapsed,
            suites,
            stats: self.stats,
            success: success && !any_failed,
            flush_errors,
        }
    }
}

/// Writes a plain-text summary of a [`RunReport`].
#[derive(Debug, Default)]
pub struct SummaryDisplayer {
    styles: Styles,
    verbose: bool,
}

impl SummaryDisplayer {
    /// Creates a new displayer. With `verbose`, passing and skipped units are listed too.
    pub fn new(verbose: bool) -> Self {
        Self {
            styles: Styles::default(),
            verbose,
        }
    }

    /// Colorizes output.
    pub fn colorize(&mut self) {
        self.styles.colorize();
    }

    /// Writes the report to `writer`.
    pub fn write_report(&self, report: &RunReport, mut writer: impl io::Write) -> io::Result<()> {
        for suite in &report.suites {
            self.write_suite(suite, &mut writer)?;
        }

        for error in &report.flush_errors {
            writeln!(writer, "{:>12} {error}", "WARN".style(self.styles.skip))?;
        }

        let summary_style = if !report.success {
            self.styles.fail
        } else if report.stats.units.total == 0 {
            self.styles.skip
        } else {
            self.styles.pass
        };
        write!(
            writer,
            "------------\n{:>12} [{:>8.3?}s] ",
            "Summary".style(summary_style),
            report.elapsed.as_secs_f64()
        )?;
        write!(
            writer,
            "{} {} in {} {}: ",
            report.stats.units.total.style(self.styles.count),
            plural(report.stats.units.total, "unit", "units"),
            report.stats.suites.total.style(self.styles.count),
            plural(report.stats.suites.total, "file", "files"),
        )?;
        self.write_counts(&report.stats.units, &mut writer)?;
        writeln!(writer)
    }

    fn write_suite(&self, suite: &SuiteReport, writer: &mut impl io::Write) -> io::Result<()> {
        let (label, style) = match suite.status() {
            SuiteStatus::Passed => ("PASS", self.styles.pass),
            SuiteStatus::Failed => ("FAIL", self.styles.fail),
            SuiteStatus::Skipped => ("SKIP", self.styles.skip),
        };
        write!(
            writer,
            "{:>12} [{:>8.3?}s] {} (",
            label.style(style),
            suite.state.duration.as_secs_f64(),
            suite.state.test_filepath.style(self.styles.file),
        )?;
        self.write_counts(&suite.summary, writer)?;
        writeln!(writer, ")")?;

        for error in &suite.state.errors {
            write!(writer, "{:>12} {}: {}", "", error.origin, error.message)?;
            if let Some(link) = &error.link {
                write!(writer, " ({link})")?;
            }
            writeln!(writer)?;
        }

        for unit in &suite.units {
            let (label, style) = match unit.status() {
                UnitStatus::Failed if unit.timed_out => ("TIMEOUT", self.styles.fail),
                UnitStatus::Failed => ("FAIL", self.styles.fail),
                UnitStatus::Passed if self.verbose => ("PASS", self.styles.pass),
                UnitStatus::Skipped if self.verbose => ("SKIP", self.styles.skip),
                UnitStatus::Passed | UnitStatus::Skipped => continue,
            };
            write!(
                writer,
                "{:>12} {}",
                label.style(style),
                unit.unit_name.join(" > ")
            )?;
            if let Some(link) = &unit.unit_link {
                write!(writer, " ({link})")?;
            }
            writeln!(writer)?;

            if let Some(error) = &unit.error {
                write!(writer, "{:>12} {}: {}", "", error.error.error_type, error.error.message)?;
                if let Some(link) = &error.expect_link {
                    write!(writer, " ({link})")?;
                }
                writeln!(writer)?;
            }
            for error in &unit.additional_errors {
                writeln!(writer, "{:>12} {}: {}", "", error.error_type, error.message)?;
            }
        }

        Ok(())
    }

    fn write_counts(&self, summary: &SuiteSummary, writer: &mut impl io::Write) -> io::Result<()> {
        write!(
            writer,
            "{} {}",
            summary.passed.style(self.styles.count),
            "passed".style(self.styles.pass)
        )?;
        if summary.failed > 0 {
            write!(
                writer,
                ", {} {}",
                summary.failed.style(self.styles.count),
                "failed".style(self.styles.fail)
            )?;
        }
        if summary.skipped > 0 {
            write!(
                writer,
                ", {} {}",
                summary.skipped.style(self.styles.count),
                "skipped".style(self.styles.skip)
            )?;
        }
        Ok(())
    }
}

fn plural(count: usize, singular: &'static str, plural: &'static str) -> &'static str {
    if count == 1 {
        singular
    } else {
        plural
    }
}

#[derive(Clone, Debug, Default)]
struct Styles {
    count: Style,
    pass: Style,
    fail: Style,
    skip: Style,
    file: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.count = Style::new().bold();
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.skip = Style::new().yellow().bold();
        self.file = Style::new().cyan();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::TestError,
        progress::{ErrorOrigin, ParsedError, UnitErrorReport},
    };
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn unit(name: &str, status: UnitStatus) -> UnitFinishState {
        let error = (status == UnitStatus::Failed).then(|| UnitErrorReport {
            error: ParsedError {
                origin: ErrorOrigin::Test,
                error_type: "Error".to_owned(),
                message: "boom".to_owned(),
                stack: None,
                link: None,
                thrown: TestError::new("boom"),
            },
            is_expect_error: false,
            expect_link: None,
        });
        UnitFinishState {
            unit_name: vec!["math".to_owned(), name.to_owned()],
            duration: (status == UnitStatus::Passed).then(|| Duration::from_millis(1)),
            error,
            additional_errors: Vec::new(),
            timed_out: false,
            skipped: status == UnitStatus::Skipped,
            unit_link: None,
        }
    }

    fn finished(handle: SuiteHandle, units: Vec<UnitFinishState>) -> TrackerEvent {
        TrackerEvent::Finished {
            handle,
            suite: SuiteFinishState {
                test_filepath: "./tests/math.rs".to_owned(),
                duration: Duration::from_millis(5),
                errors: Vec::new(),
                skipped: false,
            },
            units,
        }
    }

    fn sample_report() -> RunReport {
        let handle = SuiteHandle::new_v4();
        let mut aggregator = ReportAggregator::default();
        aggregator.record(TrackerEvent::SuiteAdded {
            handle,
            meta: SuiteMeta::new("/work/tests/math.rs"),
        });
        aggregator.record(finished(
            handle,
            vec![
                unit("adds", UnitStatus::Passed),
                unit("divides", UnitStatus::Failed),
                unit("later", UnitStatus::Skipped),
            ],
        ));
        aggregator.finish(Local::now(), Duration::from_millis(1500), false, Vec::new())
    }

    #[test]
    fn counts_are_consistent() {
        let report = sample_report();
        let suite = &report.suites[0];
        assert_eq!(
            suite.summary,
            SuiteSummary {
                total: 3,
                passed: 1,
                failed: 1,
                skipped: 1,
            }
        );
        assert_eq!(suite.status(), SuiteStatus::Failed);
        assert_eq!(report.stats.units, suite.summary);
        assert_eq!(report.stats.suites.failed, 1);
        assert_eq!(report.stats.suites.total, 1);
    }

    #[test]
    fn suites_are_reported_in_added_order() {
        let handles: Vec<_> = (0..3).map(|_| SuiteHandle::new_v4()).collect();
        let mut aggregator = ReportAggregator::default();
        for (handle, file) in handles.iter().zip(["a", "b", "c"]) {
            aggregator.record(TrackerEvent::SuiteAdded {
                handle: *handle,
                meta: SuiteMeta::new(format!("/work/tests/{file}.rs")),
            });
        }
        for &i in &[2, 0, 1] {
            aggregator.record(finished(handles[i], vec![unit("adds", UnitStatus::Passed)]));
        }

        let report = aggregator.finish(Local::now(), Duration::ZERO, true, Vec::new());
        let order: Vec<_> = report.suites.iter().map(|suite| suite.handle).collect();
        assert_eq!(order, handles);
        assert!(report.success);
    }

    #[test]
    fn suite_errors_fail_the_run() {
        let handle = SuiteHandle::new_v4();
        let mut aggregator = ReportAggregator::default();
        aggregator.record(TrackerEvent::SuiteAdded {
            handle,
            meta: SuiteMeta::new("/work/tests/math.rs"),
        });
        let mut event = finished(handle, vec![unit("adds", UnitStatus::Passed)]);
        if let TrackerEvent::Finished { suite, .. } = &mut event {
            suite.errors.push(ParsedError {
                origin: ErrorOrigin::LifecycleHook,
                error_type: "Error".to_owned(),
                message: "teardown broke".to_owned(),
                stack: None,
                link: None,
                thrown: TestError::new("teardown broke"),
            });
        }
        aggregator.record(event);

        // Every unit passed and the runner saw no failure, but the suite reported an error.
        let report = aggregator.finish(Local::now(), Duration::ZERO, true, Vec::new());
        assert_eq!(report.suites[0].status(), SuiteStatus::Failed);
        assert!(!report.success);
    }

    #[test]
    fn unknown_suites_are_ignored() {
        let mut aggregator = ReportAggregator::default();
        aggregator.record(finished(SuiteHandle::new_v4(), Vec::new()));
        let report = aggregator.finish(Local::now(), Duration::ZERO, true, Vec::new());
        assert!(report.suites.is_empty());
    }

    #[test]
    fn plain_summary() {
        let mut out = Vec::new();
        SummaryDisplayer::new(false)
            .write_report(&sample_report(), &mut out)
            .unwrap();

        let expected = indoc! {"
                    FAIL [   0.005s] ./tests/math.rs (1 passed, 1 failed, 1 skipped)
                    FAIL math > divides
                         Error: boom
            ------------
                 Summary [   1.500s] 3 units in 1 file: 1 passed, 1 failed, 1 skipped
        "};
        assert_eq!(String::from_utf8(out).unwrap(), expected);
    }
}
