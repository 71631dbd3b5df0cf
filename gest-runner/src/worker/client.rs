// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker side of multiprocessing: reading requests from the host and running suites.

use super::{
    protocol::{self, HostMessage, WorkerMessage},
    HostApi,
};
use crate::{
    errors::{TestError, WorkerError},
    helpers::lock,
    progress::{ProgressSink, SuiteProgress, UnitProgress},
    registry::{SuiteRegistry, TestSuiteEntry},
    runner::{run_module, AfterAllPolicy, ModuleOutcome, RunSettings, TestRunnerOptions},
    suite::{LogSink, LogType},
};
use std::{
    io::{self, Write},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

/// Runs the current process as a worker, serving requests from stdin until it is closed.
///
/// This is what the hidden worker subcommand calls.
pub fn serve(registry: SuiteRegistry) -> Result<(), WorkerError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("gest-worker")
        .build()
        .map_err(WorkerError::TokioRuntimeCreate)?;

    let result = runtime.block_on(serve_io(
        &registry,
        tokio::io::stdin(),
        Box::new(io::stdout()),
    ));
    runtime.shutdown_background();
    result
}

/// Serves requests read from `input`, writing messages for the host to `output`.
pub async fn serve_io(
    registry: &SuiteRegistry,
    input: impl AsyncRead + Unpin,
    output: Box<dyn Write + Send>,
) -> Result<(), WorkerError> {
    let proxy = Arc::new(HostProxy::new(output));
    let mut lines = BufReader::new(input).lines();

    while let Some(line) = lines.next_line().await? {
        match protocol::decode::<HostMessage>(&line) {
            Some(Ok(HostMessage::RunSuite {
                entry,
                options,
                default_timeout,
                after_all_policy,
            })) => {
                run_suite(
                    registry,
                    &proxy,
                    entry,
                    &options,
                    default_timeout,
                    after_all_policy,
                )
                .await;
            }
            Some(Err(err)) => return Err(WorkerError::Protocol(err)),
            None if line.trim().is_empty() => {}
            None => warn!("ignoring unexpected input from the host: {line}"),
        }
    }

    debug!("host closed stdin, exiting");
    Ok(())
}

async fn run_suite(
    registry: &SuiteRegistry,
    proxy: &Arc<HostProxy>,
    entry: TestSuiteEntry,
    options: &TestRunnerOptions,
    default_timeout: Duration,
    after_all_policy: AfterAllPolicy,
) {
    debug!(test_file = %entry.test_file, "running suite in worker");
    let settings = match RunSettings::new(options, default_timeout, after_all_policy) {
        Ok(settings) => settings,
        Err(err) => {
            proxy.test_finished(Some(TestError::from_std(&err)));
            return;
        }
    };

    let outcome = run_module(
        registry,
        &entry.test_file,
        &settings,
        &**proxy,
        proxy.clone(),
    )
    .await;

    match outcome {
        Ok(ModuleOutcome::Ran { passed, duration }) => {
            if !passed {
                proxy.tests_failed();
            }
            proxy.finish(Some(duration));
            proxy.test_finished(None);
        }
        Ok(ModuleOutcome::NotATest(error)) => {
            proxy.finish(None);
            proxy.test_finished(Some(error));
        }
        Err(error) => proxy.test_finished(Some(error)),
    }
}

/// The host API as seen from a worker: every call is written to the host as a protocol message.
struct HostProxy {
    output: Mutex<Box<dyn Write + Send>>,
}

impl HostProxy {
    fn new(output: Box<dyn Write + Send>) -> Self {
        Self {
            output: Mutex::new(output),
        }
    }

    fn send(&self, message: WorkerMessage) {
        let result = protocol::encode(&message)
            .map_err(WorkerError::Protocol)
            .and_then(|line| {
                let mut output = lock(&self.output);
                output.write_all(line.as_bytes())?;
                output.flush()?;
                Ok(())
            });
        if let Err(err) = result {
            warn!("failed to send message to host: {err}");
        }
    }
}

impl HostApi for HostProxy {
    fn unit_progress(&self, record: UnitProgress) {
        self.send(WorkerMessage::UnitProgress { record });
    }

    fn suite_progress(&self, record: SuiteProgress) {
        self.send(WorkerMessage::SuiteProgress { record });
    }

    fn finish(&self, duration: Option<Duration>) {
        self.send(WorkerMessage::Finish { duration });
    }

    fn send_log(&self, log_type: LogType, args: Vec<String>) {
        self.send(WorkerMessage::SendLog { log_type, args });
    }

    fn tests_failed(&self) {
        self.send(WorkerMessage::TestsFailed);
    }

    fn test_finished(&self, error: Option<TestError>) {
        self.send(WorkerMessage::TestFinished { error });
    }
}

impl ProgressSink for HostProxy {
    fn unit_progress(&self, record: UnitProgress) {
        HostApi::unit_progress(self, record);
    }

    fn suite_progress(&self, record: SuiteProgress) {
        HostApi::suite_progress(self, record);
    }
}

impl LogSink for HostProxy {
    fn log(&self, log_type: LogType, message: &str) {
        self.send_log(log_type, vec![message.to_owned()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        registry::{ModuleExport, TestModule},
        suite::describe,
    };
    use pretty_assertions::assert_eq;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn messages(&self) -> Vec<WorkerMessage> {
            let buf = self.0.lock().unwrap();
            String::from_utf8_lossy(&buf)
                .lines()
                .map(|line| protocol::decode(line).expect("protocol line").unwrap())
                .collect()
        }
    }

    fn registry() -> SuiteRegistry {
        let mut registry = SuiteRegistry::new();
        registry
            .register("tests/math.rs", || {
                TestModule::new(describe("math", |s| {
                    s.it("adds", |cx| async move {
                        cx.log(LogType::Info, "adding");
                        Ok(())
                    });
                    s.it("fails", |_| async { Err(TestError::new("boom")) });
                }))
            })
            .register("tests/helpers.rs", || TestModule {
                default_export: ModuleExport::Other("a function".to_owned()),
                timeout: None,
            });
        registry
    }

    fn request(test_file: &str) -> String {
        protocol::encode(&HostMessage::RunSuite {
            entry: TestSuiteEntry {
                test_file: test_file.into(),
                map_file: None,
            },
            options: TestRunnerOptions::default(),
            default_timeout: Duration::from_secs(5),
            after_all_policy: AfterAllPolicy::ReportOnly,
        })
        .unwrap()
    }

    fn kind(message: &WorkerMessage) -> &'static str {
        match message {
            WorkerMessage::UnitProgress { .. } => "unitProgress",
            WorkerMessage::SuiteProgress { .. } => "suiteProgress",
            WorkerMessage::Finish { .. } => "finish",
            WorkerMessage::SendLog { .. } => "sendLog",
            WorkerMessage::TestsFailed => "testsFailed",
            WorkerMessage::TestFinished { .. } => "testFinished",
        }
    }

    #[tokio::test]
    async fn runs_suite_and_reports() {
        let buf = SharedBuf::default();
        let input = request("tests/math.rs");
        serve_io(&registry(), input.as_bytes(), Box::new(buf.clone()))
            .await
            .unwrap();

        let messages = buf.messages();
        let kinds: Vec<_> = messages.iter().map(kind).collect();
        assert_eq!(
            kinds,
            [
                "sendLog",
                "unitProgress",
                "unitProgress",
                "testsFailed",
                "finish",
                "testFinished"
            ]
        );
        assert!(matches!(
            messages.last(),
            Some(WorkerMessage::TestFinished { error: None })
        ));
    }

    #[tokio::test]
    async fn not_a_test_is_reported_once() {
        let buf = SharedBuf::default();
        let input = request("tests/helpers.rs");
        serve_io(&registry(), input.as_bytes(), Box::new(buf.clone()))
            .await
            .unwrap();

        let messages = buf.messages();
        let kinds: Vec<_> = messages.iter().map(kind).collect();
        assert_eq!(kinds, ["suiteProgress", "finish", "testFinished"]);
        match messages.last() {
            Some(WorkerMessage::TestFinished { error: Some(error) }) => {
                assert!(error.is_gest_error());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_file_finishes_with_error() {
        let buf = SharedBuf::default();
        let input = request("tests/missing.rs");
        serve_io(&registry(), input.as_bytes(), Box::new(buf.clone()))
            .await
            .unwrap();

        match buf.messages().as_slice() {
            [WorkerMessage::TestFinished { error: Some(error) }] => {
                assert!(!error.is_gest_error());
            }
            other => panic!("unexpected messages: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_request_is_an_error() {
        let err = serve_io(
            &registry(),
            "@@gest:{\"type\":\"bogus\"}\n".as_bytes(),
            Box::new(io::sink()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WorkerError::Protocol(_)));
    }
}
