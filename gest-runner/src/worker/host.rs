// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The host side of multiprocessing: spawning workers and receiving their messages.

use super::{
    protocol::{self, HostMessage, WorkerMessage},
    WorkerCommand,
};
use crate::{
    errors::{TestError, WorkerError},
    helpers::lock,
    progress::{ProgressTracker, SuiteHandle, SuiteProgress, UnitProgress},
    suite::{LogSink, LogType, TracingLogSink},
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin},
    sync::{oneshot, watch},
};
use tracing::{debug, warn};

/// The calls a worker can make into the host.
pub trait HostApi: Send + Sync + 'static {
    /// Records a unit's outcome for the suite the worker is running.
    fn unit_progress(&self, record: UnitProgress);

    /// Records a suite-level event for the suite the worker is running.
    fn suite_progress(&self, record: SuiteProgress);

    /// Finishes the suite the worker is running.
    fn finish(&self, duration: Option<Duration>);

    /// Logs a console message from test code.
    fn send_log(&self, log_type: LogType, args: Vec<String>);

    /// Records that at least one unit or suite failed.
    fn tests_failed(&self);

    /// The worker is done with the current test file.
    fn test_finished(&self, error: Option<TestError>);
}

/// Identifies a runner slot.
pub type SlotId = usize;

/// How a worker process exited.
#[derive(Clone, Debug)]
pub struct WorkerExit {
    /// The exit code, if the process exited normally.
    pub code: Option<i32>,

    /// Everything the worker wrote to stderr.
    pub stderr: String,
}

/// A running worker process.
#[derive(Debug)]
pub struct WorkerHandle {
    slot: SlotId,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    exit: watch::Receiver<Option<WorkerExit>>,
}

impl WorkerHandle {
    fn spawn(
        slot: SlotId,
        command: &WorkerCommand,
        api: Arc<dyn HostApi>,
    ) -> Result<Self, WorkerError> {
        let mut child = command
            .to_command()
            .spawn()
            .map_err(|err| WorkerError::Spawn {
                program: command.program().display().to_string(),
                err,
            })?;
        debug!(slot, pid = ?child.id(), "spawned worker");

        let stdin = child.stdin.take().ok_or(WorkerError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(WorkerError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(WorkerError::MissingPipe("stderr"))?;

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(monitor(slot, child, stdout, stderr, api, kill_rx, exit_tx));

        Ok(Self {
            slot,
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            kill: Mutex::new(Some(kill_tx)),
            exit: exit_rx,
        })
    }

    /// Sends a message to the worker.
    pub async fn send(&self, message: &HostMessage) -> Result<(), WorkerError> {
        let line = protocol::encode(message)?;
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or(WorkerError::Exited)?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Returns true if the worker process has exited.
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Waits for the worker process to exit.
    pub async fn wait(&self) -> WorkerExit {
        let mut exit = self.exit.clone();
        let status = match exit.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone(),
            // The monitor task went away without recording an exit.
            Err(_) => None,
        };
        status.unwrap_or_else(unknown_exit)
    }

    /// Asks the worker to exit by closing its stdin, and kills it if it doesn't within `grace`.
    pub async fn terminate(&self, grace: Duration) -> WorkerExit {
        self.stdin.lock().await.take();
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!(slot = self.slot, "worker did not exit in time, killing it");
                if let Some(kill) = lock(&self.kill).take() {
                    _ = kill.send(());
                }
                self.wait().await
            }
        }
    }
}

fn unknown_exit() -> WorkerExit {
    WorkerExit {
        code: None,
        stderr: String::new(),
    }
}

/// Owns the child process: dispatches its output and records how it exited.
async fn monitor(
    slot: SlotId,
    mut child: Child,
    stdout: impl AsyncRead + Unpin,
    stderr: impl AsyncRead + Unpin + Send + 'static,
    api: Arc<dyn HostApi>,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<WorkerExit>>,
) {
    let stderr_task = tokio::spawn(read_to_string(stderr));

    let dispatch = dispatch_output(slot, stdout, &*api);
    tokio::pin!(dispatch);
    let mut dispatch_done = false;
    let mut kill_done = false;

    let status = loop {
        tokio::select! {
            () = &mut dispatch, if !dispatch_done => dispatch_done = true,
            result = &mut kill_rx, if !kill_done => {
                kill_done = true;
                if result.is_ok() {
                    _ = child.start_kill();
                }
            }
            status = child.wait() => break status,
        }
    };
    // Drain whatever the worker wrote before it exited.
    if !dispatch_done {
        dispatch.await;
    }

    let stderr = stderr_task.await.unwrap_or_default();
    let code = match status {
        Ok(status) => status.code(),
        Err(error) => {
            warn!(slot, "failed to wait for worker: {error}");
            None
        }
    };
    debug!(slot, ?code, "worker exited");
    exit_tx.send_replace(Some(WorkerExit { code, stderr }));
}

async fn dispatch_output(slot: SlotId, stdout: impl AsyncRead + Unpin, api: &dyn HostApi) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                warn!(slot, "failed to read worker output: {error}");
                break;
            }
        };

        match protocol::decode::<WorkerMessage>(&line) {
            Some(Ok(message)) => dispatch(message, api),
            Some(Err(error)) => warn!(slot, "malformed message from worker: {error}"),
            // Test code printed something.
            None => api.send_log(LogType::Log, vec![line]),
        }
    }
}

fn dispatch(message: WorkerMessage, api: &dyn HostApi) {
    match message {
        WorkerMessage::UnitProgress { record } => api.unit_progress(record),
        WorkerMessage::SuiteProgress { record } => api.suite_progress(record),
        WorkerMessage::Finish { duration } => api.finish(duration),
        WorkerMessage::SendLog { log_type, args } => api.send_log(log_type, args),
        WorkerMessage::TestsFailed => api.tests_failed(),
        WorkerMessage::TestFinished { error } => api.test_finished(error),
    }
}

async fn read_to_string(mut reader: impl AsyncRead + Unpin) -> String {
    let mut buf = Vec::new();
    if let Err(error) = reader.read_to_end(&mut buf).await {
        warn!("failed to read worker stderr: {error}");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Manages one long-lived worker process per runner slot.
#[derive(Debug)]
pub struct Multiprocessing {
    command: WorkerCommand,
    grace_period: Duration,
    workers: tokio::sync::Mutex<HashMap<SlotId, Arc<WorkerHandle>>>,
}

impl Multiprocessing {
    /// The default time a worker is given to exit after its stdin is closed.
    pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

    /// Creates a new manager that starts workers with `command`.
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            grace_period: Self::DEFAULT_GRACE_PERIOD,
            workers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Returns the worker for `slot`, spawning one bound to `api` if there isn't a live one.
    pub async fn get_worker(
        &self,
        slot: SlotId,
        api: Arc<dyn HostApi>,
    ) -> Result<Arc<WorkerHandle>, WorkerError> {
        let mut workers = self.workers.lock().await;
        if let Some(worker) = workers.get(&slot) {
            if !worker.has_exited() {
                return Ok(worker.clone());
            }
            debug!(slot, "worker exited while idle, respawning");
        }

        let worker = Arc::new(WorkerHandle::spawn(slot, &self.command, api)?);
        workers.insert(slot, worker.clone());
        Ok(worker)
    }

    /// Forgets the worker for `slot` without waiting for it. Its stdin is closed once the last
    /// reference to it is dropped.
    pub async fn remove_worker(&self, slot: SlotId) {
        self.workers.lock().await.remove(&slot);
    }

    /// Shuts down the worker for `slot`, if there is one.
    pub async fn terminate_worker(&self, slot: SlotId) {
        let worker = self.workers.lock().await.remove(&slot);
        if let Some(worker) = worker {
            let exit = worker.terminate(self.grace_period).await;
            debug!(slot, code = ?exit.code, "worker terminated");
        }
    }

    /// Shuts down every worker. Failures are logged and otherwise ignored.
    pub async fn close_all(&self) {
        let workers: Vec<_> = self.workers.lock().await.drain().collect();
        let grace = self.grace_period;
        futures::future::join_all(workers.into_iter().map(|(slot, worker)| async move {
            let exit = worker.terminate(grace).await;
            if exit.code != Some(0) {
                debug!(slot, code = ?exit.code, "worker exited abnormally during shutdown");
            }
        }))
        .await;
    }

    /// Runs a test file in the worker for `slot`, reporting through `api`.
    ///
    /// Returns once the worker reports that it's done with the file. If the worker exits first, the
    /// file fails with an error carrying the worker's stderr, and the slot gets a fresh worker for
    /// its next file.
    pub async fn run_suite(
        &self,
        slot: SlotId,
        api: &Arc<WorkerApi>,
        handle: SuiteHandle,
        message: &HostMessage,
    ) -> Result<(), TestError> {
        let finished = api.begin_suite(handle);
        let result = self.run_suite_inner(slot, api, finished, message).await;
        api.end_suite();
        result
    }

    async fn run_suite_inner(
        &self,
        slot: SlotId,
        api: &Arc<WorkerApi>,
        finished: oneshot::Receiver<Option<TestError>>,
        message: &HostMessage,
    ) -> Result<(), TestError> {
        let worker = self
            .get_worker(slot, api.clone())
            .await
            .map_err(|err| TestError::from_std(&err))?;

        if let Err(err) = worker.send(message).await {
            // A broken pipe means the worker is gone; report its stderr rather than the pipe error.
            debug!(slot, "failed to send to worker: {err}");
        }

        let result = tokio::select! {
            biased;

            finished = finished => match finished {
                Ok(None) => return Ok(()),
                Ok(Some(error)) => return Err(error),
                Err(_) => TestError::new("worker API dropped before the test file finished"),
            },
            exit = worker.wait() => TestError::new(format!(
                "Test subprocess exited unexpectedly with: {}",
                exit.stderr
            )),
        };

        self.remove_worker(slot).await;
        Err(result)
    }
}

/// The [`HostApi`] for a runner slot, which forwards worker events into a [`ProgressTracker`].
#[derive(Debug)]
pub struct WorkerApi {
    tracker: ProgressTracker,
    state: Mutex<WorkerApiState>,
}

#[derive(Debug, Default)]
struct WorkerApiState {
    current: Option<SuiteHandle>,
    // The worker's `finish`, held back until it reports `test_finished`. A worker that exits in
    // between leaves the suite open, so the crash can still be reported against it.
    pending_finish: Option<Option<Duration>>,
    on_next_finish: Option<oneshot::Sender<Option<TestError>>>,
    failed: bool,
}

impl WorkerApi {
    /// Creates a new API that reports into `tracker`.
    pub fn new(tracker: ProgressTracker) -> Self {
        Self {
            tracker,
            state: Mutex::new(WorkerApiState::default()),
        }
    }

    fn begin_suite(&self, handle: SuiteHandle) -> oneshot::Receiver<Option<TestError>> {
        let (sender, receiver) = oneshot::channel();
        let mut state = lock(&self.state);
        state.current = Some(handle);
        state.on_next_finish = Some(sender);
        receiver
    }

    fn end_suite(&self) {
        let mut state = lock(&self.state);
        state.current = None;
        state.pending_finish = None;
        state.on_next_finish = None;
    }

    /// Returns true if the worker reported a failure since the last call, and resets the flag.
    pub fn take_failed(&self) -> bool {
        std::mem::take(&mut lock(&self.state).failed)
    }

    fn current(&self) -> Option<SuiteHandle> {
        let current = lock(&self.state).current;
        if current.is_none() {
            warn!("no suite is running in the worker, progress update will be lost");
        }
        current
    }
}

impl HostApi for WorkerApi {
    fn unit_progress(&self, record: UnitProgress) {
        if let Some(handle) = self.current() {
            self.tracker.unit_progress(handle, record);
        }
    }

    fn suite_progress(&self, record: SuiteProgress) {
        if let Some(handle) = self.current() {
            self.tracker.suite_progress(handle, record);
        }
    }

    fn finish(&self, duration: Option<Duration>) {
        if self.current().is_some() {
            lock(&self.state).pending_finish = Some(duration);
        }
    }

    fn send_log(&self, log_type: LogType, args: Vec<String>) {
        TracingLogSink.log(log_type, &args.join(" "));
    }

    fn tests_failed(&self) {
        lock(&self.state).failed = true;
    }

    fn test_finished(&self, error: Option<TestError>) {
        let (current, pending_finish, sender) = {
            let mut state = lock(&self.state);
            (
                state.current,
                state.pending_finish.take(),
                state.on_next_finish.take(),
            )
        };
        if let (Some(handle), Some(duration)) = (current, pending_finish) {
            self.tracker.finish(handle, duration);
        }
        match sender {
            Some(sender) => _ = sender.send(error),
            None => warn!("worker finished a test file that wasn't requested"),
        }
    }
}
