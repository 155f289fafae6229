//! Execution engine for compiled artifacts
//!
//! A run takes an admission slot, prepares its sandbox, starts the artifact
//! and then races three events: the process exiting, the wall-clock deadline
//! and the caller's cancellation token. Standard input is relayed from the
//! caller while the process runs; standard output and error are streamed to
//! the caller's sinks as they are produced.

use crate::config::ExecutionConfig;
use crate::executors::admission::Admission;
use crate::sandbox::Sandbox;
use sandpit_types::CloseStatus;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio_util::sync::CancellationToken;

/// What to run and for how long
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub exe_path: PathBuf,
    pub args: Vec<String>,
    /// Measured from process start
    pub timeout: Duration,
    /// Cancelling this kills the process
    pub cancel: CancellationToken,
}

impl RunRequest {
    pub fn new(exe_path: PathBuf, timeout: Duration) -> Self {
        Self {
            exe_path,
            args: Vec::new(),
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Why a run did not produce an exit code
///
/// The messages are shown to the user verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    #[error("timeout exceeded: the program ran longer than {0:?}")]
    TimeoutExceeded(Duration),
    #[error("the run was cancelled")]
    Cancelled,
    #[error("server busy: too many programs are running, please try again later")]
    AdmissionDenied,
    #[error("sandbox setup failed: {0}")]
    SandboxSetupFailed(String),
    #[error("the program could not be started: {0}")]
    ProcessStartFailed(String),
    #[error("the program was killed by signal {0}")]
    Signaled(i32),
}

/// Terminal result of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Exited(i32),
    Failed(FailureReason),
}

impl RunOutcome {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunOutcome::Exited(code) => Some(*code),
            RunOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            RunOutcome::Exited(_) => None,
            RunOutcome::Failed(reason) => Some(reason),
        }
    }

    /// How the run connection should be closed for this outcome.
    pub fn close_status(&self) -> CloseStatus {
        match self {
            RunOutcome::Exited(code) => {
                CloseStatus::normal(format!("program exited with code {}", code))
            }
            RunOutcome::Failed(reason) => CloseStatus::internal_error(reason.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    AdmissionPending,
    SandboxSetup,
    Running,
    Completed,
    TimedOut,
    Cancelled,
    StartFailed,
    SandboxFailed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::AdmissionPending => "admission-pending",
            RunState::SandboxSetup => "sandbox-setup",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::TimedOut => "timed-out",
            RunState::Cancelled => "cancelled",
            RunState::StartFailed => "start-failed",
            RunState::SandboxFailed => "sandbox-failed",
        };
        f.write_str(name)
    }
}

struct RunLog {
    id: u64,
    state: RunState,
}

impl RunLog {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: RunState::Idle,
        }
    }

    fn enter(&mut self, next: RunState) {
        log::debug!("run {}: {} -> {}", self.id, self.state, next);
        self.state = next;
    }
}

/// Runs untrusted executables with bounded concurrency
pub struct ExecutionEngine {
    admission: Admission,
    sandbox: Arc<dyn Sandbox>,
    output_drain: Duration,
    next_run_id: AtomicU64,
}

impl fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("admission", &self.admission)
            .field("sandbox", &self.sandbox.name())
            .field("output_drain", &self.output_drain)
            .finish()
    }
}

impl ExecutionEngine {
    pub fn new(config: &ExecutionConfig, sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            admission: Admission::new(config.max_concurrent_processes, config.acquire_timeout()),
            sandbox,
            output_drain: config.output_drain(),
            next_run_id: AtomicU64::new(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.admission.capacity()
    }

    pub fn available_slots(&self) -> usize {
        self.admission.available()
    }

    /// Run an artifact to completion.
    ///
    /// `stdin` is copied into the process until it reports end of input;
    /// `stdout` and `stderr` receive the process output and are shut down
    /// once it has been relayed. The admission slot is released on every
    /// path out of this function.
    pub async fn run<I, O, E>(&self, request: RunRequest, stdin: I, stdout: O, stderr: E) -> RunOutcome
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let mut state = RunLog::new(run_id);

        state.enter(RunState::AdmissionPending);
        let slot = tokio::select! {
            slot = self.admission.acquire() => slot,
            _ = request.cancel.cancelled() => {
                state.enter(RunState::Cancelled);
                return RunOutcome::Failed(FailureReason::Cancelled);
            }
        };
        let Some(_slot) = slot else {
            log::warn!("run {}: no admission slot within the acquire timeout", run_id);
            return RunOutcome::Failed(FailureReason::AdmissionDenied);
        };

        state.enter(RunState::SandboxSetup);
        let confinement = match self.sandbox.prepare(run_id) {
            Ok(confinement) => confinement,
            Err(e) => {
                log::error!("run {}: sandbox setup failed: {}", run_id, e);
                state.enter(RunState::SandboxFailed);
                return RunOutcome::Failed(FailureReason::SandboxSetupFailed(e.to_string()));
            }
        };

        let mut command = Command::new(&request.exe_path);
        command
            .args(&request.args)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = request.exe_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            command.current_dir(dir);
        }
        confinement.apply(&mut command);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::error!(
                    "run {}: failed to start {}: {}",
                    run_id,
                    request.exe_path.display(),
                    e
                );
                state.enter(RunState::StartFailed);
                return RunOutcome::Failed(FailureReason::ProcessStartFailed(e.to_string()));
            }
        };
        state.enter(RunState::Running);
        log::info!(
            "run {}: started {} (pid {:?}, sandbox {})",
            run_id,
            request.exe_path.display(),
            child.id(),
            self.sandbox.name()
        );

        let cancel = request.cancel.child_token();
        let stdin_task = tokio::spawn(relay_stdin(run_id, stdin, child.stdin.take(), cancel.clone()));
        let mut stdout_task = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(relay_output(run_id, "stdout", pipe, stdout, cancel.clone())));
        let mut stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(relay_output(run_id, "stderr", pipe, stderr, cancel.clone())));

        let outcome = tokio::select! {
            biased;
            status = child.wait() => match status {
                Ok(status) => {
                    state.enter(RunState::Completed);
                    exit_outcome(status)
                }
                Err(e) => {
                    log::error!("run {}: failed to wait for process: {}", run_id, e);
                    state.enter(RunState::StartFailed);
                    RunOutcome::Failed(FailureReason::ProcessStartFailed(e.to_string()))
                }
            },
            _ = tokio::time::sleep(request.timeout) => {
                log::warn!("run {}: timeout of {:?} exceeded, killing process", run_id, request.timeout);
                if let Err(e) = child.kill().await {
                    log::error!("run {}: failed to kill process: {}", run_id, e);
                }
                state.enter(RunState::TimedOut);
                RunOutcome::Failed(FailureReason::TimeoutExceeded(request.timeout))
            }
            _ = cancel.cancelled() => {
                log::info!("run {}: cancelled, killing process", run_id);
                if let Err(e) = child.kill().await {
                    log::error!("run {}: failed to kill process: {}", run_id, e);
                }
                state.enter(RunState::Cancelled);
                RunOutcome::Failed(FailureReason::Cancelled)
            }
        };

        // Unblocks a stdin relay still waiting on the caller.
        cancel.cancel();
        if let Err(e) = stdin_task.await {
            log::error!("run {}: stdin relay panicked: {}", run_id, e);
        }

        let drain = async {
            if let Some(task) = stdout_task.as_mut() {
                let _ = task.await;
            }
            if let Some(task) = stderr_task.as_mut() {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(self.output_drain, drain).await.is_err() {
            log::warn!("run {}: output still open after exit, dropping it", run_id);
            for task in [stdout_task, stderr_task].into_iter().flatten() {
                task.abort();
            }
        }

        log::info!("run {}: finished with {:?}", run_id, outcome);
        outcome
    }
}

#[cfg(unix)]
fn exit_outcome(status: ExitStatus) -> RunOutcome {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => RunOutcome::Exited(code),
        (None, Some(signal)) => RunOutcome::Failed(FailureReason::Signaled(signal)),
        (None, None) => RunOutcome::Exited(-1),
    }
}

#[cfg(not(unix))]
fn exit_outcome(status: ExitStatus) -> RunOutcome {
    RunOutcome::Exited(status.code().unwrap_or(-1))
}

fn is_benign(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::UnexpectedEof
    )
}

async fn relay_stdin<R>(run_id: u64, mut source: R, sink: Option<ChildStdin>, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let Some(mut sink) = sink else {
        return;
    };

    tokio::select! {
        result = tokio::io::copy(&mut source, &mut sink) => match result {
            Ok(bytes) => log::debug!("run {}: stdin closed after {} bytes", run_id, bytes),
            Err(e) if is_benign(&e) => log::debug!("run {}: stdin relay ended: {}", run_id, e),
            Err(e) => log::warn!("run {}: stdin relay failed: {}", run_id, e),
        },
        _ = cancel.cancelled() => {}
    }

    // Dropping the pipe signals end of input to the process.
    drop(sink);
}

async fn relay_output<R, W>(run_id: u64, channel: &'static str, mut source: R, mut sink: W, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = match tokio::io::copy(&mut source, &mut sink).await {
        Ok(_) => sink.shutdown().await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        // Nobody is listening any more; stop the program.
        log::debug!("run {}: {} relay failed: {}", run_id, channel, e);
        cancel.cancel();
    }
}
