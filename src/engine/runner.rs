use std::{
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;

use crate::engine::{
    accounting::Termination,
    bus::EventBus,
    error::EngineError,
    events::{OutputEvent, StatusKind},
    models::SandboxLimits,
    sandbox::{OutputSink, Phase, SandboxBackend, SandboxHandle, StreamKind, lock},
    session::SessionId,
};

pub const TRUNCATION_NOTICE: &str = "\n[output truncated: limit reached]\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Compiling,
    Running,
    Completed,
    CompileFailed,
    RuntimeError,
    TimedOut,
    Terminated,
}

impl RunnerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Compiling => "compiling",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompileFailed => "compile_failed",
            Self::RuntimeError => "runtime_error",
            Self::TimedOut => "timed_out",
            Self::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: RunnerState,
    pub termination: Termination,
    pub exit_code: Option<i64>,
    /// Every state entered, starting with `Idle`.
    pub transitions: Vec<RunnerState>,
    pub exited_at: Instant,
}

enum PhaseEnd {
    Exited(i64),
    TimedOut,
    Cancelled,
}

/// Drives one provisioned sandbox through compile and run, relaying output
/// to the session's topic. The terminal status is left to the caller, which
/// attaches usage after accounting.
pub struct Runner<'a> {
    backend: &'a dyn SandboxBackend,
    bus: &'a EventBus,
    limits: &'a SandboxLimits,
    cancel: CancellationToken,
}

impl<'a> Runner<'a> {
    pub fn new(
        backend: &'a dyn SandboxBackend,
        bus: &'a EventBus,
        limits: &'a SandboxLimits,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            bus,
            limits,
            cancel,
        }
    }

    pub async fn run(&self, sandbox: &SandboxHandle) -> Result<RunOutcome, EngineError> {
        let session_id = sandbox.session_id();
        let budget = OutputBudget::new(self.limits.max_output_bytes);
        let mut transitions = vec![RunnerState::Idle];

        if sandbox.phase(Phase::Compile).is_some() {
            transitions.push(RunnerState::Compiling);
            self.bus
                .publish(session_id, OutputEvent::status(session_id.as_str(), StatusKind::Compiling));

            let sink = PhaseSink::new(self.bus, session_id, session_id.compile_scope(), &budget);
            let timeout = Duration::from_millis(self.limits.compile_timeout_ms);
            let end = self.phase(sandbox, Phase::Compile, timeout, &sink).await;
            sink.flush();

            let stopped = match end? {
                PhaseEnd::Exited(0) => None,
                PhaseEnd::Exited(code) => Some((
                    RunnerState::CompileFailed,
                    Termination::new(StatusKind::Error, "compilation failed"),
                    Some(code),
                )),
                PhaseEnd::TimedOut => Some((
                    RunnerState::TimedOut,
                    Termination::new(StatusKind::Terminated, "compilation timeout"),
                    None,
                )),
                PhaseEnd::Cancelled => Some((
                    RunnerState::Terminated,
                    Termination::new(StatusKind::Terminated, "cancelled"),
                    None,
                )),
            };
            if let Some((state, termination, exit_code)) = stopped {
                transitions.push(state);
                return Ok(RunOutcome {
                    state,
                    termination,
                    exit_code,
                    transitions,
                    exited_at: Instant::now(),
                });
            }
        }

        // Reported usage is the program's, not the compiler's.
        sandbox.reset_usage();
        transitions.push(RunnerState::Running);
        self.bus
            .publish(session_id, OutputEvent::status(session_id.as_str(), StatusKind::Running));

        let sink = PhaseSink::new(self.bus, session_id, session_id.to_string(), &budget);
        let timeout = Duration::from_millis(self.limits.run_timeout_ms);
        let end = self.phase(sandbox, Phase::Run, timeout, &sink).await;
        let exited_at = Instant::now();
        sink.flush();

        let (state, termination, exit_code) = match end? {
            PhaseEnd::Exited(code) => {
                let termination = self.backend.exit_codes().describe(code);
                let state = match termination.kind {
                    StatusKind::Completed => RunnerState::Completed,
                    // Limits enforced by the sandbox itself.
                    StatusKind::Terminated => RunnerState::TimedOut,
                    _ => RunnerState::RuntimeError,
                };
                (state, termination, Some(code))
            }
            PhaseEnd::TimedOut => (
                RunnerState::TimedOut,
                Termination::new(StatusKind::Terminated, "execution timeout"),
                None,
            ),
            PhaseEnd::Cancelled => (
                RunnerState::Terminated,
                Termination::new(StatusKind::Terminated, "cancelled"),
                None,
            ),
        };
        transitions.push(state);

        Ok(RunOutcome {
            state,
            termination,
            exit_code,
            transitions,
            exited_at,
        })
    }

    async fn phase(
        &self,
        sandbox: &SandboxHandle,
        phase: Phase,
        timeout: Duration,
        sink: &PhaseSink<'_>,
    ) -> Result<PhaseEnd, EngineError> {
        let session_id = sandbox.session_id();
        if self.cancel.is_cancelled() {
            tracing::info!(session_id = %session_id, phase = phase.as_str(), "session cancelled before start");
            return Ok(PhaseEnd::Cancelled);
        }
        tracing::info!(
            session_id = %session_id,
            language = sandbox.language().id,
            backend = self.backend.name(),
            phase = phase.as_str(),
            "phase started"
        );

        // A process that exits while the timer or the cancellation fires
        // keeps its real exit status.
        let end = tokio::select! {
            biased;
            exit = self.backend.run(sandbox, phase, sink) => PhaseEnd::Exited(exit?),
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    session_id = %session_id,
                    phase = phase.as_str(),
                    timeout_ms = timeout.as_millis() as u64,
                    "phase timed out"
                );
                self.force_stop(sandbox).await;
                PhaseEnd::TimedOut
            }
            _ = self.cancel.cancelled() => {
                tracing::info!(session_id = %session_id, phase = phase.as_str(), "session cancelled");
                self.force_stop(sandbox).await;
                PhaseEnd::Cancelled
            }
        };

        if let PhaseEnd::Exited(code) = end {
            tracing::info!(
                session_id = %session_id,
                phase = phase.as_str(),
                exit_code = code,
                "phase finished"
            );
        }
        Ok(end)
    }

    async fn force_stop(&self, sandbox: &SandboxHandle) {
        if let Err(err) = self.backend.kill(sandbox).await {
            tracing::warn!(session_id = %sandbox.session_id(), error = %err, "failed to kill sandbox");
        }
    }
}

/// Relayed-output allowance shared by every phase of a session.
struct OutputBudget {
    remaining: AtomicUsize,
    exhausted: AtomicBool,
}

impl OutputBudget {
    fn new(limit: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(limit),
            exhausted: AtomicBool::new(false),
        }
    }

    /// How many of `wanted` bytes may still be relayed.
    fn take(&self, wanted: usize) -> usize {
        let mut granted = 0;
        let _ = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                granted = wanted.min(left);
                Some(left - granted)
            });
        granted
    }

    /// `true` exactly once, for whoever first overruns the budget.
    fn mark_exhausted(&self) -> bool {
        !self.exhausted.swap(true, Ordering::AcqRel)
    }
}

/// Turns raw chunks of one phase into events under that phase's scope.
struct PhaseSink<'a> {
    bus: &'a EventBus,
    session_id: &'a SessionId,
    scope: String,
    budget: &'a OutputBudget,
    /// Incomplete UTF-8 sequences held back per stream: stdout, stderr.
    pending: Mutex<[Vec<u8>; 2]>,
}

impl<'a> PhaseSink<'a> {
    fn new(
        bus: &'a EventBus,
        session_id: &'a SessionId,
        scope: String,
        budget: &'a OutputBudget,
    ) -> Self {
        Self {
            bus,
            session_id,
            scope,
            budget,
            pending: Mutex::new([Vec::new(), Vec::new()]),
        }
    }

    fn publish(&self, stream: StreamKind, text: String) {
        if text.is_empty() {
            return;
        }
        let event = match stream {
            StreamKind::Stdout => OutputEvent::stdout(&self.scope, text),
            StreamKind::Stderr => OutputEvent::stderr(&self.scope, text),
        };
        self.bus.publish(self.session_id, event);
    }

    /// Emits whatever is still held back, replacing broken sequences.
    fn flush(&self) {
        let pending = std::mem::take(&mut *lock(&self.pending));
        for (stream, bytes) in [StreamKind::Stdout, StreamKind::Stderr].into_iter().zip(pending) {
            self.publish(stream, String::from_utf8_lossy(&bytes).into_owned());
        }
    }
}

impl OutputSink for PhaseSink<'_> {
    fn emit(&self, stream: StreamKind, chunk: &[u8]) {
        let allowed = self.budget.take(chunk.len());
        if allowed > 0 {
            let text = {
                let mut pending = lock(&self.pending);
                let buffer = &mut pending[stream_index(stream)];
                buffer.extend_from_slice(&chunk[..allowed]);
                drain_utf8(buffer)
            };
            self.publish(stream, text);
        }
        if allowed < chunk.len() && self.budget.mark_exhausted() {
            tracing::info!(session_id = %self.session_id, "output limit reached");
            self.flush();
            self.publish(StreamKind::Stderr, TRUNCATION_NOTICE.to_string());
        }
    }
}

fn stream_index(stream: StreamKind) -> usize {
    match stream {
        StreamKind::Stdout => 0,
        StreamKind::Stderr => 1,
    }
}

/// Decodes the longest prefix of `pending` that is complete UTF-8, replacing
/// invalid bytes, and leaves a trailing partial character in place.
fn drain_utf8(pending: &mut Vec<u8>) -> String {
    let mut text = String::new();
    let mut start = 0;
    while start < pending.len() {
        match std::str::from_utf8(&pending[start..]) {
            Ok(valid) => {
                text.push_str(valid);
                start = pending.len();
            }
            Err(err) => {
                let end = start + err.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&pending[start..end]));
                match err.error_len() {
                    Some(len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        start = end + len;
                    }
                    None => {
                        start = end;
                        break;
                    }
                }
            }
        }
    }
    pending.drain(..start);
    text
}
