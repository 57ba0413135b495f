use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::engine::{
    accounting,
    bus::{EventBus, Subscription},
    config::EngineConfig,
    error::EngineError,
    events::{OutputEvent, StatusKind},
    lifecycle::SandboxRegistry,
    metrics::EngineMetrics,
    models::{ExecutionRequest, ExecutionSummary, LanguageInfo, ResourceUsage},
    runner::{RunOutcome, Runner, RunnerState},
    sandbox::{LanguageSpec, ProvisionRequest, SandboxBackend, SandboxFactory, language},
    session::Session,
    store::SummaryStore,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const SHUTDOWN_POLL: Duration = Duration::from_millis(20);

/// Entry point for callers: accepts requests and hands back the event stream
/// of the session started for each.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    backend: Arc<dyn SandboxBackend>,
    bus: EventBus,
    registry: SandboxRegistry,
    metrics: Arc<EngineMetrics>,
    store: SummaryStore,
    permits: Arc<Semaphore>,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig, backend: Arc<dyn SandboxBackend>) -> Self {
        let metrics = Arc::new(EngineMetrics::new());
        let registry = SandboxRegistry::new(backend.clone(), metrics.clone());
        let store = SummaryStore::new(config.summary_history, config.summaries_path.clone());
        let permits = Arc::new(Semaphore::new(config.max_concurrent_sessions.max(1)));
        Self {
            inner: Arc::new(EngineInner {
                config,
                backend,
                bus: EventBus::new(),
                registry,
                metrics,
                store,
                permits,
            }),
        }
    }

    pub fn from_config(config: EngineConfig) -> anyhow::Result<Self> {
        let backend = SandboxFactory::from_config(&config)?;
        Ok(Self::new(config, backend))
    }

    pub fn languages(&self) -> Vec<LanguageInfo> {
        language::catalog()
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.inner.metrics
    }

    pub fn summaries(&self) -> &SummaryStore {
        &self.inner.store
    }

    pub fn registry(&self) -> &SandboxRegistry {
        &self.inner.registry
    }

    /// Validates the request and starts its session. The returned
    /// subscription is attached before anything runs, so no event is lost;
    /// dropping it cancels the session.
    pub fn submit(&self, request: ExecutionRequest) -> Result<Subscription, EngineError> {
        let language = language::resolve(&request.language)?;
        validate(&self.inner.config, &request)?;

        let session = Session::new(language.id);
        let subscription = self.inner.bus.subscribe(&session.id);
        let cancel = self
            .inner
            .bus
            .cancellation(&session.id)
            .unwrap_or_default();

        self.inner.metrics.session_started();
        tracing::info!(
            session_id = %session.id,
            language = language.id,
            backend = self.inner.backend.name(),
            "session accepted"
        );

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run_session(session, language, request, cancel).await;
        });
        Ok(subscription)
    }

    /// Stops admitting sessions, cancels the running ones and tears down
    /// every live sandbox. Returns how many sandboxes were live.
    pub async fn shutdown(&self) -> usize {
        self.inner.permits.close();
        let live = self.inner.registry.active_count();
        self.inner.bus.cancel_all();

        // Cancelled sessions publish their own terminal event and clean up;
        // whatever is left after the grace period is removed here.
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.inner.registry.active_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
        let forced = self.inner.registry.shutdown().await;
        tracing::info!(live, forced, "execution engine shut down");
        live
    }
}

impl EngineInner {
    async fn run_session(
        self: Arc<Self>,
        session: Session,
        language: &'static LanguageSpec,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) {
        let _guard = self.registry.guard(session.id.clone(), self.bus.clone());
        let Some(_permit) = self.admit(&session, &request, &cancel).await else {
            return;
        };

        let provisioned = self
            .backend
            .provision(ProvisionRequest {
                session: &session,
                language,
                code: &request.code,
                stdin: &request.stdin,
            })
            .await;
        let sandbox = match provisioned {
            Ok(sandbox) => Arc::new(sandbox),
            Err(err) => {
                self.metrics.provisioning_failed();
                self.fail(&session, &request, err).await;
                return;
            }
        };
        tracing::info!(
            session_id = %session.id,
            sandbox = sandbox.name(),
            backend = self.backend.name(),
            "sandbox provisioned"
        );

        if let Err(err) = self.registry.register(sandbox.clone()) {
            if let Err(remove) = self.backend.remove(&sandbox).await {
                tracing::warn!(session_id = %session.id, error = %remove, "failed to remove unregistered sandbox");
            }
            self.fail(&session, &request, err).await;
            return;
        }

        let runner = Runner::new(self.backend.as_ref(), &self.bus, &self.config.limits, cancel);
        match runner.run(&sandbox).await {
            Ok(outcome) => {
                let usage = accounting::collect(
                    self.backend.as_ref(),
                    &sandbox,
                    session.started,
                    outcome.exited_at,
                )
                .await;
                self.registry.cleanup(&session.id).await;
                self.finish(&session, &request, outcome, usage).await;
            }
            Err(err) => {
                self.registry.cleanup(&session.id).await;
                self.fail(&session, &request, err).await;
            }
        }
    }

    /// Waits for a concurrency permit unless the subscriber leaves first.
    async fn admit(
        &self,
        session: &Session,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.fail(
                        session,
                        request,
                        EngineError::EnvironmentUnavailable("engine is shutting down".to_string()),
                    )
                    .await;
                    None
                }
            },
            _ = cancel.cancelled() => {
                tracing::info!(session_id = %session.id, "session cancelled while waiting for a sandbox slot");
                let reason = "cancelled".to_string();
                self.bus.publish(
                    &session.id,
                    OutputEvent::finished(session.id.as_str(), StatusKind::Terminated, Some(reason.clone()), None, None),
                );
                self.metrics.session_finished(RunnerState::Terminated);
                self.record(session, request, StatusKind::Terminated, Some(reason), None)
                    .await;
                None
            }
        }
    }

    async fn finish(
        &self,
        session: &Session,
        request: &ExecutionRequest,
        outcome: RunOutcome,
        usage: ResourceUsage,
    ) {
        tracing::info!(
            session_id = %session.id,
            language = %session.language,
            state = outcome.state.as_str(),
            reason = %outcome.termination.reason,
            exit_code = ?outcome.exit_code,
            exec_time_seconds = usage.exec_time_seconds,
            "session finished"
        );
        let event = OutputEvent::finished(
            session.id.as_str(),
            outcome.termination.kind,
            Some(outcome.termination.reason.clone()),
            outcome.exit_code,
            Some(usage.clone()),
        );
        self.bus.publish(&session.id, event);
        self.metrics.session_finished(outcome.state);
        self.record(
            session,
            request,
            outcome.termination.kind,
            Some(outcome.termination.reason),
            Some(usage),
        )
        .await;
    }

    /// Host-side failure: the detail goes to the log, the subscriber gets
    /// the sanitized message as the terminal event.
    async fn fail(&self, session: &Session, request: &ExecutionRequest, err: EngineError) {
        tracing::error!(
            session_id = %session.id,
            language = %session.language,
            backend = self.backend.name(),
            error = %err,
            "session failed"
        );
        let message = err.public_message();
        self.bus
            .publish(&session.id, OutputEvent::error(session.id.as_str(), message.clone()));
        self.metrics.session_failed();
        self.record(session, request, StatusKind::Error, Some(message), None)
            .await;
    }

    async fn record(
        &self,
        session: &Session,
        request: &ExecutionRequest,
        status: StatusKind,
        reason: Option<String>,
        usage: Option<ResourceUsage>,
    ) {
        self.store
            .record(ExecutionSummary {
                session_id: session.id.to_string(),
                language: session.language.clone(),
                code_snippet: ExecutionSummary::snippet(&request.code),
                status,
                reason,
                usage,
                finished_at: Utc::now(),
            })
            .await;
    }
}

fn validate(config: &EngineConfig, request: &ExecutionRequest) -> Result<(), EngineError> {
    if request.code.trim().is_empty() {
        return Err(EngineError::InvalidRequest("code is empty".to_string()));
    }
    if request.code.len() > config.max_code_bytes {
        return Err(EngineError::InvalidRequest("code too large".to_string()));
    }
    if request.stdin.len() > config.max_stdin_bytes {
        return Err(EngineError::InvalidRequest("stdin too large".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Arc, time::Duration};

    use super::ExecutionEngine;
    use crate::engine::{
        bus::Subscription,
        config::{EngineConfig, SandboxBackendKind},
        error::EngineError,
        events::{EventPayload, OutputEvent, StatusKind},
        models::ExecutionRequest,
        sandbox::{
            ActiveProcess, Phase,
            fake::{Calls, FakeBackend, PhaseScript},
            process::is_on_path,
        },
    };

    async fn collect(mut subscription: Subscription) -> Vec<OutputEvent> {
        tokio::time::timeout(Duration::from_secs(15), async move {
            let mut events = Vec::new();
            while let Some(event) = subscription.recv().await {
                events.push(event);
            }
            events
        })
        .await
        .expect("session never finished")
    }

    fn stdout_of(events: &[OutputEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match &event.payload {
                EventPayload::Stdout { data } => Some(data.as_str()),
                _ => None,
            })
            .collect()
    }

    fn terminal(events: &[OutputEvent]) -> &OutputEvent {
        let terminals: Vec<_> = events.iter().filter(|event| event.is_terminal()).collect();
        assert_eq!(terminals.len(), 1, "exactly one terminal event");
        let last = events.last().expect("at least one event");
        assert!(last.is_terminal(), "nothing may follow the terminal event");
        last
    }

    fn reason(event: &OutputEvent) -> Option<&str> {
        match &event.payload {
            EventPayload::Status { reason, .. } => reason.as_deref(),
            _ => None,
        }
    }

    fn is_empty_dir(path: &Path) -> bool {
        std::fs::read_dir(path).map(|mut dir| dir.next().is_none()).unwrap_or(true)
    }

    fn fake_engine(
        root: &Path,
        configure: impl FnOnce(FakeBackend) -> FakeBackend,
    ) -> (ExecutionEngine, Arc<FakeBackend>) {
        let backend = Arc::new(configure(FakeBackend::new(root)));
        let config = EngineConfig::with_root(SandboxBackendKind::Process, root.to_path_buf());
        (ExecutionEngine::new(config, backend.clone()), backend)
    }

    fn process_engine(root: &Path, configure: impl FnOnce(&mut EngineConfig)) -> ExecutionEngine {
        let mut config = EngineConfig::with_root(SandboxBackendKind::Process, root.to_path_buf());
        configure(&mut config);
        ExecutionEngine::from_config(config).unwrap()
    }

    async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn unsupported_language_never_provisions() {
        let root = tempfile::tempdir().unwrap();
        let (engine, backend) = fake_engine(root.path(), |fake| fake);

        let err = engine
            .submit(ExecutionRequest::new("print(1)", "brainfuck", ""))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::UnsupportedLanguage(_)));
        assert_eq!(Calls::get(&backend.calls.provision), 0);
        assert!(is_empty_dir(root.path()));
    }

    #[tokio::test]
    async fn rejects_invalid_requests_before_provisioning() {
        let root = tempfile::tempdir().unwrap();
        let (engine, backend) = fake_engine(root.path(), |fake| fake);

        let empty = engine.submit(ExecutionRequest::new("  \n", "python", "")).err();
        assert!(matches!(empty, Some(EngineError::InvalidRequest(_))));

        let huge = "x".repeat(300_000);
        let too_big = engine.submit(ExecutionRequest::new(huge, "python", "")).err();
        assert!(matches!(too_big, Some(EngineError::InvalidRequest(_))));
        assert_eq!(Calls::get(&backend.calls.provision), 0);
    }

    #[tokio::test]
    async fn emits_exactly_one_terminal_event_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let (engine, backend) = fake_engine(root.path(), |fake| {
            fake.with_phase(Phase::Run, PhaseScript::exits(0).stdout("hi\n").stderr("warn\n"))
        });

        let subscription = engine
            .submit(ExecutionRequest::new("print('hi')", "python", ""))
            .unwrap();
        let session_id = subscription.session_id().clone();
        let events = collect(subscription).await;

        let last = terminal(&events);
        assert_eq!(last.status_kind(), Some(StatusKind::Completed));
        assert_eq!(reason(last), Some("completed"));
        match &last.payload {
            EventPayload::Status { usage, exit_code, .. } => {
                let usage = usage.as_ref().expect("usage attached");
                assert_eq!(usage.cpu_usage_percent, Some(25.0));
                assert_eq!(usage.memory_usage_mb, Some(4.0));
                assert_eq!(*exit_code, Some(0));
            }
            other => panic!("unexpected terminal payload: {other:?}"),
        }
        assert_eq!(stdout_of(&events), "hi\n");
        assert!(events.iter().all(|event| event.scope == session_id.as_str()));

        assert_eq!(Calls::get(&backend.calls.remove), 1);
        assert_eq!(engine.registry().active_count(), 0);
        assert!(is_empty_dir(root.path()));
        assert_eq!(engine.metrics().active_sandboxes(), 0);

        wait_until("summary", || engine.summaries().find(session_id.as_str()).is_some()).await;
        let summary = engine.summaries().find(session_id.as_str()).unwrap();
        assert_eq!(summary.status, StatusKind::Completed);
        assert_eq!(summary.code_snippet, "print('hi')");
    }

    #[tokio::test]
    async fn host_failures_are_sanitized() {
        let root = tempfile::tempdir().unwrap();
        let (engine, _backend) = fake_engine(root.path(), |fake| {
            fake.failing_provision(EngineError::EnvironmentUnavailable(
                "image python:3.12-alpine missing on /var/run/docker.sock".to_string(),
            ))
        });

        let events = collect(
            engine
                .submit(ExecutionRequest::new("print(1)", "python", ""))
                .unwrap(),
        )
        .await;
        let last = terminal(&events);
        match &last.payload {
            EventPayload::Error { data } => {
                assert_eq!(data, "Execution environment is not available");
            }
            other => panic!("unexpected terminal payload: {other:?}"),
        }
        assert!(engine
            .metrics()
            .render_prometheus()
            .contains("sandbox_provisioning_failures_total 1\n"));
    }

    #[tokio::test]
    async fn waiting_sessions_start_when_a_slot_frees_up() {
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(
            FakeBackend::new(root.path()).with_phase(Phase::Run, PhaseScript::hangs()),
        );
        let mut config = EngineConfig::with_root(SandboxBackendKind::Process, root.path().to_path_buf());
        config.max_concurrent_sessions = 1;
        let engine = ExecutionEngine::new(config, backend.clone());

        let first = engine.submit(ExecutionRequest::new("a", "python", "")).unwrap();
        wait_until("first provision", || Calls::get(&backend.calls.provision) == 1).await;
        let second = engine.submit(ExecutionRequest::new("b", "python", "")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(Calls::get(&backend.calls.provision), 1);

        drop(first);
        wait_until("second provision", || Calls::get(&backend.calls.provision) == 2).await;

        drop(second);
        wait_until("teardown", || Calls::get(&backend.calls.remove) == 2).await;
        wait_until("registry drained", || engine.registry().active_count() == 0).await;
    }

    #[tokio::test]
    async fn shell_program_reads_stdin_to_eof() {
        let root = tempfile::tempdir().unwrap();
        let engine = process_engine(root.path(), |_| {});

        let code = "while read line; do echo \"got $line\"; done\necho done >&2\n";
        let events = collect(
            engine
                .submit(ExecutionRequest::new(code, "shell", "1\n2\n"))
                .unwrap(),
        )
        .await;

        assert_eq!(stdout_of(&events), "got 1\ngot 2\n");
        let last = terminal(&events);
        assert_eq!(last.status_kind(), Some(StatusKind::Completed));
        match &last.payload {
            EventPayload::Status { usage: Some(usage), .. } => assert!(usage.exec_time_seconds > 0.0),
            other => panic!("unexpected terminal payload: {other:?}"),
        }
        assert!(is_empty_dir(root.path()));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_runtime_error() {
        let root = tempfile::tempdir().unwrap();
        let engine = process_engine(root.path(), |_| {});

        let events = collect(
            engine
                .submit(ExecutionRequest::new("echo boom >&2\nexit 3\n", "shell", ""))
                .unwrap(),
        )
        .await;
        let last = terminal(&events);
        assert_eq!(last.status_kind(), Some(StatusKind::Error));
        assert_eq!(reason(last), Some("terminated with exit code 3"));
    }

    #[tokio::test]
    async fn runaway_program_is_terminated_and_removed() {
        let root = tempfile::tempdir().unwrap();
        let engine = process_engine(root.path(), |config| config.limits.run_timeout_ms = 300);

        let events = collect(
            engine
                .submit(ExecutionRequest::new("while :; do :; done\n", "shell", ""))
                .unwrap(),
        )
        .await;
        let last = terminal(&events);
        assert_eq!(last.status_kind(), Some(StatusKind::Terminated));
        assert_eq!(reason(last), Some("execution timeout"));
        assert!(is_empty_dir(root.path()));
        assert_eq!(engine.registry().active_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_kills_the_running_program() {
        let root = tempfile::tempdir().unwrap();
        let engine = process_engine(root.path(), |config| config.limits.run_timeout_ms = 60_000);

        let mut subscription = engine
            .submit(ExecutionRequest::new("echo started\nwhile :; do :; done\n", "shell", ""))
            .unwrap();
        let session_id = subscription.session_id().clone();
        loop {
            let event = subscription.recv().await.expect("stream ended early");
            if matches!(event.payload, EventPayload::Stdout { .. }) {
                break;
            }
        }
        let Some(ActiveProcess::ProcessGroup(pid)) =
            engine.registry().get(&session_id).and_then(|sandbox| sandbox.active())
        else {
            panic!("program is not running");
        };

        drop(subscription);

        wait_until("process exit", || process_gone(pid)).await;
        wait_until("cleanup", || engine.registry().active_count() == 0).await;
        wait_until("workspace removal", || is_empty_dir(root.path())).await;
    }

    fn process_gone(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                .unwrap_or(true),
            Err(_) => true,
        }
    }

    #[tokio::test]
    async fn python_hello_round_trip() {
        if !is_on_path("python3") {
            return;
        }
        let root = tempfile::tempdir().unwrap();
        let engine = process_engine(root.path(), |_| {});

        let events = collect(
            engine
                .submit(ExecutionRequest::new("print(\"hi\")", "python", ""))
                .unwrap(),
        )
        .await;
        let outputs: Vec<_> = events
            .iter()
            .filter(|event| matches!(event.payload, EventPayload::Stdout { .. } | EventPayload::Stderr { .. }))
            .collect();
        assert_eq!(outputs.len(), 1, "unexpected output events: {outputs:?}");
        assert_eq!(outputs[0].payload, EventPayload::Stdout { data: "hi\n".to_string() });
        let last = terminal(&events);
        assert_eq!(last.status_kind(), Some(StatusKind::Completed));
    }

    async fn assert_prints_hi(language_id: &str, code: &str) {
        let root = tempfile::tempdir().unwrap();
        let engine = process_engine(root.path(), |config| {
            config.limits.compile_timeout_ms = 60_000;
            config.limits.run_timeout_ms = 30_000;
        });

        let events = collect(
            engine
                .submit(ExecutionRequest::new(code, language_id, ""))
                .unwrap(),
        )
        .await;
        let last = terminal(&events);
        assert_eq!(
            last.status_kind(),
            Some(StatusKind::Completed),
            "{language_id} did not complete: {events:?}"
        );
        assert_eq!(stdout_of(&events), "hi\n");
        assert!(is_empty_dir(root.path()));
    }

    #[tokio::test]
    async fn javascript_runs_within_the_memory_limit() {
        if !is_on_path("node") {
            return;
        }
        assert_prints_hi("javascript", "console.log('hi')\n").await;
    }

    #[tokio::test]
    async fn java_compiles_and_runs_within_the_memory_limit() {
        if !is_on_path("javac") || !is_on_path("java") {
            return;
        }
        let code = "public class Main {\n    public static void main(String[] args) {\n        System.out.println(\"hi\");\n    }\n}\n";
        assert_prints_hi("java", code).await;
    }

    #[tokio::test]
    async fn background_child_does_not_hold_the_session_open() {
        let root = tempfile::tempdir().unwrap();
        let engine = process_engine(root.path(), |config| config.limits.run_timeout_ms = 3_000);

        let events = collect(
            engine
                .submit(ExecutionRequest::new("sleep 30 &\necho hi\nexit 0\n", "shell", ""))
                .unwrap(),
        )
        .await;
        let last = terminal(&events);
        assert_eq!(last.status_kind(), Some(StatusKind::Completed));
        assert_eq!(reason(last), Some("completed"));
        assert_eq!(stdout_of(&events), "hi\n");
        assert!(is_empty_dir(root.path()));
    }

    #[tokio::test]
    async fn backend_panic_still_ends_the_stream_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let (engine, backend) = fake_engine(root.path(), |fake| {
            fake.with_phase(Phase::Run, PhaseScript::exits(0).stdout("partial\n").panics())
        });

        let events = collect(
            engine
                .submit(ExecutionRequest::new("print(1)", "python", ""))
                .unwrap(),
        )
        .await;
        let last = terminal(&events);
        match &last.payload {
            EventPayload::Error { data } => assert_eq!(data, "Internal server error"),
            other => panic!("unexpected terminal payload: {other:?}"),
        }
        assert_eq!(stdout_of(&events), "partial\n");

        wait_until("cleanup", || Calls::get(&backend.calls.remove) == 1).await;
        assert_eq!(engine.registry().active_count(), 0);
        assert!(is_empty_dir(root.path()));
        assert!(engine
            .metrics()
            .render_prometheus()
            .contains("sandbox_active 0\n"));
    }

    #[tokio::test]
    async fn shutdown_cancels_live_sessions() {
        let root = tempfile::tempdir().unwrap();
        let (engine, backend) = fake_engine(root.path(), |fake| {
            fake.with_phase(Phase::Run, PhaseScript::hangs())
        });
        let subscription = engine.submit(ExecutionRequest::new("x", "python", "")).unwrap();
        wait_until("provision", || engine.registry().active_count() == 1).await;

        assert_eq!(engine.shutdown().await, 1);
        assert_eq!(engine.registry().active_count(), 0);
        wait_until("removal", || Calls::get(&backend.calls.remove) == 1).await;

        let events = collect(subscription).await;
        let last = terminal(&events);
        assert_eq!(last.status_kind(), Some(StatusKind::Terminated));
        assert_eq!(reason(last), Some("cancelled"));

        let late = engine.submit(ExecutionRequest::new("y", "python", "")).unwrap();
        match &terminal(&collect(late).await).payload {
            EventPayload::Error { data } => assert_eq!(data, "Execution environment is not available"),
            other => panic!("unexpected terminal payload: {other:?}"),
        }
    }
}
