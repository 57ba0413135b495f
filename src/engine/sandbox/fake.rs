//! Scriptable in-memory backend for exercising the session state machine
//! without a container runtime.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::engine::{
    accounting::{ContainerExitCodes, CpuReading, ExitCodeTable},
    error::EngineError,
    sandbox::{
        ActiveProcess, OutputSink, Phase, PhasePlan, ProvisionRequest, SandboxBackend,
        SandboxHandle, StreamKind, Workspace, lock,
    },
    session::SessionId,
};

#[derive(Debug, Clone)]
pub enum Step {
    Out(StreamKind, Vec<u8>),
    /// Simulates a bug in the backend.
    Panic,
}

/// What one phase does when run.
#[derive(Debug, Clone)]
pub struct PhaseScript {
    pub steps: Vec<Step>,
    /// `None` blocks until killed.
    pub exit_code: Option<i64>,
}

impl PhaseScript {
    pub fn exits(exit_code: i64) -> Self {
        Self {
            steps: Vec::new(),
            exit_code: Some(exit_code),
        }
    }

    pub fn hangs() -> Self {
        Self {
            steps: Vec::new(),
            exit_code: None,
        }
    }

    pub fn stdout(mut self, text: impl AsRef<[u8]>) -> Self {
        self.steps.push(Step::Out(StreamKind::Stdout, text.as_ref().to_vec()));
        self
    }

    pub fn stderr(mut self, text: impl AsRef<[u8]>) -> Self {
        self.steps.push(Step::Out(StreamKind::Stderr, text.as_ref().to_vec()));
        self
    }

    pub fn panics(mut self) -> Self {
        self.steps.push(Step::Panic);
        self
    }
}

#[derive(Default)]
pub struct Calls {
    pub provision: AtomicUsize,
    pub compile: AtomicUsize,
    pub run: AtomicUsize,
    pub kill: AtomicUsize,
    pub remove: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct FakeBackend {
    root: PathBuf,
    scripts: HashMap<Phase, PhaseScript>,
    provision_error: Option<EngineError>,
    pub calls: Arc<Calls>,
    kills: DashMap<SessionId, CancellationToken>,
}

impl FakeBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            scripts: HashMap::from([(Phase::Run, PhaseScript::exits(0))]),
            provision_error: None,
            calls: Arc::new(Calls::default()),
            kills: DashMap::new(),
        }
    }

    pub fn with_phase(mut self, phase: Phase, script: PhaseScript) -> Self {
        self.scripts.insert(phase, script);
        self
    }

    pub fn failing_provision(mut self, error: EngineError) -> Self {
        self.provision_error = Some(error);
        self
    }

    fn kill_signal(&self, session_id: &SessionId) -> CancellationToken {
        self.kills.entry(session_id.clone()).or_default().clone()
    }
}

#[async_trait]
impl SandboxBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn provision(&self, request: ProvisionRequest<'_>) -> Result<SandboxHandle, EngineError> {
        self.calls.provision.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.provision_error {
            return Err(err.clone());
        }

        let name = format!("fake-{}", request.session.id);
        let workspace = Workspace::create(
            &self.root,
            &name,
            request.language,
            request.code,
            request.stdin,
            None,
        )
        .await?;
        let source = workspace.source().to_path_buf();
        let plan = |command| PhasePlan {
            command,
            container_id: None,
        };
        let compile = if request.language.needs_compilation() || self.scripts.contains_key(&Phase::Compile) {
            request
                .language
                .compile_command(&source)
                .or_else(|| Some(request.language.run_command(&source)))
                .map(plan)
        } else {
            None
        };
        let run = plan(request.language.run_command(&source));

        Ok(SandboxHandle::new(
            request.session.id.clone(),
            name,
            request.language,
            workspace,
            compile,
            run,
        ))
    }

    async fn run(
        &self,
        sandbox: &SandboxHandle,
        phase: Phase,
        output: &dyn OutputSink,
    ) -> Result<i64, EngineError> {
        match phase {
            Phase::Compile => self.calls.compile.fetch_add(1, Ordering::SeqCst),
            Phase::Run => self.calls.run.fetch_add(1, Ordering::SeqCst),
        };
        let script = self
            .scripts
            .get(&phase)
            .cloned()
            .unwrap_or_else(|| PhaseScript::exits(0));

        let killed = self.kill_signal(sandbox.session_id());
        sandbox.set_active(Some(ActiveProcess::ProcessGroup(0)));
        {
            // Compiling reads as 90% CPU and 64 MiB, running as 25% and 4 MiB.
            let (start, end, memory) = match phase {
                Phase::Compile => ((1000, 1000), (1090, 1100), 64 * 1024 * 1024),
                Phase::Run => ((0, 0), (25, 100), 4 * 1024 * 1024),
            };
            let tracker = sandbox.usage_tracker();
            let mut usage = lock(&tracker);
            usage.observe_cpu(CpuReading { cpu_total: start.0, system_total: start.1 });
            usage.observe_cpu(CpuReading { cpu_total: end.0, system_total: end.1 });
            usage.observe_memory(memory);
        }

        for step in script.steps {
            match step {
                Step::Out(stream, bytes) => output.emit(stream, &bytes),
                Step::Panic => panic!("scripted backend failure"),
            }
        }

        let exit = match script.exit_code {
            Some(code) => code,
            None => {
                killed.cancelled().await;
                137
            }
        };
        sandbox.set_active(None);
        Ok(exit)
    }

    async fn kill(&self, sandbox: &SandboxHandle) -> Result<(), EngineError> {
        self.calls.kill.fetch_add(1, Ordering::SeqCst);
        self.kill_signal(sandbox.session_id()).cancel();
        Ok(())
    }

    async fn remove(&self, sandbox: &SandboxHandle) -> Result<(), EngineError> {
        let removed = sandbox
            .workspace()
            .remove()
            .await
            .map_err(|err| EngineError::Internal(err.to_string()));
        self.calls.remove.fetch_add(1, Ordering::SeqCst);
        removed
    }

    fn exit_codes(&self) -> &dyn ExitCodeTable {
        &ContainerExitCodes
    }
}

/// Records every chunk a backend emits.
#[derive(Default)]
pub struct CollectingSink {
    chunks: Mutex<Vec<(StreamKind, Vec<u8>)>>,
}

impl CollectingSink {
    fn text(&self, wanted: StreamKind) -> String {
        let bytes: Vec<u8> = lock(&self.chunks)
            .iter()
            .filter(|(stream, _)| *stream == wanted)
            .flat_map(|(_, chunk)| chunk.iter().copied())
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn stdout(&self) -> String {
        self.text(StreamKind::Stdout)
    }

    pub fn stderr(&self) -> String {
        self.text(StreamKind::Stderr)
    }
}

impl OutputSink for CollectingSink {
    fn emit(&self, stream: StreamKind, chunk: &[u8]) {
        lock(&self.chunks).push((stream, chunk.to_vec()));
    }
}
