pub mod docker;
pub mod language;
pub mod process;
mod procfs;
pub mod workspace;

#[cfg(test)]
pub(crate) mod fake;

use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;

use crate::engine::{
    accounting::{ExitCodeTable, UsageTracker},
    config::{EngineConfig, SandboxBackendKind},
    error::EngineError,
    session::{Session, SessionId},
};

pub use docker::DockerSandbox;
pub use language::{CommandLine, LanguageSpec};
pub use process::ProcessSandbox;
pub use workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Compile,
    Run,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compile => "compile",
            Self::Run => "run",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Where a backend pushes raw output chunks as they arrive.
pub trait OutputSink: Send + Sync {
    fn emit(&self, stream: StreamKind, chunk: &[u8]);
}

pub struct ProvisionRequest<'a> {
    pub session: &'a Session,
    pub language: &'static LanguageSpec,
    pub code: &'a str,
    pub stdin: &'a str,
}

/// What `kill` has to hit right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveProcess {
    Container(String),
    ProcessGroup(i32),
}

/// A prepared phase: the command and, for container backends, the created
/// but not yet started container.
#[derive(Debug, Clone)]
pub struct PhasePlan {
    pub command: CommandLine,
    pub container_id: Option<String>,
}

/// An isolated execution context owned by exactly one session.
#[derive(Debug)]
pub struct SandboxHandle {
    session_id: SessionId,
    name: String,
    language: &'static LanguageSpec,
    workspace: Workspace,
    compile: Option<PhasePlan>,
    run: PhasePlan,
    active: Mutex<Option<ActiveProcess>>,
    usage: Arc<Mutex<UsageTracker>>,
    torn_down: AtomicBool,
}

impl SandboxHandle {
    pub fn new(
        session_id: SessionId,
        name: String,
        language: &'static LanguageSpec,
        workspace: Workspace,
        compile: Option<PhasePlan>,
        run: PhasePlan,
    ) -> Self {
        Self {
            session_id,
            name,
            language,
            workspace,
            compile,
            run,
            active: Mutex::new(None),
            usage: Arc::new(Mutex::new(UsageTracker::default())),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn language(&self) -> &'static LanguageSpec {
        self.language
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhasePlan> {
        match phase {
            Phase::Compile => self.compile.as_ref(),
            Phase::Run => Some(&self.run),
        }
    }

    pub fn phases(&self) -> impl Iterator<Item = &PhasePlan> {
        self.compile.iter().chain(std::iter::once(&self.run))
    }

    pub fn set_active(&self, active: Option<ActiveProcess>) {
        *lock(&self.active) = active;
    }

    pub fn active(&self) -> Option<ActiveProcess> {
        lock(&self.active).clone()
    }

    pub fn usage_tracker(&self) -> Arc<Mutex<UsageTracker>> {
        self.usage.clone()
    }

    /// Drops samples from an earlier phase so usage reflects one phase only.
    pub fn reset_usage(&self) {
        *lock(&self.usage) = UsageTracker::default();
    }

    /// Samples gathered so far, or `None` if nothing was ever observed.
    pub fn usage_snapshot(&self) -> Option<UsageTracker> {
        let tracker = lock(&self.usage);
        (!tracker.is_empty()).then(|| tracker.clone())
    }

    /// `true` for the first caller only.
    pub fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Isolation technology behind the session state machine.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Materializes the sandbox without starting anything in it. Partial
    /// state is removed before an error is returned.
    async fn provision(&self, request: ProvisionRequest<'_>) -> Result<SandboxHandle, EngineError>;

    /// Runs one phase to completion, streaming output into `output`, and
    /// returns its exit code. Dropping the future abandons the wait only;
    /// `kill` stops the process.
    async fn run(
        &self,
        sandbox: &SandboxHandle,
        phase: Phase,
        output: &dyn OutputSink,
    ) -> Result<i64, EngineError>;

    /// Force-stops whatever is running in the sandbox. No-op when idle.
    async fn kill(&self, sandbox: &SandboxHandle) -> Result<(), EngineError>;

    async fn collect_usage(&self, sandbox: &SandboxHandle) -> Option<UsageTracker> {
        sandbox.usage_snapshot()
    }

    /// Deletes the sandbox object and its files. Safe to repeat.
    async fn remove(&self, sandbox: &SandboxHandle) -> Result<(), EngineError>;

    fn exit_codes(&self) -> &dyn ExitCodeTable;
}

pub struct SandboxFactory;

impl SandboxFactory {
    pub fn from_config(config: &EngineConfig) -> anyhow::Result<Arc<dyn SandboxBackend>> {
        match config.sandbox_backend {
            SandboxBackendKind::Docker => Ok(Arc::new(DockerSandbox::new(config)?)),
            SandboxBackendKind::Process => Ok(Arc::new(ProcessSandbox::new(config)?)),
        }
    }
}
