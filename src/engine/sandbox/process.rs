use std::{
    env,
    ffi::OsString,
    os::unix::{fs::PermissionsExt, process::ExitStatusExt},
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{io::AsyncReadExt, process::Command};

use crate::engine::{
    accounting::{ExitCodeTable, SignalExitCodes},
    config::EngineConfig,
    error::EngineError,
    models::SandboxLimits,
    session::random_token,
    sandbox::{
        ActiveProcess, OutputSink, Phase, PhasePlan, ProvisionRequest, SandboxBackend,
        SandboxHandle, StreamKind, Workspace, procfs, workspace::Owner,
    },
};

const READ_CHUNK: usize = 4096;
/// How long output may keep flowing after the phase's main process exits.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Runs sandboxes as rlimit-bounded process groups on the host. Each phase
/// becomes a new session leader so the whole tree can be killed at once.
/// There is no network or filesystem isolation beyond the private
/// directory; intended for development hosts without a container runtime.
/// When the engine itself runs as root, user code is switched to the
/// configured sandbox user before exec.
pub struct ProcessSandbox {
    root: PathBuf,
    limits: SandboxLimits,
    search_path: OsString,
    owner: Option<Owner>,
}

impl ProcessSandbox {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let owner = if is_privileged() {
            let owner = Owner::parse(&config.sandbox_user).ok_or_else(|| {
                EngineError::EnvironmentUnavailable(format!(
                    "sandbox user {:?} must be numeric uid[:gid] when running as root",
                    config.sandbox_user
                ))
            })?;
            if owner.uid == 0 || owner.gid == 0 {
                return Err(EngineError::EnvironmentUnavailable(
                    "sandbox user must not be root".to_string(),
                ));
            }
            Some(owner)
        } else {
            None
        };
        Ok(Self {
            root: config.sandbox_root.clone(),
            limits: config.limits.clone(),
            search_path: env::var_os("PATH").unwrap_or_else(|| "/usr/local/bin:/usr/bin:/bin".into()),
            owner,
        })
    }

    fn find_program(&self, program: &str) -> Option<PathBuf> {
        env::split_paths(&self.search_path)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    }

    fn command(&self, sandbox: &SandboxHandle, plan: &PhasePlan, phase: Phase) -> Result<Command, EngineError> {
        let workspace = sandbox.workspace();
        let stdin = match phase {
            Phase::Compile => Stdio::null(),
            Phase::Run => std::fs::File::open(workspace.stdin())
                .map(Stdio::from)
                .map_err(|err| EngineError::Internal(format!("open stdin file: {err}")))?,
        };

        let mut cmd = Command::new(&plan.command.program);
        cmd.args(&plan.command.args)
            .current_dir(workspace.dir())
            .env_clear()
            .env("PATH", &self.search_path)
            .env("HOME", workspace.dir())
            .env("TMPDIR", workspace.dir())
            .env("LANG", "C.UTF-8")
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        confine(&mut cmd, &self.limits, phase, self.owner);
        Ok(cmd)
    }
}

#[async_trait]
impl SandboxBackend for ProcessSandbox {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn provision(&self, request: ProvisionRequest<'_>) -> Result<SandboxHandle, EngineError> {
        let language = request.language;
        for program in language.toolchain() {
            if self.find_program(&program).is_none() {
                return Err(EngineError::EnvironmentUnavailable(format!(
                    "{program} not found on PATH for {}",
                    language.id
                )));
            }
        }

        let name = format!("sbx-{}", random_token());
        let workspace = Workspace::create(
            &self.root,
            &name,
            language,
            request.code,
            request.stdin,
            self.owner,
        )
        .await?;
        if self.owner.is_some() {
            if let Err(err) = open_for_traversal(&self.root).await {
                workspace.discard().await;
                return Err(err);
            }
        }

        let source = workspace.source().to_path_buf();
        let compile = language.compile_command(&source).map(|command| PhasePlan {
            command,
            container_id: None,
        });
        let run = PhasePlan {
            command: language.run_command(&source),
            container_id: None,
        };

        Ok(SandboxHandle::new(
            request.session.id.clone(),
            name,
            language,
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
        let plan = sandbox
            .phase(phase)
            .ok_or_else(|| EngineError::Internal(format!("no {} phase prepared", phase.as_str())))?;

        let mut child = self
            .command(sandbox, plan, phase)?
            .spawn()
            .map_err(|err| EngineError::Internal(format!("spawn {}: {err}", plan.command.program)))?;

        let child_pgid = child.id().map(|pid| pid as i32);
        let sampler = child.id().map(|pid| {
            sandbox.set_active(Some(ActiveProcess::ProcessGroup(pid as i32)));
            tokio::spawn(procfs::sample_until_exit(pid, sandbox.usage_tracker()))
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Internal("missing stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Internal("missing stderr pipe".to_string()))?;

        let forward = async {
            tokio::join!(
                pump(stdout, StreamKind::Stdout, output),
                pump(stderr, StreamKind::Stderr, output),
            );
        };
        tokio::pin!(forward);

        let mut drained = false;
        let status = tokio::select! {
            status = child.wait() => status,
            () = &mut forward => {
                drained = true;
                child.wait().await
            }
        };

        // Background children may still hold the pipes; the phase ends with
        // its main process.
        if let Some(pgid) = child_pgid {
            if let Err(err) = kill_group(pgid) {
                tracing::warn!(session_id = %sandbox.session_id(), pgid, error = %err, "failed to reap process group");
            }
        }
        if !drained && tokio::time::timeout(DRAIN_GRACE, &mut forward).await.is_err() {
            tracing::debug!(session_id = %sandbox.session_id(), "output pipes still open after exit");
        }

        if let Some(sampler) = sampler {
            sampler.abort();
        }
        sandbox.set_active(None);

        let status = status.map_err(|err| EngineError::Internal(format!("wait for child: {err}")))?;
        Ok(match (status.code(), status.signal()) {
            (Some(code), _) => code as i64,
            (None, Some(signo)) => 128 + signo as i64,
            (None, None) => -1,
        })
    }

    async fn kill(&self, sandbox: &SandboxHandle) -> Result<(), EngineError> {
        if let Some(ActiveProcess::ProcessGroup(pgid)) = sandbox.active() {
            kill_group(pgid)
                .map_err(|err| EngineError::Internal(format!("kill process group {pgid}: {err}")))?;
            tracing::debug!(session_id = %sandbox.session_id(), pgid, "process group killed");
        }
        Ok(())
    }

    async fn remove(&self, sandbox: &SandboxHandle) -> Result<(), EngineError> {
        sandbox
            .workspace()
            .remove()
            .await
            .map_err(|err| EngineError::Internal(format!("remove workspace: {err}")))
    }

    fn exit_codes(&self) -> &dyn ExitCodeTable {
        &SignalExitCodes
    }
}

/// Forwards a pipe chunk by chunk until EOF.
async fn pump<R>(mut reader: R, stream: StreamKind, output: &dyn OutputSink)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => output.emit(stream, &chunk[..n]),
        }
    }
}

/// SIGKILLs every process in the group led by `pgid`. An empty group is fine.
fn kill_group(pgid: i32) -> std::io::Result<()> {
    // SAFETY: kill(2) with a negative pid signals the process group created
    // by setsid() in the child; no memory is shared.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// The sandbox user must be able to reach its workspace below the root.
async fn open_for_traversal(root: &Path) -> Result<(), EngineError> {
    let failed = |err: std::io::Error| {
        EngineError::ProvisioningFailed(format!("open sandbox root {}: {err}", root.display()))
    };
    let mode = tokio::fs::metadata(root).await.map_err(failed)?.permissions().mode();
    if mode & 0o001 == 0 {
        tokio::fs::set_permissions(root, std::fs::Permissions::from_mode(mode | 0o111))
            .await
            .map_err(failed)?;
    }
    Ok(())
}

pub(crate) fn is_privileged() -> bool {
    // SAFETY: geteuid(2) has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Session, rlimits and identity for the child, applied between fork and exec.
fn confine(cmd: &mut Command, limits: &SandboxLimits, phase: Phase, owner: Option<Owner>) {
    let memory = limits.memory_bytes() as libc::rlim_t;
    let timeout_ms = match phase {
        Phase::Compile => limits.compile_timeout_ms,
        Phase::Run => limits.run_timeout_ms,
    };
    // Backstop only; the runner's wall-clock timer fires first.
    let cpu_seconds = (timeout_ms / 1000 + 1) as libc::rlim_t;
    let processes = limits.max_processes as libc::rlim_t;
    let file_size = (64 * 1024 * 1024) as libc::rlim_t;

    // SAFETY: runs between fork and exec in the child and only calls the
    // async-signal-safe setsid, setrlimit, setgroups, setgid and setuid with
    // values captured by copy.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            // RLIMIT_DATA bounds committed writable memory. Address space
            // limits would also count the large PROT_NONE reservations that
            // JIT runtimes make up front.
            set_rlimit(libc::RLIMIT_DATA, memory)?;
            set_rlimit(libc::RLIMIT_CPU, cpu_seconds)?;
            set_rlimit(libc::RLIMIT_NPROC, processes)?;
            set_rlimit(libc::RLIMIT_FSIZE, file_size)?;
            set_rlimit(libc::RLIMIT_CORE, 0)?;
            if let Some(owner) = owner {
                // Supplementary groups first; both must go before the uid.
                if libc::setgroups(0, std::ptr::null()) == -1
                    || libc::setgid(owner.gid) == -1
                    || libc::setuid(owner.uid) == -1
                {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type Resource = libc::c_int;

fn set_rlimit(resource: Resource, value: libc::rlim_t) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    // SAFETY: `limit` is a valid, initialized rlimit for the duration of the call.
    if unsafe { libc::setrlimit(resource, &limit) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
pub(crate) fn is_on_path(program: &str) -> bool {
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}
