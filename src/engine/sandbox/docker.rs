use std::{collections::HashMap, path::Path};

use async_trait::async_trait;
use bollard::{
    Docker,
    container::LogOutput,
    errors::Error as DockerError,
    models::{ContainerCreateBody, ContainerStatsResponse, HostConfig},
    query_parameters::{
        AttachContainerOptions, CreateContainerOptions, KillContainerOptions,
        RemoveContainerOptions, StartContainerOptions, StatsOptions, WaitContainerOptions,
    },
};
use futures_util::StreamExt;

use crate::engine::{
    accounting::{ContainerExitCodes, CpuReading, ExitCodeTable, UsageTracker},
    config::EngineConfig,
    error::EngineError,
    models::SandboxLimits,
    session::random_token,
    sandbox::{
        ActiveProcess, CommandLine, LanguageSpec, OutputSink, Phase, PhasePlan, ProvisionRequest,
        SandboxBackend, SandboxHandle, StreamKind, Workspace, lock, workspace::Owner,
        workspace::STDIN_FILE,
    },
};

const CONTAINER_DIR: &str = "/sandbox";

/// One container per phase over a shared bind-mounted workspace. Containers
/// are created at provision time and started by `run`.
pub struct DockerSandbox {
    docker: Docker,
    root: std::path::PathBuf,
    user: String,
    owner: Option<Owner>,
    limits: SandboxLimits,
    images: HashMap<String, String>,
}

impl DockerSandbox {
    pub fn new(config: &EngineConfig) -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            root: config.sandbox_root.clone(),
            user: config.sandbox_user.clone(),
            owner: Owner::parse(&config.sandbox_user),
            limits: config.limits.clone(),
            images: config.language_images.clone(),
        })
    }

    fn image_for(&self, language: &LanguageSpec) -> String {
        self.images
            .get(language.id)
            .cloned()
            .unwrap_or_else(|| language.image.to_string())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), EngineError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Err(EngineError::EnvironmentUnavailable(format!(
                "image {image} is not present"
            ))),
            Err(err) => Err(EngineError::EnvironmentUnavailable(format!(
                "inspect image {image}: {err}"
            ))),
        }
    }

    fn container_body(
        &self,
        image: &str,
        workspace: &Workspace,
        phase: Phase,
        command: &CommandLine,
    ) -> ContainerCreateBody {
        let (cmd, bind_mode) = match phase {
            // The compiler writes its artifact next to the source.
            Phase::Compile => (command.argv(), "rw"),
            Phase::Run => {
                // Stdin comes from the companion file so EOF is deterministic.
                let mut cmd = vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("exec \"$@\" < {CONTAINER_DIR}/{STDIN_FILE}"),
                    "sandbox".to_string(),
                ];
                cmd.extend(command.argv());
                (cmd, "ro")
            }
        };

        ContainerCreateBody {
            image: Some(image.to_string()),
            cmd: Some(cmd),
            working_dir: Some(CONTAINER_DIR.to_string()),
            user: Some(self.user.clone()),
            env: Some(vec![
                "HOME=/tmp".to_string(),
                "GOCACHE=/tmp/.cache".to_string(),
                "LANG=C.UTF-8".to_string(),
            ]),
            network_disabled: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(false),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{}:{CONTAINER_DIR}:{bind_mode}",
                    workspace.dir().display()
                )]),
                memory: Some(self.limits.memory_bytes()),
                memory_swap: Some(self.limits.memory_bytes()),
                cpu_period: Some(SandboxLimits::CPU_PERIOD_US),
                cpu_quota: Some(self.limits.cpu_quota_us()),
                pids_limit: Some(self.limits.max_processes as i64),
                network_mode: Some("none".to_string()),
                readonly_rootfs: Some(true),
                tmpfs: Some(HashMap::from([(
                    "/tmp".to_string(),
                    "rw,nosuid,size=64m".to_string(),
                )])),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn create_container(
        &self,
        name: String,
        body: ContainerCreateBody,
    ) -> Result<String, EngineError> {
        let options = CreateContainerOptions {
            name: Some(name.clone()),
            ..Default::default()
        };
        self.docker
            .create_container(Some(options), body)
            .await
            .map(|created| created.id)
            .map_err(|err| EngineError::ProvisioningFailed(format!("create container {name}: {err}")))
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(EngineError::Internal(format!("remove container {id}: {err}"))),
        }
    }

    async fn create_phases(
        &self,
        name: &str,
        image: &str,
        language: &LanguageSpec,
        workspace: &Workspace,
        created: &mut Vec<String>,
    ) -> Result<(Option<PhasePlan>, PhasePlan), EngineError> {
        let source = Path::new(CONTAINER_DIR).join(language.source_name);

        let compile = match language.compile_command(&source) {
            Some(command) => {
                let body = self.container_body(image, workspace, Phase::Compile, &command);
                let id = self.create_container(format!("{name}-compile"), body).await?;
                created.push(id.clone());
                Some(PhasePlan {
                    command,
                    container_id: Some(id),
                })
            }
            None => None,
        };

        let command = language.run_command(&source);
        let body = self.container_body(image, workspace, Phase::Run, &command);
        let id = self.create_container(name.to_string(), body).await?;
        created.push(id.clone());

        Ok((
            compile,
            PhasePlan {
                command,
                container_id: Some(id),
            },
        ))
    }

    async fn one_shot_stats(&self, id: &str) -> Option<ContainerStatsResponse> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        Box::pin(self.docker.stats(id, Some(options)))
            .next()
            .await?
            .ok()
    }
}

#[async_trait]
impl SandboxBackend for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn provision(&self, request: ProvisionRequest<'_>) -> Result<SandboxHandle, EngineError> {
        let language = request.language;
        let image = self.image_for(language);
        self.ensure_image(&image).await?;

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

        let mut created = Vec::new();
        match self
            .create_phases(&name, &image, language, &workspace, &mut created)
            .await
        {
            Ok((compile, run)) => Ok(SandboxHandle::new(
                request.session.id.clone(),
                name,
                language,
                workspace,
                compile,
                run,
            )),
            Err(err) => {
                for id in &created {
                    if let Err(cleanup) = self.remove_container(id).await {
                        tracing::warn!(container = %id, error = %cleanup, "failed to remove partial container");
                    }
                }
                if let Err(cleanup) = workspace.remove().await {
                    tracing::warn!(workspace = %workspace.dir().display(), error = %cleanup, "failed to remove partial workspace");
                }
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        sandbox: &SandboxHandle,
        phase: Phase,
        output: &dyn OutputSink,
    ) -> Result<i64, EngineError> {
        let id = sandbox
            .phase(phase)
            .and_then(|plan| plan.container_id.clone())
            .ok_or_else(|| EngineError::Internal(format!("no {} container prepared", phase.as_str())))?;

        let attach = AttachContainerOptions {
            stdout: true,
            stderr: true,
            stream: true,
            logs: true,
            ..Default::default()
        };
        let mut attached = self
            .docker
            .attach_container(&id, Some(attach))
            .await
            .map_err(|err| EngineError::Internal(format!("attach {id}: {err}")))?;

        sandbox.set_active(Some(ActiveProcess::Container(id.clone())));
        if let Err(err) = self
            .docker
            .start_container(&id, None::<StartContainerOptions>)
            .await
        {
            sandbox.set_active(None);
            return Err(EngineError::Internal(format!("start {id}: {err}")));
        }

        let sampler = tokio::spawn(sample_stats(
            self.docker.clone(),
            id.clone(),
            sandbox.usage_tracker(),
        ));

        let forward = async {
            while let Some(frame) = attached.output.next().await {
                match frame {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        output.emit(StreamKind::Stdout, &message)
                    }
                    Ok(LogOutput::StdErr { message }) => output.emit(StreamKind::Stderr, &message),
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(container = %id, error = %err, "attach stream ended");
                        break;
                    }
                }
            }
        };
        let wait = async {
            let mut waiting = Box::pin(
                self.docker
                    .wait_container(&id, None::<WaitContainerOptions>),
            );
            match waiting.next().await {
                Some(Ok(response)) => Ok(response.status_code),
                Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
                Some(Err(err)) => Err(EngineError::Internal(format!("wait {id}: {err}"))),
                None => Err(EngineError::Internal(format!("wait {id}: stream closed"))),
            }
        };
        let ((), exit) = tokio::join!(forward, wait);

        sampler.abort();
        sandbox.set_active(None);
        exit
    }

    async fn kill(&self, sandbox: &SandboxHandle) -> Result<(), EngineError> {
        let Some(ActiveProcess::Container(id)) = sandbox.active() else {
            return Ok(());
        };
        let options = KillContainerOptions {
            signal: "SIGKILL".to_string(),
        };
        match self.docker.kill_container(&id, Some(options)).await {
            Ok(()) => {
                tracing::debug!(session_id = %sandbox.session_id(), container = %id, "container killed");
                Ok(())
            }
            // Already gone or no longer running.
            Err(DockerError::DockerResponseServerError { status_code: 404 | 409, .. }) => Ok(()),
            Err(err) => Err(EngineError::Internal(format!("kill {id}: {err}"))),
        }
    }

    async fn collect_usage(&self, sandbox: &SandboxHandle) -> Option<UsageTracker> {
        if let Some(snapshot) = sandbox.usage_snapshot() {
            return Some(snapshot);
        }
        let id = sandbox.phase(Phase::Run)?.container_id.clone()?;
        let stats = self.one_shot_stats(&id).await?;
        let mut tracker = UsageTracker::default();
        observe(&mut tracker, &stats);
        (!tracker.is_empty()).then_some(tracker)
    }

    async fn remove(&self, sandbox: &SandboxHandle) -> Result<(), EngineError> {
        let mut first_error = None;
        for id in sandbox.phases().filter_map(|plan| plan.container_id.as_deref()) {
            if let Err(err) = self.remove_container(id).await {
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = sandbox.workspace().remove().await {
            first_error.get_or_insert(EngineError::Internal(format!("remove workspace: {err}")));
        }
        first_error.map_or(Ok(()), Err)
    }

    fn exit_codes(&self) -> &dyn ExitCodeTable {
        &ContainerExitCodes
    }
}

async fn sample_stats(
    docker: Docker,
    id: String,
    tracker: std::sync::Arc<std::sync::Mutex<UsageTracker>>,
) {
    let options = StatsOptions {
        stream: true,
        one_shot: false,
    };
    let mut stats = Box::pin(docker.stats(&id, Some(options)));
    while let Some(Ok(frame)) = stats.next().await {
        observe(&mut lock(&tracker), &frame);
    }
}

fn observe(tracker: &mut UsageTracker, stats: &ContainerStatsResponse) {
    if let Some(cpu) = &stats.cpu_stats {
        let total = cpu.cpu_usage.as_ref().and_then(|usage| usage.total_usage);
        if let (Some(cpu_total), Some(system_total)) = (total, cpu.system_cpu_usage) {
            tracker.observe_cpu(CpuReading {
                cpu_total,
                system_total,
            });
        }
    }
    if let Some(memory) = &stats.memory_stats {
        // cgroup v2 hosts only report the current usage.
        if let Some(bytes) = memory.max_usage.or(memory.usage).filter(|bytes| *bytes > 0) {
            tracker.observe_memory(bytes);
        }
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}
