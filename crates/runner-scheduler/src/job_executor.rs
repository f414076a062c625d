//! The per-job state machine: `PreExecuteJob` / `ExecuteStep` /
//! `PostExecuteStep` / `PostExecuteJob`. This is the "Executor" of the
//! specification proper -- distinct from [`runner_core::execution::Executor`],
//! the runtime-agnostic adapter (Docker, host-shell) this state machine
//! drives to actually run commands.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use runner_artifacts::ArtifactManager;
use runner_config::{RunnerConfig, VariableContext};
use runner_controlplane::ControlPlaneClient;
use runner_core::execution::{Executor, ExecutionHandle, ExecutionSpec, RegistryCredentials, ResourceRequirements};
use runner_core::job::{RunnableJob, RuntimeSpec, StepDef};
use runner_core::log::LogDescriptor;
use runner_core::secret::SecretStore;
use runner_core::ResourceId;
use runner_fingerprint::FingerprintHasher;
use runner_git::{CheckoutRequest, GitCheckoutManager};
use runner_logs::{LogPipeline, LogSink, NoOpLogPipeline};
use tracing::{debug, info, warn};

use crate::ssh_agent::SshAgentHandle;

/// Name under which a repo's SSH deploy key is stored in the job's secret
/// store. Reserved: never a user-facing secret name.
pub const SSH_PRIVATE_KEY_SECRET: &str = "__ci_repo_ssh_key";

/// Mutable, per-job state threaded through every phase.
pub struct JobRunState {
    pub secrets: SecretStore,
    pub workspace: PathBuf,
    pub staging: PathBuf,
    pub global_env: HashMap<String, String>,
    pub var_ctx: VariableContext,
    pub job_log: Arc<dyn LogSink>,
    pub indirected: bool,
    ssh_agent: Option<SshAgentHandle>,
    service_handles: Vec<ExecutionHandle>,
}

/// Result of `PreExecuteJob`: the state is always returned (so `PostExecuteJob`
/// has something to clean up) even when `error` is set.
pub struct PreExecuteOutcome {
    pub state: JobRunState,
    /// True once enough setup succeeded (secrets + filesystem + log pipeline)
    /// that later phases have something meaningful to work with.
    pub job_prepared: bool,
    pub error: Option<String>,
}

/// Outcome of running one step's commands.
pub struct StepOutcome {
    pub error: Option<String>,
    pub log: Arc<dyn LogSink>,
}

pub struct JobExecutor {
    runtime: Arc<dyn Executor>,
    client: Arc<dyn ControlPlaneClient>,
    git: Arc<GitCheckoutManager>,
    artifacts: Arc<ArtifactManager>,
    config: RunnerConfig,
}

impl JobExecutor {
    pub fn new(
        runtime: Arc<dyn Executor>,
        client: Arc<dyn ControlPlaneClient>,
        git: Arc<GitCheckoutManager>,
        artifacts: Arc<ArtifactManager>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            runtime,
            client,
            git,
            artifacts,
            config,
        }
    }

    pub async fn pre_execute_job(&self, job: &RunnableJob, version_tag: &str) -> PreExecuteOutcome {
        let secrets = match self.client.get_secrets_plaintext(job.repo_id).await {
            Ok(secrets) => SecretStore::new(secrets),
            Err(e) => {
                return PreExecuteOutcome {
                    state: self.empty_state(job),
                    job_prepared: false,
                    error: Some(format!("failed to load secrets: {e}")),
                };
            }
        };

        let (workspace, staging) = if job.local {
            (std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")), self.config.work_dir.join(job.id.to_string()).join("staging"))
        } else {
            let root = self.config.work_dir.join(job.id.to_string());
            (root.join("workspace"), root.join("staging"))
        };
        if let Err(e) = tokio::fs::create_dir_all(&workspace).await {
            return PreExecuteOutcome {
                state: self.empty_state(job),
                job_prepared: false,
                error: Some(format!("failed to create workspace: {e}")),
            };
        }
        if let Err(e) = tokio::fs::create_dir_all(&staging).await {
            return PreExecuteOutcome {
                state: self.empty_state(job),
                job_prepared: false,
                error: Some(format!("failed to create staging dir: {e}")),
            };
        }

        let mut global_env = HashMap::new();
        global_env.insert("CI_WORKSPACE".to_string(), workspace.to_string_lossy().to_string());

        let mut var_ctx = VariableContext::new();
        var_ctx.build.id = job.build_id.to_string();
        var_ctx.job.id = job.id.to_string();
        var_ctx.job.name = job.job_name.clone();
        var_ctx.job.workflow = job.workflow_name.clone();
        for (name, value) in secrets.iter() {
            var_ctx.secrets.insert(name.to_string(), value.to_string());
        }

        let descriptor = LogDescriptor {
            id: ResourceId::new(),
            job_id: job.id,
            step_id: None,
        };
        let client_for_logs: Option<Arc<dyn ControlPlaneClient>> =
            if job.local { None } else { Some(self.client.clone()) };
        let job_log: Arc<dyn LogSink> = match LogPipeline::start(
            descriptor,
            &self.config.log_temp_dir,
            &secrets,
            client_for_logs,
        )
        .await
        {
            Ok(pipeline) => Arc::new(pipeline),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to start job log pipeline; continuing without one");
                Arc::new(NoOpLogPipeline)
            }
        };

        let mut state = JobRunState {
            secrets,
            workspace,
            staging,
            global_env,
            var_ctx,
            job_log,
            indirected: false,
            ssh_agent: None,
            service_handles: Vec::new(),
        };

        // From this point on the job is "prepared": a failure below is
        // recorded but does not erase the setup already done.
        let mut error = None;

        if !job.local {
            if let Some(git) = &job.git {
                let ssh_key = state.secrets.value(SSH_PRIVATE_KEY_SECRET).unwrap_or("").to_string();
                let req = CheckoutRequest {
                    repo_id: job.repo_id.to_string(),
                    clone_url: git.clone_url.clone(),
                    r#ref: git.r#ref.clone(),
                    sha: git.sha.clone(),
                    ssh_key_pem: ssh_key.clone(),
                    target_dir: state.workspace.clone(),
                    depth: None,
                };
                if let Err(e) = self.git.checkout(req).await {
                    error = Some(format!("git checkout failed: {e}"));
                }

                #[cfg(unix)]
                if error.is_none() && !ssh_key.is_empty() {
                    match SshAgentHandle::spawn(&state.staging, &ssh_key) {
                        Ok(agent) => {
                            state.global_env.insert("SSH_AUTH_SOCK".to_string(), agent.socket_path.clone());
                            state.global_env.insert("SSH_AGENT_PID".to_string(), agent.pid.to_string());
                            state.ssh_agent = Some(agent);
                        }
                        Err(e) => {
                            error = Some(format!("failed to start ssh agent: {e}"));
                        }
                    }
                }
            } else {
                error = Some("job requires a git checkout but no git reference was supplied".to_string());
            }
        }

        if error.is_none() {
            if let Err(e) = self.run_fingerprint_phase(job, version_tag, &mut state).await {
                error = Some(e);
            }
        }

        if error.is_none() && !state.indirected && !job.local {
            if let Err(e) = self
                .artifacts
                .download(job.build_id, &state.workspace, &job.artifact_dependencies)
                .await
            {
                error = Some(format!("artifact download failed: {e}"));
            }
        }

        if error.is_none() {
            for service in &job.services {
                let env = state.var_ctx.interpolate_map(&service.env);
                match self.runtime.start_service(&service.name, &service.image, env).await {
                    Ok(handle) => state.service_handles.push(handle),
                    Err(e) => {
                        error = Some(format!("failed to start service {}: {e}", service.name));
                        break;
                    }
                }
            }
        }

        PreExecuteOutcome {
            state,
            job_prepared: true,
            error,
        }
    }

    async fn run_fingerprint_phase(
        &self,
        job: &RunnableJob,
        version_tag: &str,
        state: &mut JobRunState,
    ) -> std::result::Result<(), String> {
        if job.fingerprint_commands.is_empty() {
            return Ok(());
        }

        let dependencies: Vec<(String, String)> = job
            .dependencies
            .iter()
            .map(|d| (d.name.clone(), d.fingerprint.clone().unwrap_or_default()))
            .collect();
        let mut hasher = FingerprintHasher::new(&job.job_config_hash, &dependencies);

        for cmd in &job.fingerprint_commands {
            let spec = ExecutionSpec {
                id: ResourceId::new(),
                image: self.image_for(&job.runtime),
                command: cmd.command.clone(),
                working_dir: Some(state.workspace.to_string_lossy().to_string()),
                env: state.global_env.clone(),
                resources: ResourceRequirements::default(),
                timeout: None,
                volumes: vec![],
            };
            let handle = self
                .runtime
                .spawn(spec, None)
                .await
                .map_err(|e| format!("fingerprint command failed to start: {e}"))?;
            let mut logs = self
                .runtime
                .logs(&handle)
                .await
                .map_err(|e| format!("failed to read fingerprint command output: {e}"))?;
            while let Some(line) = logs.next().await {
                let _ = writeln!(hasher, "{}", line.content);
            }
            let result = self
                .runtime
                .wait(&handle)
                .await
                .map_err(|e| format!("fingerprint command failed: {e}"))?;
            if result.exit_code != Some(0) {
                return Err(format!("fingerprint command exited with {:?}", result.exit_code));
            }
        }

        let fingerprint = hasher.finalize();
        match self
            .client
            .update_job_fingerprint(job.id, &fingerprint.digest, fingerprint.hash_kind, version_tag)
            .await
        {
            Ok(update) => {
                if let Some(target) = update.indirect_to_job_id {
                    info!(job_id = %job.id, indirect_to = %target, "job indirected to a prior equivalent job");
                    state.indirected = true;
                }
                Ok(())
            }
            Err(e) => Err(format!("failed to report fingerprint: {e}")),
        }
    }

    fn image_for(&self, runtime: &RuntimeSpec) -> Option<String> {
        match runtime {
            RuntimeSpec::Container { image, .. } => Some(image.clone()),
            RuntimeSpec::HostShell => None,
        }
    }

    fn registry_auth_for(&self, runtime: &RuntimeSpec, secrets: &SecretStore) -> Option<RegistryCredentials> {
        match runtime {
            RuntimeSpec::Container { registry_auth: Some(auth), .. } => {
                let password = secrets.value(&auth.password_secret_name)?.to_string();
                Some(RegistryCredentials {
                    username: auth.username.clone(),
                    password,
                    server_address: auth.server_address.clone(),
                })
            }
            _ => None,
        }
    }

    fn empty_state(&self, job: &RunnableJob) -> JobRunState {
        JobRunState {
            secrets: SecretStore::default(),
            workspace: self.config.work_dir.join(job.id.to_string()).join("workspace"),
            staging: self.config.work_dir.join(job.id.to_string()).join("staging"),
            global_env: HashMap::new(),
            var_ctx: VariableContext::new(),
            job_log: Arc::new(NoOpLogPipeline),
            indirected: false,
            ssh_agent: None,
            service_handles: Vec::new(),
        }
    }

    pub async fn execute_step(&self, job: &RunnableJob, state: &JobRunState, step: &StepDef) -> StepOutcome {
        let descriptor = LogDescriptor {
            id: ResourceId::new(),
            job_id: job.id,
            step_id: Some(step.id),
        };
        let client_for_logs: Option<Arc<dyn ControlPlaneClient>> =
            if job.local { None } else { Some(self.client.clone()) };
        let log: Arc<dyn LogSink> = match LogPipeline::start(descriptor, &self.config.log_temp_dir, &state.secrets, client_for_logs).await {
            Ok(pipeline) => Arc::new(pipeline),
            Err(e) => {
                warn!(step = %step.name, error = %e, "failed to start step log pipeline");
                Arc::new(NoOpLogPipeline)
            }
        };

        if state.indirected {
            return StepOutcome { error: None, log };
        }

        let mut full_env = state.global_env.clone();
        full_env.extend(step.env.clone());
        let full_env = state.var_ctx.interpolate_map(&full_env);
        let commands = state.var_ctx.interpolate_vec(&step.commands);
        let script = commands.join(" && ");

        let spec = ExecutionSpec {
            id: ResourceId::new(),
            image: self.image_for(&job.runtime),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), script],
            working_dir: Some(state.workspace.to_string_lossy().to_string()),
            env: full_env,
            resources: ResourceRequirements::default(),
            timeout: None,
            volumes: vec![],
        };
        let registry_auth = self.registry_auth_for(&job.runtime, &state.secrets);

        let error = match self.runtime.spawn(spec, registry_auth).await {
            Ok(handle) => {
                if let Ok(mut stream) = self.runtime.logs(&handle).await {
                    while let Some(line) = stream.next().await {
                        let _ = log.write(runner_core::log::LogEntry::line(line.content)).await;
                    }
                }
                match self.runtime.wait(&handle).await {
                    Ok(result) if result.exit_code == Some(0) => None,
                    Ok(result) => Some(format!("step exited with code {:?}", result.exit_code)),
                    Err(e) => Some(format!("step execution failed: {e}")),
                }
            }
            Err(e) => Some(format!("failed to start step: {e}")),
        };

        StepOutcome { error, log }
    }

    /// Always called after a step finishes, regardless of its outcome.
    pub async fn post_execute_step(&self, log: &Arc<dyn LogSink>) -> std::result::Result<(), String> {
        log.flush().await.map_err(|e| e.to_string())?;
        log.close().await.map_err(|e| e.to_string())
    }

    /// Always called once, even if `PreExecuteJob` partially failed. Uses
    /// its own short cleanup timeout in spirit -- callers wrap this with a
    /// fresh cancellation budget, not the job's own.
    pub async fn post_execute_job(&self, job: &RunnableJob, state: &mut JobRunState) -> Option<String> {
        let mut fatal = None;

        if !state.indirected && !job.artifacts.is_empty() {
            if let Err(e) = self.artifacts.upload(job.id, &state.workspace, &job.artifacts, &state.var_ctx).await {
                fatal = Some(format!("artifact upload failed: {e}"));
            }
        }

        for handle in state.service_handles.drain(..) {
            if let Err(e) = self.runtime.cancel(&handle).await {
                debug!(error = %e, "failed to stop service during cleanup");
            }
        }
        if let Some(agent) = state.ssh_agent.take() {
            agent.shutdown();
        }

        if !job.local {
            if let Err(e) = tokio::fs::remove_dir_all(&state.workspace).await {
                debug!(error = %e, "failed to remove workspace during cleanup");
            }
            if let Err(e) = tokio::fs::remove_dir_all(&state.staging).await {
                debug!(error = %e, "failed to remove staging dir during cleanup");
            }
        }

        if let Err(e) = state.job_log.flush().await {
            debug!(error = %e, "failed to flush job log during cleanup");
        }
        if let Err(e) = state.job_log.close().await {
            debug!(error = %e, "failed to close job log during cleanup");
        }

        fatal
    }
}
