//! Docker-backed `Executor`. Steps and services alike run as containers on
//! the local Docker daemon; git checkout has already happened by the time
//! `spawn` is called, so the working directory is just a bind mount.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use runner_core::execution::{
    Executor, ExecutionHandle, ExecutionResult, ExecutionSpec, ExecutionStatus, LogLine,
    LogStream, RegistryCredentials,
};
use runner_core::{Error, Result};
use tracing::{debug, info, warn};

const LABEL_MANAGED_BY: &str = "runner.managed-by";
const LABEL_VALUE: &str = "runner";

pub struct DockerExecutor {
    docker: Docker,
}

impl DockerExecutor {
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    fn container_name(id: &runner_core::ResourceId) -> String {
        format!("runner-{id}")
    }

    async fn pull_image(&self, image: &str) {
        info!(image, "pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            if let Err(e) = result {
                warn!(error = %e, "pull warning");
            }
        }
    }

    async fn run_container(
        &self,
        name: &str,
        image: &str,
        cmd: Option<Vec<String>>,
        working_dir: Option<String>,
        env: HashMap<String, String>,
        volumes: &[runner_core::execution::VolumeMount],
        registry_auth: Option<RegistryCredentials>,
    ) -> Result<String> {
        self.pull_image(image).await;

        let env: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let binds: Option<Vec<String>> = if volumes.is_empty() {
            None
        } else {
            Some(
                volumes
                    .iter()
                    .map(|v| {
                        let mode = if v.read_only { "ro" } else { "rw" };
                        format!("{}:{}:{}", v.name, v.mount_path, mode)
                    })
                    .collect(),
            )
        };

        let host_config = HostConfig {
            binds,
            ..Default::default()
        };

        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED_BY.to_string(), LABEL_VALUE.to_string());

        let config = Config {
            image: Some(image.to_string()),
            cmd,
            env: Some(env),
            working_dir,
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            labels: Some(labels),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        if let Some(creds) = registry_auth.as_ref() {
            debug!(registry = ?creds.server_address, "using registry credentials (pull-only path not wired)");
        }

        info!(container = name, "creating container");
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("failed to create container: {e}")))?;

        info!(container = name, "starting container");
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("failed to start container: {e}")))?;

        Ok(container.id)
    }
}

impl Default for DockerExecutor {
    fn default() -> Self {
        Self::new().expect("failed to connect to Docker")
    }
}

#[async_trait]
impl Executor for DockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn can_execute(&self, spec: &ExecutionSpec) -> bool {
        spec.image.is_some() && self.docker.ping().await.is_ok()
    }

    async fn spawn(
        &self,
        spec: ExecutionSpec,
        registry_auth: Option<RegistryCredentials>,
    ) -> Result<ExecutionHandle> {
        let image = spec
            .image
            .clone()
            .ok_or_else(|| Error::InvalidInput("docker executor requires an image".into()))?;
        let name = Self::container_name(&spec.id);
        let cmd = if spec.command.is_empty() {
            None
        } else {
            Some(spec.command.clone())
        };

        let container_id = self
            .run_container(
                &name,
                &image,
                cmd,
                spec.working_dir.clone(),
                spec.env.clone(),
                &spec.volumes,
                registry_auth,
            )
            .await?;

        Ok(ExecutionHandle {
            id: spec.id,
            backend_id: container_id,
            backend_name: self.name(),
        })
    }

    async fn logs(&self, handle: &ExecutionHandle) -> Result<BoxStream<'static, LogLine>> {
        let name = Self::container_name(&handle.id);
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: true,
            ..Default::default()
        };
        let stream = self.docker.logs(&name, Some(options));

        let mapped = stream.filter_map(|result| async move {
            match result {
                Ok(output) => {
                    let (stream, content) = match output {
                        LogOutput::StdOut { message } => {
                            (LogStream::Stdout, String::from_utf8_lossy(&message).into_owned())
                        }
                        LogOutput::StdErr { message } => {
                            (LogStream::Stderr, String::from_utf8_lossy(&message).into_owned())
                        }
                        LogOutput::Console { message } | LogOutput::StdIn { message } => {
                            (LogStream::Stdout, String::from_utf8_lossy(&message).into_owned())
                        }
                    };
                    Some(LogLine {
                        timestamp: Utc::now(),
                        stream,
                        content: content.trim_end().to_string(),
                    })
                }
                Err(e) => {
                    warn!(error = %e, "log stream error");
                    None
                }
            }
        });

        Ok(Box::pin(mapped))
    }

    async fn status(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus> {
        let name = Self::container_name(&handle.id);
        let inspect = self
            .docker
            .inspect_container(&name, None)
            .await
            .map_err(|e| Error::NotFound(format!("container not found: {e}")))?;

        let state = inspect
            .state
            .ok_or_else(|| Error::Internal("container has no state".to_string()))?;

        let parse_time = |s: Option<String>| {
            s.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };

        let status = if state.running.unwrap_or(false) {
            ExecutionStatus::Running {
                started_at: parse_time(state.started_at).unwrap_or_else(Utc::now),
            }
        } else {
            let started_at = parse_time(state.started_at);
            let finished_at = parse_time(state.finished_at).unwrap_or_else(Utc::now);
            let exit_code = state.exit_code.map(|c| c as i32);

            if exit_code == Some(0) {
                ExecutionStatus::Succeeded {
                    started_at: started_at.unwrap_or(finished_at),
                    finished_at,
                }
            } else {
                ExecutionStatus::Failed {
                    started_at,
                    finished_at,
                    exit_code,
                    message: state.error.unwrap_or_default(),
                }
            }
        };

        Ok(status)
    }

    async fn wait(&self, handle: &ExecutionHandle) -> Result<ExecutionResult> {
        let name = Self::container_name(&handle.id);

        let current = self.status(handle).await?;
        if current.is_terminal() {
            let exit_code = match &current {
                ExecutionStatus::Succeeded { .. } => Some(0),
                ExecutionStatus::Failed { exit_code, .. } => *exit_code,
                _ => None,
            };
            return Ok(ExecutionResult {
                status: current,
                exit_code,
            });
        }

        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(&name, Some(options));
        let exit_code = match stream.next().await {
            Some(Ok(response)) => Some(response.status_code as i32),
            Some(Err(e)) => {
                warn!(error = %e, "wait error");
                None
            }
            None => None,
        };

        let status = self.status(handle).await?;
        Ok(ExecutionResult { status, exit_code })
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<()> {
        let name = Self::container_name(&handle.id);
        self.docker
            .stop_container(&name, None)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("failed to stop container: {e}")))?;

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(&name, Some(options))
            .await
            .map_err(|e| Error::ExecutionFailed(format!("failed to remove container: {e}")))?;

        Ok(())
    }

    async fn start_service(
        &self,
        name: &str,
        image: &str,
        env: HashMap<String, String>,
    ) -> Result<ExecutionHandle> {
        let container_name = format!("runner-svc-{name}");
        let container_id = self
            .run_container(&container_name, image, None, None, env, &[], None)
            .await?;
        Ok(ExecutionHandle {
            id: runner_core::ResourceId::new(),
            backend_id: container_id,
            backend_name: self.name(),
        })
    }

    async fn cleanup_stale(&self) -> Result<()> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{LABEL_MANAGED_BY}={LABEL_VALUE}")]);
        let options = bollard::container::ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        for container in containers {
            if let Some(id) = container.id {
                debug!(container = id, "removing stale container from previous run");
                let remove_options = RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                };
                let _ = self.docker.remove_container(&id, Some(remove_options)).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_is_deterministic_per_id() {
        let id = runner_core::ResourceId::new();
        assert_eq!(DockerExecutor::container_name(&id), DockerExecutor::container_name(&id));
    }

    #[test]
    fn container_name_differs_per_id() {
        let a = runner_core::ResourceId::new();
        let b = runner_core::ResourceId::new();
        assert_ne!(DockerExecutor::container_name(&a), DockerExecutor::container_name(&b));
    }
}

/// Integration tests that require a live Docker daemon.
#[cfg(test)]
mod integration_tests {
    use super::*;
    use runner_core::execution::ResourceRequirements;

    fn make_spec() -> ExecutionSpec {
        ExecutionSpec {
            id: runner_core::ResourceId::new(),
            image: Some("alpine:latest".to_string()),
            command: vec!["echo".to_string(), "hello".to_string()],
            working_dir: None,
            env: HashMap::new(),
            resources: ResourceRequirements::default(),
            timeout: None,
            volumes: vec![],
        }
    }

    #[tokio::test]
    #[ignore]
    async fn spawn_wait_and_cancel_lifecycle() {
        let executor = DockerExecutor::new().unwrap();
        let handle = executor.spawn(make_spec(), None).await.unwrap();
        let result = executor.wait(&handle).await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        let _ = executor.cancel(&handle).await;
    }

    #[tokio::test]
    #[ignore]
    async fn failing_command_reports_nonzero_exit_code() {
        let executor = DockerExecutor::new().unwrap();
        let mut spec = make_spec();
        spec.command = vec!["/bin/sh".to_string(), "-c".to_string(), "exit 42".to_string()];
        let handle = executor.spawn(spec, None).await.unwrap();
        let result = executor.wait(&handle).await.unwrap();
        assert_eq!(result.exit_code, Some(42));
        let _ = executor.cancel(&handle).await;
    }
}
