//! Host-shell `Executor`: runs each step as a child process directly on the
//! runner's own machine rather than inside a container. No image pulling,
//! no network namespace, no registry auth.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex as SyncMutex;
use runner_core::execution::{
    Executor, ExecutionHandle, ExecutionResult, ExecutionSpec, ExecutionStatus, LogLine,
    LogStream, RegistryCredentials,
};
use runner_core::{Error, ResourceId, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct Process {
    child: Option<Child>,
    started_at: chrono::DateTime<Utc>,
    finished: Option<ExecutionStatus>,
    logs: Arc<SyncMutex<Vec<LogLine>>>,
}

#[derive(Default)]
pub struct HostShellExecutor {
    processes: Mutex<HashMap<ResourceId, Process>>,
}

impl HostShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn_log_reader<R>(reader: R, stream: LogStream, sink: Arc<SyncMutex<Vec<LogLine>>>)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sink.lock().push(LogLine {
                    timestamp: Utc::now(),
                    stream,
                    content: line,
                });
            }
        });
    }
}

#[async_trait]
impl Executor for HostShellExecutor {
    fn name(&self) -> &'static str {
        "host-shell"
    }

    async fn can_execute(&self, spec: &ExecutionSpec) -> bool {
        spec.image.is_none()
    }

    async fn spawn(
        &self,
        spec: ExecutionSpec,
        _registry_auth: Option<RegistryCredentials>,
    ) -> Result<ExecutionHandle> {
        if spec.command.is_empty() {
            return Err(Error::InvalidInput("host shell executor requires a command".into()));
        }

        let mut command = Command::new(&spec.command[0]);
        command.args(&spec.command[1..]);
        command.envs(&spec.env);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| Error::ExecutionFailed(format!("failed to spawn process: {e}")))?;

        let logs = Arc::new(SyncMutex::new(Vec::new()));
        if let Some(stdout) = child.stdout.take() {
            Self::spawn_log_reader(stdout, LogStream::Stdout, logs.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            Self::spawn_log_reader(stderr, LogStream::Stderr, logs.clone());
        }

        let mut processes = self.processes.lock().await;
        processes.insert(
            spec.id,
            Process {
                child: Some(child),
                started_at: Utc::now(),
                finished: None,
                logs,
            },
        );

        Ok(ExecutionHandle {
            id: spec.id,
            backend_id: spec.id.to_string(),
            backend_name: self.name(),
        })
    }

    async fn logs(&self, handle: &ExecutionHandle) -> Result<BoxStream<'static, LogLine>> {
        let processes = self.processes.lock().await;
        let Some(process) = processes.get(&handle.id) else {
            return Err(Error::NotFound(format!("no host-shell process for {}", handle.id)));
        };
        let snapshot = process.logs.lock().clone();
        Ok(stream::iter(snapshot).boxed())
    }

    async fn status(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus> {
        let mut processes = self.processes.lock().await;
        let process = processes
            .get_mut(&handle.id)
            .ok_or_else(|| Error::NotFound(format!("no host-shell process for {}", handle.id)))?;

        if let Some(status) = &process.finished {
            return Ok(status.clone());
        }

        let Some(child) = process.child.as_mut() else {
            return Ok(ExecutionStatus::Running {
                started_at: process.started_at,
            });
        };

        match child.try_wait() {
            Ok(Some(exit_status)) => {
                let status = terminal_status(process.started_at, exit_status);
                process.finished = Some(status.clone());
                Ok(status)
            }
            Ok(None) => Ok(ExecutionStatus::Running {
                started_at: process.started_at,
            }),
            Err(e) => Err(Error::Internal(e.to_string())),
        }
    }

    async fn wait(&self, handle: &ExecutionHandle) -> Result<ExecutionResult> {
        let child = {
            let mut processes = self.processes.lock().await;
            let process = processes
                .get_mut(&handle.id)
                .ok_or_else(|| Error::NotFound(format!("no host-shell process for {}", handle.id)))?;
            process.child.take()
        };

        let status = if let Some(mut child) = child {
            let exit_status = child
                .wait()
                .await
                .map_err(|e| Error::ExecutionFailed(e.to_string()))?;
            let mut processes = self.processes.lock().await;
            let process = processes.get_mut(&handle.id).expect("just inserted");
            let status = terminal_status(process.started_at, exit_status);
            process.finished = Some(status.clone());
            status
        } else {
            self.status(handle).await?
        };

        let exit_code = match &status {
            ExecutionStatus::Succeeded { .. } => Some(0),
            ExecutionStatus::Failed { exit_code, .. } => *exit_code,
            _ => None,
        };
        Ok(ExecutionResult { status, exit_code })
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<()> {
        let mut processes = self.processes.lock().await;
        let Some(process) = processes.get_mut(&handle.id) else {
            return Ok(());
        };
        if let Some(child) = process.child.as_mut() {
            let _ = child.start_kill();
        }
        process.finished = Some(ExecutionStatus::Cancelled {
            started_at: Some(process.started_at),
            cancelled_at: Utc::now(),
        });
        Ok(())
    }

    async fn start_service(
        &self,
        name: &str,
        _image: &str,
        _env: HashMap<String, String>,
    ) -> Result<ExecutionHandle> {
        warn!(name, "host-shell executor cannot run container-based services");
        Err(Error::ExecutionFailed(
            "host-shell executor does not support services".to_string(),
        ))
    }

    async fn cleanup_stale(&self) -> Result<()> {
        debug!("host-shell executor holds no cross-process state to clean up");
        Ok(())
    }
}

fn terminal_status(
    started_at: chrono::DateTime<Utc>,
    exit_status: std::process::ExitStatus,
) -> ExecutionStatus {
    let finished_at = Utc::now();
    if exit_status.success() {
        ExecutionStatus::Succeeded {
            started_at,
            finished_at,
        }
    } else {
        ExecutionStatus::Failed {
            started_at: Some(started_at),
            finished_at,
            exit_code: exit_status.code(),
            message: format!("process exited with {exit_status}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_core::execution::ResourceRequirements;

    fn make_spec(command: Vec<&str>) -> ExecutionSpec {
        ExecutionSpec {
            id: ResourceId::new(),
            image: None,
            command: command.into_iter().map(String::from).collect(),
            working_dir: None,
            env: HashMap::new(),
            resources: ResourceRequirements::default(),
            timeout: None,
            volumes: vec![],
        }
    }

    #[tokio::test]
    async fn successful_command_reports_succeeded() {
        let executor = HostShellExecutor::new();
        let handle = executor.spawn(make_spec(vec!["true"]), None).await.unwrap();
        let result = executor.wait(&handle).await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert!(result.status.is_terminal());
    }

    #[tokio::test]
    async fn failing_command_reports_nonzero_exit_code() {
        let executor = HostShellExecutor::new();
        let handle = executor
            .spawn(make_spec(vec!["sh", "-c", "exit 7"]), None)
            .await
            .unwrap();
        let result = executor.wait(&handle).await.unwrap();
        assert_eq!(result.exit_code, Some(7));
    }

    #[tokio::test]
    async fn stdout_is_captured_in_logs() {
        let executor = HostShellExecutor::new();
        let handle = executor
            .spawn(make_spec(vec!["sh", "-c", "echo hello-world"]), None)
            .await
            .unwrap();
        executor.wait(&handle).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let mut logs = executor.logs(&handle).await.unwrap();
        let mut found = false;
        while let Some(line) = logs.next().await {
            if line.content.contains("hello-world") {
                found = true;
            }
        }
        assert!(found);
    }

    #[tokio::test]
    async fn can_execute_rejects_specs_with_an_image() {
        let executor = HostShellExecutor::new();
        let mut spec = make_spec(vec!["true"]);
        spec.image = Some("alpine:latest".to_string());
        assert!(!executor.can_execute(&spec).await);
    }
}
