//! The `Executor` capability set: a runtime-agnostic interface the job
//! state machine drives without knowing whether it is talking to a
//! container runtime or a host shell.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::{ResourceId, Result};

/// Specification for one unit of work handed to a runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSpec {
    pub id: ResourceId,
    /// Container image. Ignored by runtimes that have no notion of images
    /// (the host-shell runtime).
    pub image: Option<String>,
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub env: HashMap<String, String>,
    pub resources: ResourceRequirements,
    pub timeout: Option<Duration>,
    pub volumes: Vec<VolumeMount>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
    pub cpu_request: Option<String>,
    pub memory_request: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    pub read_only: bool,
}

/// Handle to a running or completed execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionHandle {
    pub id: ResourceId,
    pub backend_id: String,
    pub backend_name: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Pending,
    Running {
        started_at: DateTime<Utc>,
    },
    Succeeded {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    Failed {
        started_at: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
        exit_code: Option<i32>,
        message: String,
    },
    Cancelled {
        started_at: Option<DateTime<Utc>>,
        cancelled_at: DateTime<Utc>,
    },
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded { .. }
                | ExecutionStatus::Failed { .. }
                | ExecutionStatus::Cancelled { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// Authentication for a container registry. The password always comes from
/// a secret reference; a plaintext literal is never accepted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
    pub server_address: Option<String>,
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn can_execute(&self, spec: &ExecutionSpec) -> bool;

    async fn spawn(
        &self,
        spec: ExecutionSpec,
        registry_auth: Option<RegistryCredentials>,
    ) -> Result<ExecutionHandle>;

    async fn logs(&self, handle: &ExecutionHandle) -> Result<BoxStream<'static, LogLine>>;

    async fn status(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus>;

    async fn wait(&self, handle: &ExecutionHandle) -> Result<ExecutionResult>;

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<()>;

    /// Start a side service (declared by `ServiceDef`) and leave it running
    /// for the duration of the job; returns a handle used only for cleanup.
    async fn start_service(
        &self,
        name: &str,
        image: &str,
        env: HashMap<String, String>,
    ) -> Result<ExecutionHandle>;

    /// Remove any resources (containers, networks, volumes) left over from
    /// a previous process instance, keyed by this executor's naming scheme.
    async fn cleanup_stale(&self) -> Result<()>;
}
