//! The `ControlPlaneClient` capability set. Unlike the log pipeline's NoOp
//! implementation, there is no no-op client: every caller needs a real
//! answer from the control plane, so the only implementors are an
//! HTTP-backed client and, for tests, an in-memory mock.

use async_trait::async_trait;
use bytes::Bytes;
use runner_core::artifact::ArtifactDownload;
use runner_core::job::{JobUpdateResult, RunnableJob, RuntimeInfo, StepUpdateResult};
use runner_core::secret::Secret;
use runner_core::ResourceId;

use crate::error::Result;

/// One page of an artifact search.
#[derive(Debug, Clone)]
pub struct ArtifactSearchPage {
    pub items: Vec<ArtifactDownload>,
    pub next_cursor: Option<String>,
}

/// A single outbound HTTP stream opened against `OpenLogWriteStream`. The
/// Streamer writes chunks as entries accumulate and calls `finish` to close
/// the request body; the server's response (success/error) is only known
/// once `finish` returns.
#[async_trait]
pub trait LogStreamSink: Send {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()>;
    async fn finish(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn send_runtime_info(&self, info: RuntimeInfo) -> Result<()>;

    /// Returns `None` when the queue is currently empty.
    async fn dequeue(&self) -> Result<Option<RunnableJob>>;

    async fn update_job_status(
        &self,
        job_id: ResourceId,
        status: runner_core::job::JobStatus,
        error: Option<String>,
        version_tag: &str,
    ) -> Result<JobUpdateResult>;

    async fn update_job_fingerprint(
        &self,
        job_id: ResourceId,
        fingerprint: &str,
        hash_kind: runner_core::artifact::HashKind,
        version_tag: &str,
    ) -> Result<JobUpdateResult>;

    async fn update_step_status(
        &self,
        step_id: ResourceId,
        status: runner_core::job::StepStatus,
        error: Option<String>,
        version_tag: &str,
    ) -> Result<StepUpdateResult>;

    async fn get_secrets_plaintext(&self, repo_id: ResourceId) -> Result<Vec<Secret>>;

    async fn create_artifact(
        &self,
        job_id: ResourceId,
        group: &str,
        relative_path: &str,
        body: Bytes,
        md5_hex: Option<&str>,
    ) -> Result<()>;

    async fn get_artifact_data(&self, artifact_id: ResourceId) -> Result<Bytes>;

    async fn search_artifacts(
        &self,
        build_id: ResourceId,
        workflow: &str,
        job: &str,
        group: &str,
        cursor: Option<&str>,
    ) -> Result<ArtifactSearchPage>;

    async fn open_log_write_stream(&self, log_id: ResourceId) -> Result<Box<dyn LogStreamSink>>;
}
