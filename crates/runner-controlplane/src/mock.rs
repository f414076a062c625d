//! In-memory `ControlPlaneClient` for tests.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use runner_core::artifact::{ArtifactDownload, HashKind};
use runner_core::job::{JobStatus, JobUpdateResult, RunnableJob, RuntimeInfo, StepStatus, StepUpdateResult};
use runner_core::secret::Secret;
use runner_core::ResourceId;

use crate::client::{ArtifactSearchPage, ControlPlaneClient, LogStreamSink};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RecordedJobStatus {
    pub job_id: ResourceId,
    pub status: JobStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RecordedStepStatus {
    pub step_id: ResourceId,
    pub status: StepStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RecordedArtifact {
    pub job_id: ResourceId,
    pub group: String,
    pub relative_path: String,
    pub body: Bytes,
}

#[derive(Default)]
struct State {
    queue: VecDeque<RunnableJob>,
    secrets: Vec<Secret>,
    job_statuses: Vec<RecordedJobStatus>,
    step_statuses: Vec<RecordedStepStatus>,
    artifacts: Vec<RecordedArtifact>,
    artifact_pages: Vec<ArtifactDownload>,
    indirect_fingerprint_target: Option<ResourceId>,
    log_entries: Vec<(ResourceId, Bytes)>,
}

/// Matches the capability-set idiom used elsewhere in this codebase (a
/// `Mock*` struct behind the trait, not a mock library) for deterministic,
/// dependency-free unit tests.
pub struct MockControlPlaneClient {
    state: Arc<Mutex<State>>,
}

impl Default for MockControlPlaneClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockControlPlaneClient {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn enqueue(&self, job: RunnableJob) {
        self.state.lock().queue.push_back(job);
    }

    pub fn set_secrets(&self, secrets: Vec<Secret>) {
        self.state.lock().secrets = secrets;
    }

    pub fn set_artifact_dependencies(&self, artifacts: Vec<ArtifactDownload>) {
        self.state.lock().artifact_pages = artifacts;
    }

    /// Any fingerprint update will report this job as the indirection
    /// target, simulating the control plane recognising a cache hit.
    pub fn set_indirection_target(&self, job_id: ResourceId) {
        self.state.lock().indirect_fingerprint_target = Some(job_id);
    }

    pub fn job_statuses(&self) -> Vec<RecordedJobStatus> {
        self.state.lock().job_statuses.clone()
    }

    pub fn step_statuses(&self) -> Vec<RecordedStepStatus> {
        self.state.lock().step_statuses.clone()
    }

    pub fn artifacts(&self) -> Vec<RecordedArtifact> {
        self.state.lock().artifacts.clone()
    }

    pub fn log_entries_for(&self, log_id: ResourceId) -> Vec<Bytes> {
        self.state
            .lock()
            .log_entries
            .iter()
            .filter(|(id, _)| *id == log_id)
            .map(|(_, b)| b.clone())
            .collect()
    }
}

#[async_trait]
impl ControlPlaneClient for MockControlPlaneClient {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn send_runtime_info(&self, _info: RuntimeInfo) -> Result<()> {
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<RunnableJob>> {
        Ok(self.state.lock().queue.pop_front())
    }

    async fn update_job_status(
        &self,
        job_id: ResourceId,
        status: JobStatus,
        error: Option<String>,
        _version_tag: &str,
    ) -> Result<JobUpdateResult> {
        let mut state = self.state.lock();
        state.job_statuses.push(RecordedJobStatus {
            job_id,
            status,
            error,
        });
        Ok(JobUpdateResult {
            version_tag: uuid::Uuid::now_v7().to_string(),
            indirect_to_job_id: None,
        })
    }

    async fn update_job_fingerprint(
        &self,
        _job_id: ResourceId,
        _fingerprint: &str,
        _hash_kind: HashKind,
        _version_tag: &str,
    ) -> Result<JobUpdateResult> {
        let indirect_to_job_id = self.state.lock().indirect_fingerprint_target;
        Ok(JobUpdateResult {
            version_tag: uuid::Uuid::now_v7().to_string(),
            indirect_to_job_id,
        })
    }

    async fn update_step_status(
        &self,
        step_id: ResourceId,
        status: StepStatus,
        error: Option<String>,
        _version_tag: &str,
    ) -> Result<StepUpdateResult> {
        self.state.lock().step_statuses.push(RecordedStepStatus {
            step_id,
            status,
            error,
        });
        Ok(StepUpdateResult {
            version_tag: uuid::Uuid::now_v7().to_string(),
        })
    }

    async fn get_secrets_plaintext(&self, _repo_id: ResourceId) -> Result<Vec<Secret>> {
        Ok(self.state.lock().secrets.clone())
    }

    async fn create_artifact(
        &self,
        job_id: ResourceId,
        group: &str,
        relative_path: &str,
        body: Bytes,
        _md5_hex: Option<&str>,
    ) -> Result<()> {
        self.state.lock().artifacts.push(RecordedArtifact {
            job_id,
            group: group.to_string(),
            relative_path: relative_path.to_string(),
            body,
        });
        Ok(())
    }

    async fn get_artifact_data(&self, _artifact_id: ResourceId) -> Result<Bytes> {
        Ok(Bytes::new())
    }

    async fn search_artifacts(
        &self,
        _build_id: ResourceId,
        _workflow: &str,
        _job: &str,
        _group: &str,
        _cursor: Option<&str>,
    ) -> Result<ArtifactSearchPage> {
        Ok(ArtifactSearchPage {
            items: self.state.lock().artifact_pages.clone(),
            next_cursor: None,
        })
    }

    async fn open_log_write_stream(&self, log_id: ResourceId) -> Result<Box<dyn LogStreamSink>> {
        Ok(Box::new(MockLogStreamSink {
            log_id,
            state: self.state.clone(),
            buf: Vec::new(),
        }))
    }
}

struct MockLogStreamSink {
    log_id: ResourceId,
    state: Arc<Mutex<State>>,
    buf: Vec<u8>,
}

#[async_trait]
impl LogStreamSink for MockLogStreamSink {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.buf.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        self.state
            .lock()
            .log_entries
            .push((self.log_id, Bytes::from(self.buf)));
        Ok(())
    }
}
