//! The job/step data model a runner receives from the control plane and
//! reports status against.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// One of {Queued, Submitted, Running, Succeeded, Failed, Cancelled}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Submitted,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Status of a single step. Shares the same vocabulary as `JobStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Queued,
    Submitted,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Cancelled
        )
    }
}

/// The runtime a job's steps execute inside.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeSpec {
    Container {
        image: String,
        registry_auth: Option<RegistryAuth>,
    },
    HostShell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryAuth {
    pub username: String,
    /// Name of a secret holding the registry password. Never a plaintext
    /// literal: PreExecuteJob resolves this against the job's secret store.
    pub password_secret_name: String,
    pub server_address: Option<String>,
}

/// One step definition inside a `RunnableJob`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub id: ResourceId,
    pub name: String,
    pub commands: Vec<String>,
    /// Names of sibling steps that must succeed before this one runs.
    pub depends: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Mutable projection of one step's run-time state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: ResourceId,
    pub name: String,
    pub status: StepStatus,
    pub error: Option<String>,
    pub log_id: Option<ResourceId>,
    pub version_tag: String,
}

/// One declared fingerprint command; its stdout feeds the fingerprint hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintCommand {
    pub command: Vec<String>,
}

/// An artifact group this job produces. Each raw path may contain a glob
/// and `${var}`-style environment substitutions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDef {
    pub group: String,
    pub raw_paths: Vec<String>,
}

/// A declared dependency on another job's artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDependency {
    pub workflow: String,
    pub job: String,
    pub group: String,
}

/// Reference to another job in the same build, carrying its fingerprint and
/// terminal error (if any) so the DAG walker can propagate failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyRef {
    pub name: String,
    pub fingerprint: Option<String>,
    pub error: Option<String>,
}

/// A side service started alongside a job's steps (e.g. a database).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDef {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// The immutable input handed to an Orchestrator run.
///
/// Step dependencies (`StepDef::depends`) must form a DAG; a step name is
/// unique within a job, a job name unique within its workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnableJob {
    pub id: ResourceId,
    pub build_id: ResourceId,
    pub workflow_name: String,
    pub job_name: String,
    pub repo_id: ResourceId,
    pub steps: Vec<StepDef>,
    pub artifacts: Vec<ArtifactDef>,
    pub artifact_dependencies: Vec<ArtifactDependency>,
    pub services: Vec<ServiceDef>,
    pub fingerprint_commands: Vec<FingerprintCommand>,
    pub runtime: RuntimeSpec,
    pub dependencies: Vec<DependencyRef>,
    pub git: Option<GitRef>,
    pub job_config_hash: String,
    pub indirect_to_job_id: Option<ResourceId>,
    pub version_tag: String,
    /// True when this runner was invoked via the `local` CLI subcommand
    /// against a job document on disk, with no control plane involved.
    #[serde(default)]
    pub local: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitRef {
    pub clone_url: String,
    pub sha: String,
    pub r#ref: String,
}

/// Result of updating a resource's status: the control plane returns the
/// new version tag (and, for jobs, possibly an indirection target).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobUpdateResult {
    pub version_tag: String,
    pub indirect_to_job_id: Option<ResourceId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepUpdateResult {
    pub version_tag: String,
}

/// One-time capability advertisement sent before the first successful poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub os: String,
    pub arch: String,
    pub version: String,
    pub supported_runtimes: Vec<String>,
}

impl RuntimeInfo {
    pub fn detect(supported_runtimes: Vec<String>) -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            supported_runtimes,
        }
    }
}
