//! `runner local`: execute a single job document against the Docker
//! executor without registering with a control plane, for debugging a job
//! definition on a developer's machine.

use std::sync::Arc;

use runner_artifacts::ArtifactManager;
use runner_config::RunnerConfig;
use runner_controlplane::MockControlPlaneClient;
use runner_core::job::RunnableJob;
use runner_executor::{DockerExecutor, RuntimeRouter};
use runner_git::GitCheckoutManager;
use runner_scheduler::{JobExecutor, Orchestrator};

pub async fn run(config: RunnerConfig, path: &str) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read job document {path}: {e}"))?;
    let mut job: RunnableJob = serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("failed to parse job document {path}: {e}"))?;
    job.local = true;

    println!("Running job '{}/{}' locally\n", job.workflow_name, job.job_name);

    let docker = DockerExecutor::new().map_err(|e| anyhow::anyhow!("failed to connect to docker: {e}"))?;
    let runtime = Arc::new(RuntimeRouter::new(vec![Arc::new(docker)]));

    let mock = Arc::new(MockControlPlaneClient::new());
    let client: Arc<dyn runner_controlplane::ControlPlaneClient> = mock.clone();

    let git = Arc::new(GitCheckoutManager::new(config.work_dir.join("git-cache")));
    let artifacts = Arc::new(ArtifactManager::new(client.clone()));
    let job_executor = Arc::new(JobExecutor::new(runtime, client.clone(), git, artifacts, config));

    let orchestrator = Orchestrator::new(client, job_executor);
    orchestrator.run(job).await;

    println!("\n--- Step Summary ---");
    for step in mock.step_statuses() {
        let marker = match &step.error {
            Some(e) => format!("✗ failed: {e}"),
            None => "✓ succeeded".to_string(),
        };
        println!("  {:?} - {}", step.step_id, marker);
    }

    let job_failed = mock
        .job_statuses()
        .last()
        .map(|s| matches!(s.status, runner_core::job::JobStatus::Failed))
        .unwrap_or(false);

    if job_failed {
        anyhow::bail!("job failed");
    }
    println!("\n✓ Job succeeded!");
    Ok(())
}
