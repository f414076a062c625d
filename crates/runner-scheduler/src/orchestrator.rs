//! Drives exactly one `RunnableJob` through its lifecycle: job status,
//! dependency-ordered step walk, and the `JobExecutor` phases.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use runner_controlplane::ControlPlaneClient;
use runner_core::job::{JobStatus, RunnableJob, StepDef, StepStatus};
use runner_core::log::LogEntry;
use tracing::{error, info, warn};

use crate::dag::execution_waves;
use crate::job_executor::{JobExecutor, JobRunState};

/// Whole-job wall-clock budget for `PreExecuteJob` plus the step walk; past
/// this the remaining steps are abandoned.
const JOB_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

/// Budget for `PostExecuteJob` cleanup and the terminal status push. This
/// runs under its own deadline, independent of `JOB_TIMEOUT`, so a job that
/// times out mid-run still gets its workspace cleaned up, its artifacts
/// uploaded, and a terminal status reported to the control plane.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(2 * 60);

pub struct Orchestrator {
    client: Arc<dyn ControlPlaneClient>,
    job_executor: Arc<JobExecutor>,
}

struct StepOutcomeRecord {
    status: StepStatus,
    error: Option<String>,
}

impl Orchestrator {
    pub fn new(client: Arc<dyn ControlPlaneClient>, job_executor: Arc<JobExecutor>) -> Self {
        Self { client, job_executor }
    }

    /// Runs `job` to completion. Never returns an error: every failure mode
    /// is absorbed into a reported job/step status.
    ///
    /// `PreExecuteJob` and the step walk run under `JOB_TIMEOUT`; cleanup
    /// and the terminal status push run afterward under their own
    /// `CLEANUP_TIMEOUT`, so they still happen even when the body above was
    /// cut short by its timeout.
    pub async fn run(&self, job: RunnableJob) {
        let mut version_tag = job.version_tag.clone();
        let mut job_prepared = false;
        let mut state: Option<JobRunState> = None;

        let mut job_error = match tokio::time::timeout(
            JOB_TIMEOUT,
            self.run_job_body(&job, &mut version_tag, &mut job_prepared, &mut state),
        )
        .await
        {
            Ok(error) => error,
            Err(_) => {
                warn!(job_id = %job.id, "job exceeded its timeout budget; abandoning remaining steps");
                Some("job exceeded its timeout budget".to_string())
            }
        };

        if job_prepared {
            if let Some(run_state) = state.as_mut() {
                if let Some(err) = &job_error {
                    let _ = run_state.job_log.write(LogEntry::error(err.clone())).await;
                }
                match tokio::time::timeout(CLEANUP_TIMEOUT, self.job_executor.post_execute_job(&job, run_state)).await
                {
                    Ok(Some(fatal)) => job_error = Some(fatal),
                    Ok(None) => {}
                    Err(_) => warn!(job_id = %job.id, "post-job cleanup exceeded its own timeout budget"),
                }
            }
        }

        let terminal_status = if job_error.is_some() { JobStatus::Failed } else { JobStatus::Succeeded };
        match tokio::time::timeout(
            CLEANUP_TIMEOUT,
            self.client.update_job_status(job.id, terminal_status, job_error.clone(), &version_tag),
        )
        .await
        {
            Ok(Ok(_)) => info!(job_id = %job.id, status = ?terminal_status, "job finished"),
            Ok(Err(e)) => error!(job_id = %job.id, error = %e, "failed to report terminal job status"),
            Err(_) => error!(job_id = %job.id, "terminal job status update exceeded its own timeout budget"),
        }
    }

    async fn run_job_body(
        &self,
        job: &RunnableJob,
        version_tag: &mut String,
        job_prepared: &mut bool,
        state: &mut Option<JobRunState>,
    ) -> Option<String> {
        match self
            .client
            .update_job_status(job.id, JobStatus::Running, None, version_tag)
            .await
        {
            Ok(update) => *version_tag = update.version_tag,
            Err(e) => warn!(job_id = %job.id, error = %e, "failed to report job as running"),
        }

        let failed_dependency = job.dependencies.iter().find(|d| d.error.is_some());
        let mut job_error = failed_dependency.map(|d| format!("dependency failed: {}", d.name));

        if job_error.is_none() {
            let outcome = self.job_executor.pre_execute_job(job, version_tag).await;
            *job_prepared = outcome.job_prepared;
            job_error = outcome.error;
            *state = Some(outcome.state);
        }

        let mut step_outcomes: HashMap<String, StepOutcomeRecord> = HashMap::new();

        if let Some(run_state) = state.as_ref() {
            let waves = execution_waves(&job.steps);
            let steps_by_name: HashMap<&str, &StepDef> =
                job.steps.iter().map(|s| (s.name.as_str(), s)).collect();

            for wave in waves {
                let results = join_all(wave.iter().filter_map(|name| steps_by_name.get(name.as_str())).map(|step| {
                    self.run_step(job, run_state, step, &job_error, &step_outcomes)
                }))
                .await;

                for (name, record) in results {
                    step_outcomes.insert(name, record);
                }
            }
        }

        if job_error.is_none() {
            if let Some(first_bad) = job
                .steps
                .iter()
                .find(|s| !matches!(step_outcomes.get(&s.name), Some(r) if r.status == StepStatus::Succeeded))
            {
                job_error = Some(format!("Step failed: {}", first_bad.name));
            }
        }

        job_error
    }

    async fn run_step(
        &self,
        job: &RunnableJob,
        state: &crate::job_executor::JobRunState,
        step: &StepDef,
        job_error: &Option<String>,
        prior: &HashMap<String, StepOutcomeRecord>,
    ) -> (String, StepOutcomeRecord) {
        let mut step_version_tag = job.version_tag.clone();
        match self
            .client
            .update_step_status(step.id, StepStatus::Running, None, &step_version_tag)
            .await
        {
            Ok(update) => step_version_tag = update.version_tag,
            Err(e) => warn!(step = %step.name, error = %e, "failed to report step as running"),
        }

        let error = if let Some(job_err) = job_error {
            Some(job_err.clone())
        } else {
            let unmet = step.depends.iter().find(|dep| {
                !matches!(prior.get(dep.as_str()), Some(r) if r.status == StepStatus::Succeeded)
            });
            if let Some(dep) = unmet {
                Some(format!("dependency failed: {dep}"))
            } else {
                let outcome = self.job_executor.execute_step(job, state, step).await;
                let post_error = self.job_executor.post_execute_step(&outcome.log).await.err();
                match (outcome.error, post_error) {
                    (Some(e), _) => Some(e),
                    (None, Some(post_err)) => Some(post_err),
                    (None, None) => None,
                }
            }
        };

        let status = if error.is_none() { StepStatus::Succeeded } else { StepStatus::Failed };

        if let Err(e) = self
            .client
            .update_step_status(step.id, status, error.clone(), &step_version_tag)
            .await
        {
            warn!(step = %step.name, error = %e, "failed to report terminal step status");
        }

        (step.name.clone(), StepOutcomeRecord { status, error })
    }
}
