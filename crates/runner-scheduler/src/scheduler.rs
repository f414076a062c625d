//! Top-level poll loop: registers with the control plane, advertises this
//! runner's capabilities once, then repeatedly dequeues and dispatches jobs
//! up to `parallel_jobs` concurrently.

use std::sync::Arc;

use parking_lot::Mutex;
use runner_config::RunnerConfig;
use runner_controlplane::ControlPlaneClient;
use runner_core::job::RuntimeInfo;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::job_executor::JobExecutor;
use crate::orchestrator::Orchestrator;
use crate::registrar::{Registrar, RegistrationOutcome};

#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub successful_polls: u64,
    pub failed_polls: u64,
    pub jobs_dispatched: u64,
    pub jobs_in_flight: u64,
}

pub struct Scheduler {
    config: RunnerConfig,
    client: Arc<dyn ControlPlaneClient>,
    job_executor: Arc<JobExecutor>,
    supported_runtimes: Vec<String>,
    stats: Arc<Mutex<SchedulerStats>>,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    pub fn new(
        config: RunnerConfig,
        client: Arc<dyn ControlPlaneClient>,
        job_executor: Arc<JobExecutor>,
        supported_runtimes: Vec<String>,
    ) -> Self {
        Self {
            config,
            client,
            job_executor,
            supported_runtimes,
            stats: Arc::new(Mutex::new(SchedulerStats::default())),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().clone()
    }

    /// Signals the poll loop to stop after its current iteration.
    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    /// Registers, advertises runtime info, then polls until `stop` is called.
    pub async fn start(&self) {
        let registrar = Registrar::new(self.client.clone());
        if matches!(registrar.register(&self.config, &self.shutdown).await, RegistrationOutcome::Cancelled) {
            info!("scheduler stopped before registration completed");
            return;
        }

        if let Err(e) = self
            .client
            .send_runtime_info(RuntimeInfo::detect(self.supported_runtimes.clone()))
            .await
        {
            warn!(error = %e, "failed to advertise runtime info; continuing anyway");
        }

        let slots = Arc::new(Semaphore::new(self.config.parallel_jobs.max(1)));
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.notified() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.client.dequeue().await {
                Ok(Some(job)) => {
                    let mut stats = self.stats.lock();
                    stats.successful_polls += 1;
                    stats.jobs_dispatched += 1;
                    stats.jobs_in_flight += 1;
                    drop(stats);

                    info!(job_id = %job.id, workflow = %job.workflow_name, job = %job.job_name, "dispatching job");
                    let orchestrator = Orchestrator::new(self.client.clone(), self.job_executor.clone());
                    let stats = self.stats.clone();
                    in_flight.spawn(async move {
                        orchestrator.run(job).await;
                        stats.lock().jobs_in_flight -= 1;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    self.stats.lock().successful_polls += 1;
                    drop(permit);
                    if self.wait_or_shutdown().await {
                        break;
                    }
                }
                Err(e) => {
                    self.stats.lock().failed_polls += 1;
                    warn!(error = %e, "poll failed, retrying after backoff");
                    drop(permit);
                    if self.wait_or_shutdown().await {
                        break;
                    }
                }
            }
        }

        info!(jobs_in_flight = in_flight.len(), "scheduler loop exited, draining in-flight jobs");
        while in_flight.join_next().await.is_some() {}
        info!("all in-flight jobs drained");
    }

    /// Sleeps for the configured poll interval, returning early (and `true`)
    /// if `stop` is called while waiting.
    async fn wait_or_shutdown(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval()) => false,
            _ = self.shutdown.notified() => true,
        }
    }
}
