//! `runner run`: the long-lived daemon. Registers with the control plane
//! and polls it for jobs until interrupted.

use std::sync::Arc;

use runner_artifacts::ArtifactManager;
use runner_config::RunnerConfig;
use runner_controlplane::HttpControlPlaneClient;
use runner_executor::{DockerExecutor, HostShellExecutor, RuntimeRouter};
use runner_git::GitCheckoutManager;
use runner_scheduler::{JobExecutor, Scheduler};
use tracing::{info, warn};

pub async fn run(config: RunnerConfig) -> anyhow::Result<()> {
    let http_client = build_http_client(&config)?;
    let client: Arc<dyn runner_controlplane::ControlPlaneClient> =
        Arc::new(HttpControlPlaneClient::new(config.api_url.clone(), http_client));

    let mut backends: Vec<Arc<dyn runner_core::execution::Executor>> = vec![Arc::new(HostShellExecutor::new())];
    match DockerExecutor::new() {
        Ok(docker) => backends.push(Arc::new(docker)),
        Err(e) => warn!(error = %e, "docker unavailable, this runner will only execute host-shell jobs"),
    }
    let runtime = Arc::new(RuntimeRouter::new(backends));

    let git = Arc::new(GitCheckoutManager::new(config.work_dir.join("git-cache")));
    let artifacts = Arc::new(ArtifactManager::new(client.clone()));
    let job_executor = Arc::new(JobExecutor::new(runtime.clone(), client.clone(), git, artifacts, config.clone()));

    let supported_runtimes = vec!["docker".to_string(), "host".to_string()];
    let scheduler = Arc::new(Scheduler::new(config, client, job_executor, supported_runtimes));

    let shutdown_scheduler = scheduler.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
        shutdown_scheduler.stop();
    });

    scheduler.start().await;
    Ok(())
}

fn build_http_client(config: &RunnerConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();

    match (&config.cert_path, &config.key_path) {
        (Some(cert_path), Some(key_path)) if cert_path.exists() && key_path.exists() => {
            let mut pem = std::fs::read(cert_path)?;
            pem.extend(std::fs::read(key_path)?);
            let identity = reqwest::Identity::from_pem(&pem)?;
            builder = builder.identity(identity);
        }
        (Some(_), Some(_)) if config.auto_create_cert => {
            warn!("auto-create-cert is set but certificate auto-generation is not implemented in this build; continuing without a client certificate");
        }
        _ => {
            warn!("no client certificate configured; the control plane will reject this runner until one is provided");
        }
    }

    Ok(builder.build()?)
}
