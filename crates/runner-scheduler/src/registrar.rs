//! Blocking registration handshake the scheduler runs once at startup: keep
//! calling `Ping` until the control plane accepts the runner's client
//! certificate, or until told to give up.

use std::sync::Arc;
use std::time::Duration;

use runner_controlplane::{ClientError, ControlPlaneClient};
use runner_config::RunnerConfig;
use tokio::sync::Notify;
use tracing::{info, warn};

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub enum RegistrationOutcome {
    Registered,
    Cancelled,
}

pub struct Registrar {
    client: Arc<dyn ControlPlaneClient>,
}

impl Registrar {
    pub fn new(client: Arc<dyn ControlPlaneClient>) -> Self {
        Self { client }
    }

    /// Retries `Ping` until it succeeds or `shutdown` is notified. On an
    /// `Unauthorized` response the certificate-install hint is printed once,
    /// then retries continue silently -- the operator may be mid-approval.
    pub async fn register(&self, config: &RunnerConfig, shutdown: &Notify) -> RegistrationOutcome {
        let mut backoff = MIN_BACKOFF;
        let mut warned_unauthorized = false;

        loop {
            match self.client.ping().await {
                Ok(()) => {
                    info!("registered with control plane");
                    return RegistrationOutcome::Registered;
                }
                Err(ClientError::Unauthorized) => {
                    if !warned_unauthorized {
                        let cert_path = config
                            .cert_path
                            .as_deref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| "(none configured)".to_string());
                        warn!(
                            cert_path = %cert_path,
                            "runner certificate not yet approved; install this runner's certificate on the control plane and it will be picked up automatically",
                        );
                        warned_unauthorized = true;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "registration ping failed, retrying");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.notified() => return RegistrationOutcome::Cancelled,
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}
