//! Runner process configuration: CLI flags with environment-variable
//! fallback, matching the `clap` derive style used throughout this codebase.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

#[derive(Debug, Clone, Args)]
pub struct RunnerConfig {
    /// Base URL of the control-plane API.
    #[arg(long, env = "RUNNER_API_URL", default_value = "https://localhost:8443")]
    pub api_url: String,

    /// Client certificate used to authenticate with the control plane.
    #[arg(long, env = "RUNNER_CERT_PATH")]
    pub cert_path: Option<PathBuf>,

    /// Private key matching `cert_path`.
    #[arg(long, env = "RUNNER_KEY_PATH")]
    pub key_path: Option<PathBuf>,

    /// Generate a self-signed client certificate on first run if none exists.
    #[arg(long, env = "RUNNER_AUTO_CREATE_CERT", default_value_t = false)]
    pub auto_create_cert: bool,

    /// Interval between dequeue polls when no job is in flight.
    #[arg(long, env = "RUNNER_POLL_INTERVAL_SECS", default_value_t = 15)]
    pub poll_interval_secs: u64,

    /// Maximum number of jobs this runner executes concurrently.
    #[arg(long, env = "RUNNER_PARALLEL_JOBS", default_value_t = 1)]
    pub parallel_jobs: usize,

    /// Directory holding on-disk log buffer files.
    #[arg(long, env = "RUNNER_LOG_TEMP_DIR", default_value = "/tmp/runner/logs")]
    pub log_temp_dir: PathBuf,

    /// Directory holding per-job workspace/staging directories and the git
    /// mirror cache.
    #[arg(long, env = "RUNNER_WORK_DIR", default_value = "/tmp/runner/work")]
    pub work_dir: PathBuf,
}

impl RunnerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
