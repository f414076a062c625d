use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("control plane error: {0}")]
    ControlPlane(#[from] runner_controlplane::ClientError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("pipeline closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, LogError>;
