//! Control-plane client errors, distinguished the way the orchestrator and
//! scheduler need to react to them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transient transport error: {0}")]
    Transient(String),

    #[error("unauthorized: runner is not registered")]
    Unauthorized,

    #[error("optimistic concurrency conflict on {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("control-plane API error: {0}")]
    Api(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transient(_))
    }
}

impl From<ClientError> for runner_core::Error {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Transient(m) => runner_core::Error::Transient(m),
            ClientError::Unauthorized => runner_core::Error::Unauthorized("runner not registered".into()),
            ClientError::Conflict(m) => runner_core::Error::Conflict(m),
            ClientError::NotFound(m) => runner_core::Error::NotFound(m),
            ClientError::Api(m) => runner_core::Error::Internal(m),
        }
    }
}
