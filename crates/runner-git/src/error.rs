use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkout task panicked: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, GitError>;
