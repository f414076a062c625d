use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact upload failed: {0}")]
    UploadFailed(String),

    #[error("artifact size mismatch for {path}: expected {expected}, found {found}")]
    SizeMismatch {
        path: String,
        expected: u64,
        found: u64,
    },

    #[error("artifact hash mismatch for {path}")]
    HashMismatch { path: String },

    #[error("control plane error: {0}")]
    ControlPlane(#[from] runner_controlplane::ClientError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("glob pattern error: {0}")]
    Glob(#[from] glob::PatternError),
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

/// Collects every upload failure instead of aborting on the first one, per
/// the "no individual failure aborts the overall upload" requirement.
#[derive(Debug, Error)]
#[error("{} artifact upload(s) failed: {}", .0.len(), join_messages(.0))]
pub struct UploadErrors(pub Vec<ArtifactError>);

fn join_messages(errors: &[ArtifactError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
