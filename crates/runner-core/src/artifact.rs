//! Artifact data model as seen from the runner side: the control plane owns
//! storage, the runner only uploads producer files and downloads declared
//! dependencies.

use serde::{Deserialize, Serialize};

use crate::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    Blake2b,
    Md5,
}

/// A single artifact dependency's download-side record, as returned by
/// `SearchArtifacts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDownload {
    pub id: ResourceId,
    /// Path relative to the job workspace where the artifact is written.
    pub relative_path: String,
    pub size: u64,
    pub hash_kind: HashKind,
    pub hash: String,
}
