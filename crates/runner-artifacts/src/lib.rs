//! Artifact upload and download, driven from the job executor's
//! PostExecuteJob and PreExecuteJob phases respectively.

pub mod error;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use blake2::{Blake2b512, Digest};
use bytes::Bytes;
use runner_config::VariableContext;
use runner_core::artifact::HashKind;
use runner_core::job::{ArtifactDef, ArtifactDependency};
use runner_core::ResourceId;
use runner_controlplane::ControlPlaneClient;
use tracing::{debug, warn};

pub use error::{ArtifactError, Result, UploadErrors};

pub struct ArtifactManager {
    client: Arc<dyn ControlPlaneClient>,
}

impl ArtifactManager {
    pub fn new(client: Arc<dyn ControlPlaneClient>) -> Self {
        Self { client }
    }

    /// Glob-resolves each artifact definition's raw paths against the
    /// workspace, uploading every matching regular file. Individual
    /// failures are collected rather than aborting the whole upload.
    pub async fn upload(
        &self,
        job_id: ResourceId,
        workspace: &Path,
        artifacts: &[ArtifactDef],
        env: &VariableContext,
    ) -> std::result::Result<(), UploadErrors> {
        let mut errors = Vec::new();

        for def in artifacts {
            for raw_path in &def.raw_paths {
                let resolved = env.interpolate(raw_path);
                let matches = match self.resolve_glob(workspace, &resolved) {
                    Ok(paths) => paths,
                    Err(e) => {
                        errors.push(e);
                        continue;
                    }
                };
                for path in matches {
                    if path.is_dir() {
                        continue;
                    }
                    if let Err(e) = self.upload_one(job_id, workspace, &def.group, &path).await {
                        errors.push(e);
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(UploadErrors(errors))
        }
    }

    fn resolve_glob(&self, workspace: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
        let absolute = workspace.join(pattern);
        let pattern_str = absolute.to_string_lossy().into_owned();
        let mut paths = Vec::new();
        for entry in glob::glob(&pattern_str)? {
            match entry {
                Ok(path) => paths.push(path),
                Err(e) => warn!(error = %e, "skipping unreadable glob entry"),
            }
        }
        Ok(paths)
    }

    async fn upload_one(
        &self,
        job_id: ResourceId,
        workspace: &Path,
        group: &str,
        path: &Path,
    ) -> Result<()> {
        let relative_path = path
            .strip_prefix(workspace)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned();
        let bytes = tokio::fs::read(path).await?;
        let md5_hex = format!("{:x}", md5::compute(&bytes));
        self.client
            .create_artifact(job_id, group, &relative_path, Bytes::from(bytes), Some(&md5_hex))
            .await
            .map_err(|e| ArtifactError::UploadFailed(e.to_string()))?;
        debug!(group, relative_path, "uploaded artifact");
        Ok(())
    }

    /// Pages through every declared artifact dependency and materialises
    /// matching files into `workspace`, skipping downloads whose existing
    /// on-disk copy already matches the declared size and hash.
    pub async fn download(
        &self,
        build_id: ResourceId,
        workspace: &Path,
        dependencies: &[ArtifactDependency],
    ) -> Result<()> {
        for dep in dependencies {
            let mut cursor: Option<String> = None;
            loop {
                let page = self
                    .client
                    .search_artifacts(build_id, &dep.workflow, &dep.job, &dep.group, cursor.as_deref())
                    .await?;
                for item in &page.items {
                    self.download_one(workspace, item).await?;
                }
                cursor = page.next_cursor;
                if cursor.is_none() {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn download_one(
        &self,
        workspace: &Path,
        item: &runner_core::artifact::ArtifactDownload,
    ) -> Result<()> {
        let target = workspace.join(&item.relative_path);

        if let Ok(metadata) = tokio::fs::metadata(&target).await {
            if metadata.len() != item.size {
                return Err(ArtifactError::SizeMismatch {
                    path: item.relative_path.clone(),
                    expected: item.size,
                    found: metadata.len(),
                });
            }
            let existing = tokio::fs::read(&target).await?;
            if hash_hex(item.hash_kind, &existing) == item.hash {
                debug!(path = %item.relative_path, "artifact already present, skipping download");
                return Ok(());
            }
            return Err(ArtifactError::HashMismatch {
                path: item.relative_path.clone(),
            });
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
            set_open_permissions(parent).await;
        }
        let data = self.client.get_artifact_data(item.id).await?;
        tokio::fs::write(&target, &data).await?;
        debug!(path = %item.relative_path, "downloaded artifact");
        Ok(())
    }
}

fn hash_hex(kind: HashKind, data: &[u8]) -> String {
    match kind {
        HashKind::Blake2b => {
            let mut hasher = Blake2b512::new();
            hasher.update(data);
            hex::encode(hasher.finalize())
        }
        HashKind::Md5 => format!("{:x}", md5::compute(data)),
    }
}

#[cfg(unix)]
async fn set_open_permissions(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777)).await;
}

#[cfg(not(unix))]
async fn set_open_permissions(_dir: &Path) {}

/// Builds a `VariableContext` that only carries the global environment map,
/// used when resolving artifact raw paths outside a step's own context.
pub fn env_only_context(env: HashMap<String, String>) -> VariableContext {
    let mut ctx = VariableContext::default();
    ctx.env = env;
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_hex_blake2b_matches_known_digest() {
        let digest = hash_hex(HashKind::Blake2b, b"hello");
        assert_eq!(digest.len(), 128);
    }

    #[test]
    fn hash_hex_md5_matches_known_digest() {
        let digest = hash_hex(HashKind::Md5, b"hello");
        assert_eq!(digest, format!("{:x}", md5::compute(b"hello")));
    }
}
