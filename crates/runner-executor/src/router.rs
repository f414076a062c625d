//! Dispatches to whichever registered backend can handle a given job's
//! runtime kind. `JobExecutor` is written against a single `Arc<dyn
//! Executor>`; this router lets that single handle still mean "Docker for
//! container jobs, host-shell for bare ones" within one runner process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use runner_core::execution::{
    ExecutionHandle, ExecutionResult, ExecutionSpec, ExecutionStatus, Executor, LogLine,
    RegistryCredentials,
};
use runner_core::{Error, Result};

pub struct RuntimeRouter {
    backends: Vec<Arc<dyn Executor>>,
}

impl RuntimeRouter {
    pub fn new(backends: Vec<Arc<dyn Executor>>) -> Self {
        Self { backends }
    }

    fn backend_for(&self, backend_name: &str) -> Result<&Arc<dyn Executor>> {
        self.backends
            .iter()
            .find(|b| b.name() == backend_name)
            .ok_or_else(|| Error::Internal(format!("no registered executor backend named {backend_name}")))
    }
}

#[async_trait]
impl Executor for RuntimeRouter {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn can_execute(&self, spec: &ExecutionSpec) -> bool {
        for backend in &self.backends {
            if backend.can_execute(spec).await {
                return true;
            }
        }
        false
    }

    async fn spawn(
        &self,
        spec: ExecutionSpec,
        registry_auth: Option<RegistryCredentials>,
    ) -> Result<ExecutionHandle> {
        for backend in &self.backends {
            if backend.can_execute(&spec).await {
                return backend.spawn(spec, registry_auth).await;
            }
        }
        Err(Error::InvalidInput("no registered executor backend can run this spec".into()))
    }

    async fn logs(&self, handle: &ExecutionHandle) -> Result<BoxStream<'static, LogLine>> {
        self.backend_for(handle.backend_name)?.logs(handle).await
    }

    async fn status(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus> {
        self.backend_for(handle.backend_name)?.status(handle).await
    }

    async fn wait(&self, handle: &ExecutionHandle) -> Result<ExecutionResult> {
        self.backend_for(handle.backend_name)?.wait(handle).await
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<()> {
        self.backend_for(handle.backend_name)?.cancel(handle).await
    }

    async fn start_service(
        &self,
        name: &str,
        image: &str,
        env: HashMap<String, String>,
    ) -> Result<ExecutionHandle> {
        // Services are always container-based.
        self.backend_for("docker")?.start_service(name, image, env).await
    }

    async fn cleanup_stale(&self) -> Result<()> {
        for backend in &self.backends {
            backend.cleanup_stale().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_shell::HostShellExecutor;

    #[tokio::test]
    async fn routes_imageless_spec_to_host_shell() {
        let router = RuntimeRouter::new(vec![Arc::new(HostShellExecutor::new())]);
        let spec = ExecutionSpec {
            id: runner_core::ResourceId::new(),
            image: None,
            command: vec!["true".to_string()],
            working_dir: None,
            env: HashMap::new(),
            resources: Default::default(),
            timeout: None,
            volumes: vec![],
        };
        let handle = router.spawn(spec, None).await.unwrap();
        assert_eq!(handle.backend_name, "host-shell");
    }

    #[tokio::test]
    async fn rejects_when_no_backend_can_execute() {
        let router = RuntimeRouter::new(vec![]);
        let spec = ExecutionSpec {
            id: runner_core::ResourceId::new(),
            image: None,
            command: vec!["true".to_string()],
            working_dir: None,
            env: HashMap::new(),
            resources: Default::default(),
            timeout: None,
            volumes: vec![],
        };
        assert!(router.spawn(spec, None).await.is_err());
    }
}
