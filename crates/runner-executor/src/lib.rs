//! Concrete `Executor` backends: Docker containers and direct host-shell
//! processes.

pub mod docker;
pub mod host_shell;
pub mod router;

pub use docker::DockerExecutor;
pub use host_shell::HostShellExecutor;
pub use router::RuntimeRouter;
