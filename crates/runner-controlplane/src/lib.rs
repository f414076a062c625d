//! Client for the control-plane API the runner polls, leases jobs from,
//! and reports status/logs/artifacts to.

pub mod client;
pub mod error;
pub mod http;
pub mod mock;

pub use client::{ArtifactSearchPage, ControlPlaneClient, LogStreamSink};
pub use error::{ClientError, Result};
pub use http::HttpControlPlaneClient;
pub use mock::MockControlPlaneClient;
