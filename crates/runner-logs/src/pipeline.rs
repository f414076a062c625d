//! Public surface handed to the executor: a structured logger plus a
//! plaintext-to-structured adapter for child-process stdout/stderr. A
//! `NoOp` implementation is used whenever no log handle is available so
//! callers never need a null check.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use runner_core::log::{LogDescriptor, LogEntry};
use runner_core::secret::SecretStore;
use runner_controlplane::ControlPlaneClient;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::file_buffer::FileBuffer;
use crate::scrubber::Scrubber;
use crate::sequencer::Sequencer;

#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write(&self, entry: LogEntry) -> Result<()>;
    async fn flush(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// The full Scrubber -> Sequencer -> FileBuffer(-> Streamer) chain.
pub struct LogPipeline {
    scrubber: Mutex<Option<Scrubber>>,
}

impl LogPipeline {
    pub async fn start(
        descriptor: LogDescriptor,
        temp_dir: &Path,
        secrets: &SecretStore,
        client: Option<Arc<dyn ControlPlaneClient>>,
    ) -> Result<Self> {
        let streaming = client.map(|c| (c, descriptor.id));
        let file_buffer = FileBuffer::start(descriptor, temp_dir, streaming).await?;
        let sequencer = Sequencer::new(file_buffer);
        let scrubber = Scrubber::new(secrets, sequencer);
        Ok(Self {
            scrubber: Mutex::new(Some(scrubber)),
        })
    }

    /// Adapts a byte stream (a child process's stdout/stderr) into
    /// line-delimited `Line` entries with current-clock timestamps.
    pub async fn write_stdout_chunk(&self, bytes: &[u8]) -> Result<()> {
        for line in String::from_utf8_lossy(bytes).lines() {
            self.write(LogEntry::line(line.to_string())).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl LogSink for LogPipeline {
    async fn write(&self, entry: LogEntry) -> Result<()> {
        let mut guard = self.scrubber.lock().await;
        match guard.as_mut() {
            Some(scrubber) => scrubber.write(entry).await,
            None => Err(crate::error::LogError::Closed),
        }
    }

    async fn flush(&self) -> Result<()> {
        let mut guard = self.scrubber.lock().await;
        match guard.as_mut() {
            Some(scrubber) => scrubber.flush().await,
            None => Err(crate::error::LogError::Closed),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.scrubber.lock().await;
        match guard.take() {
            Some(scrubber) => scrubber.close().await,
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct NoOpLogPipeline;

#[async_trait]
impl LogSink for NoOpLogPipeline {
    async fn write(&self, _entry: LogEntry) -> Result<()> {
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_core::ResourceId;

    #[tokio::test]
    async fn noop_pipeline_accepts_every_call() {
        let sink = NoOpLogPipeline;
        sink.write(LogEntry::line("ignored")).await.unwrap();
        sink.flush().await.unwrap();
        sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn pipeline_without_control_plane_still_buffers_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = LogDescriptor {
            id: ResourceId::new(),
            job_id: ResourceId::new(),
            step_id: None,
        };
        let secrets = SecretStore::default();
        let pipeline = LogPipeline::start(descriptor, dir.path(), &secrets, None)
            .await
            .unwrap();
        pipeline.write(LogEntry::line("hello")).await.unwrap();
        pipeline.close().await.unwrap();
    }
}
