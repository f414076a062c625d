//! Partitions the sequenced entry flow into bounded outbound HTTP streams
//! and reports success/error back to the FileBuffer over a confirmation
//! channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use runner_core::log::{LogConfirmation, LogEntry};
use runner_core::ResourceId;
use runner_controlplane::{ControlPlaneClient, LogStreamSink};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;

const MAX_STREAM_SIZE: usize = 10_000;
const MAX_STREAM_DURATION: Duration = Duration::from_secs(60);

struct OpenStream {
    sink: Box<dyn LogStreamSink>,
    first_seq_no: u64,
    last_seq_no_written: u64,
    entry_count: usize,
    opened_at: Instant,
    wrote_first: bool,
}

pub struct Streamer {
    client: Arc<dyn ControlPlaneClient>,
    log_id: ResourceId,
    open: Option<OpenStream>,
    waiting_for_retry: Option<u64>,
    log_closed: bool,
    confirmations: Vec<mpsc::Sender<LogConfirmation>>,
    close_requester: Option<mpsc::Sender<()>>,
}

impl Streamer {
    pub fn new(client: Arc<dyn ControlPlaneClient>, log_id: ResourceId) -> Self {
        Self {
            client,
            log_id,
            open: None,
            waiting_for_retry: None,
            log_closed: false,
            confirmations: Vec::new(),
            close_requester: None,
        }
    }

    /// Registers a channel that receives every confirmation in emission
    /// order. The Streamer never blocks on delivery; callers must use a
    /// buffered channel.
    pub fn register_confirmation_channel(&mut self, tx: mpsc::Sender<LogConfirmation>) {
        self.confirmations.push(tx);
    }

    /// Non-blocking callback invoked when a permanent stream error forces
    /// the whole pipeline closed.
    pub fn set_close_requester(&mut self, tx: mpsc::Sender<()>) {
        self.close_requester = Some(tx);
    }

    pub async fn write(&mut self, entry: &LogEntry) -> Result<()> {
        if self.log_closed {
            return Ok(());
        }

        if let Some(retry_from) = self.waiting_for_retry {
            match entry.seq {
                Some(seq) if seq < retry_from => return Ok(()),
                Some(seq) if seq == retry_from => {
                    self.waiting_for_retry = None;
                }
                _ => return Ok(()),
            }
        }

        if self.open.is_none() {
            self.open_stream(entry.seq.unwrap_or(0)).await?;
        }

        let payload = serde_json::to_vec(entry)?;
        let is_persistent = entry.seq.is_some();

        let write_result = {
            let open = self.open.as_mut().expect("just opened");
            let mut chunk = Vec::with_capacity(payload.len() + 1);
            chunk.push(if open.wrote_first { b',' } else { b'[' });
            chunk.extend_from_slice(&payload);
            open.wrote_first = true;
            open.sink
                .write_chunk(chunk.into())
                .await
                .map_err(crate::error::LogError::from)
        };

        match write_result {
            Ok(()) => {
                let open = self.open.as_mut().expect("just opened");
                if is_persistent {
                    open.entry_count += 1;
                    open.last_seq_no_written = entry.seq.unwrap();
                }
                if open.entry_count >= MAX_STREAM_SIZE || open.opened_at.elapsed() >= MAX_STREAM_DURATION {
                    self.close_stream_normal().await?;
                }
                Ok(())
            }
            Err(e) => self.handle_write_error(e).await,
        }
    }

    pub async fn flush(&mut self) -> Result<()> {
        if self.open.is_some() {
            self.close_stream_normal().await?;
        }
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        if self.open.is_some() {
            self.close_stream_normal().await?;
        }
        Ok(())
    }

    async fn open_stream(&mut self, first_seq_no: u64) -> Result<()> {
        let sink = self.client.open_log_write_stream(self.log_id).await?;
        self.open = Some(OpenStream {
            sink,
            first_seq_no,
            last_seq_no_written: first_seq_no,
            entry_count: 0,
            opened_at: Instant::now(),
            wrote_first: false,
        });
        Ok(())
    }

    async fn close_stream_normal(&mut self) -> Result<()> {
        let Some(mut open) = self.open.take() else {
            return Ok(());
        };
        if open.wrote_first {
            open.sink.write_chunk(b"]".to_vec().into()).await?;
        }
        open.sink.finish().await?;
        debug!(log_id = %self.log_id, last_seq_no = open.last_seq_no_written, "closed log stream");
        self.emit_confirmation(LogConfirmation::Success {
            last_confirmed_seq: open.last_seq_no_written,
        })
        .await;
        Ok(())
    }

    async fn handle_write_error(&mut self, e: crate::error::LogError) -> Result<()> {
        let retryable = matches!(
            &e,
            crate::error::LogError::ControlPlane(ce) if ce.is_retryable()
        );
        let open = self.open.take();
        let had_persistent_entry = open.as_ref().map(|o| o.entry_count > 0).unwrap_or(false);

        if retryable && had_persistent_entry {
            let first_seq_no = open.map(|o| o.first_seq_no).unwrap_or(0);
            warn!(log_id = %self.log_id, first_seq_no, "stream write failed, will retry");
            self.waiting_for_retry = Some(first_seq_no);
            self.emit_confirmation(LogConfirmation::Error {
                retry_from_seq: first_seq_no,
            })
            .await;
        } else {
            warn!(log_id = %self.log_id, error = %e, "permanent stream error, closing pipeline");
            self.log_closed = true;
            if let Some(tx) = &self.close_requester {
                let _ = tx.try_send(());
            }
        }
        Ok(())
    }

    async fn emit_confirmation(&self, confirmation: LogConfirmation) {
        for tx in &self.confirmations {
            let _ = tx.try_send(confirmation.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use runner_controlplane::{ArtifactSearchPage, ClientError};
    use runner_core::artifact::HashKind;
    use runner_core::job::{JobStatus, JobUpdateResult, RunnableJob, RuntimeInfo, StepStatus, StepUpdateResult};
    use runner_core::secret::Secret;

    struct FailingSink;

    #[async_trait]
    impl LogStreamSink for FailingSink {
        async fn write_chunk(&mut self, _chunk: Bytes) -> runner_controlplane::Result<()> {
            Err(ClientError::Api("stream rejected".into()))
        }

        async fn finish(self: Box<Self>) -> runner_controlplane::Result<()> {
            Ok(())
        }
    }

    /// Only `open_log_write_stream` is exercised by this module's tests.
    struct FailingClient;

    #[async_trait]
    impl ControlPlaneClient for FailingClient {
        async fn ping(&self) -> runner_controlplane::Result<()> {
            unimplemented!()
        }
        async fn send_runtime_info(&self, _info: RuntimeInfo) -> runner_controlplane::Result<()> {
            unimplemented!()
        }
        async fn dequeue(&self) -> runner_controlplane::Result<Option<RunnableJob>> {
            unimplemented!()
        }
        async fn update_job_status(
            &self,
            _job_id: ResourceId,
            _status: JobStatus,
            _error: Option<String>,
            _version_tag: &str,
        ) -> runner_controlplane::Result<JobUpdateResult> {
            unimplemented!()
        }
        async fn update_job_fingerprint(
            &self,
            _job_id: ResourceId,
            _fingerprint: &str,
            _hash_kind: HashKind,
            _version_tag: &str,
        ) -> runner_controlplane::Result<JobUpdateResult> {
            unimplemented!()
        }
        async fn update_step_status(
            &self,
            _step_id: ResourceId,
            _status: StepStatus,
            _error: Option<String>,
            _version_tag: &str,
        ) -> runner_controlplane::Result<StepUpdateResult> {
            unimplemented!()
        }
        async fn get_secrets_plaintext(&self, _repo_id: ResourceId) -> runner_controlplane::Result<Vec<Secret>> {
            unimplemented!()
        }
        async fn create_artifact(
            &self,
            _job_id: ResourceId,
            _group: &str,
            _relative_path: &str,
            _body: Bytes,
            _md5_hex: Option<&str>,
        ) -> runner_controlplane::Result<()> {
            unimplemented!()
        }
        async fn get_artifact_data(&self, _artifact_id: ResourceId) -> runner_controlplane::Result<Bytes> {
            unimplemented!()
        }
        async fn search_artifacts(
            &self,
            _build_id: ResourceId,
            _workflow: &str,
            _job: &str,
            _group: &str,
            _cursor: Option<&str>,
        ) -> runner_controlplane::Result<ArtifactSearchPage> {
            unimplemented!()
        }
        async fn open_log_write_stream(&self, _log_id: ResourceId) -> runner_controlplane::Result<Box<dyn LogStreamSink>> {
            Ok(Box::new(FailingSink))
        }
    }

    #[tokio::test]
    async fn permanent_stream_error_requests_pipeline_close() {
        let mut streamer = Streamer::new(Arc::new(FailingClient), ResourceId::new());
        let (close_tx, mut close_rx) = mpsc::channel::<()>(1);
        streamer.set_close_requester(close_tx);

        let mut entry = LogEntry::line("hello");
        entry.seq = Some(1);

        streamer.write(&entry).await.unwrap();

        assert!(close_rx.try_recv().is_ok(), "a permanent write failure must request pipeline close");
    }
}
