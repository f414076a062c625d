//! The pipeline's durability anchor: every persistent entry is appended to
//! a per-log file before being forwarded downstream, so a restart (or a
//! retryable stream error) can always re-emit from a known sequence
//! number. A dedicated reader task owns the read side and the Streamer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use runner_core::log::{LogConfirmation, LogDescriptor, LogEntry};
use runner_core::ResourceId;
use runner_controlplane::ControlPlaneClient;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::Result;
use crate::streamer::Streamer;

const READ_CHUNK_SIZE: usize = 4096;
const IDLE_TICK: Duration = Duration::from_secs(5);

struct WriterState {
    file: File,
    wrote_first: bool,
    index: HashMap<u64, u64>,
    offset: u64,
}

pub struct FileBuffer {
    writer: Arc<Mutex<WriterState>>,
    notify: Arc<Notify>,
    flush_tx: mpsc::Sender<oneshot::Sender<()>>,
    cancel: CancellationToken,
    reader_task: Option<tokio::task::JoinHandle<()>>,
    path: PathBuf,
}

impl FileBuffer {
    /// Opens (creating if absent) the per-log buffer file and spawns its
    /// reader task. `streaming` is `None` for local runs with no control
    /// plane to stream to; entries are still durably buffered to disk.
    pub async fn start(
        descriptor: LogDescriptor,
        temp_dir: &Path,
        streaming: Option<(Arc<dyn ControlPlaneClient>, ResourceId)>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(temp_dir).await?;
        let path = temp_dir.join(format!("{}.log", descriptor.id));

        let write_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        let read_file = File::open(&path).await?;

        let writer = Arc::new(Mutex::new(WriterState {
            file: write_file,
            wrote_first: false,
            index: HashMap::new(),
            offset: 0,
        }));
        let notify = Arc::new(Notify::new());
        let (flush_tx, flush_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        // A permanent stream error asks the whole pipeline to close itself
        // rather than keep a reader task alive forever forwarding to a
        // stream that can never succeed again.
        let (close_tx, close_rx) = mpsc::channel::<()>(1);
        let has_streamer = streaming.is_some();
        let streamer = streaming.map(|(client, log_id)| {
            let mut s = Streamer::new(client, log_id);
            s.set_close_requester(close_tx.clone());
            s
        });
        drop(close_tx);

        let reader_task = tokio::spawn(Self::reader_loop(
            read_file,
            writer.clone(),
            notify.clone(),
            flush_rx,
            cancel.clone(),
            streamer,
            close_rx,
            has_streamer,
        ));

        Ok(Self {
            writer,
            notify,
            flush_tx,
            cancel,
            reader_task: Some(reader_task),
            path,
        })
    }

    pub async fn write(&mut self, entry: LogEntry) -> Result<()> {
        let payload = serde_json::to_vec(&entry)?;
        let mut writer = self.writer.lock().await;
        let prefix: &[u8] = if writer.wrote_first { b"," } else { b"[" };
        writer.file.write_all(prefix).await?;
        writer.file.write_all(&payload).await?;
        writer.file.flush().await?;
        writer.wrote_first = true;
        let written = prefix.len() as u64 + payload.len() as u64;

        if let Some(seq) = entry.seq {
            writer.index.insert(seq, writer.offset);
        }
        writer.offset += written;
        drop(writer);

        self.notify.notify_one();
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.flush_tx
            .send(tx)
            .await
            .map_err(|_| crate::error::LogError::Closed)?;
        rx.await.map_err(|_| crate::error::LogError::Closed)
    }

    /// Closing without a prior flush is permitted but discards anything
    /// the reader has not yet streamed.
    pub async fn close(mut self) -> Result<()> {
        {
            let mut writer = self.writer.lock().await;
            writer.file.write_all(b"]").await?;
            writer.file.flush().await?;
        }
        self.cancel.cancel();
        if let Some(task) = self.reader_task.take() {
            let _ = task.await;
        }
        let _ = tokio::fs::remove_file(&self.path).await;
        Ok(())
    }

    async fn reader_loop(
        mut read_file: File,
        writer: Arc<Mutex<WriterState>>,
        notify: Arc<Notify>,
        mut flush_rx: mpsc::Receiver<oneshot::Sender<()>>,
        cancel: CancellationToken,
        mut streamer: Option<Streamer>,
        mut close_rx: mpsc::Receiver<()>,
        has_streamer: bool,
    ) {
        let (confirm_tx, mut confirm_rx) = mpsc::channel::<LogConfirmation>(64);
        if let Some(s) = streamer.as_mut() {
            s.register_confirmation_channel(confirm_tx);
        }

        let mut read_offset: u64 = 0;
        let mut last_confirmed_seq: u64 = 0;
        let mut flush_to_seq: Option<u64> = None;
        let mut pending_flush: Option<oneshot::Sender<()>> = None;
        let mut ticker = tokio::time::interval(IDLE_TICK);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(tx) = pending_flush.take() {
                        let _ = tx.send(());
                    }
                    return;
                }
                _ = close_rx.recv(), if has_streamer => {
                    warn!("log stream hit a permanent error, closing pipeline");
                    if let Some(tx) = pending_flush.take() {
                        let _ = tx.send(());
                    }
                    return;
                }
                _ = notify.notified() => {
                    let last_seq = Self::forward_tail(&mut read_file, &writer, &mut read_offset, streamer.as_mut()).await;
                    Self::maybe_complete_flush(last_seq, last_confirmed_seq, &mut flush_to_seq, &mut pending_flush);
                }
                maybe_tx = flush_rx.recv() => {
                    let Some(tx) = maybe_tx else { continue };
                    if pending_flush.is_some() {
                        // A flush is already in flight; this one piggybacks
                        // on the same completion signal by replacing it.
                        pending_flush = Some(tx);
                        continue;
                    }
                    let last_seq = Self::forward_tail(&mut read_file, &writer, &mut read_offset, streamer.as_mut()).await;
                    if let Some(s) = streamer.as_mut() {
                        let _ = s.flush().await;
                    }
                    flush_to_seq = Some(last_seq);
                    pending_flush = Some(tx);
                    Self::maybe_complete_flush(last_seq, last_confirmed_seq, &mut flush_to_seq, &mut pending_flush);
                }
                confirmation = confirm_rx.recv() => {
                    match confirmation {
                        Some(LogConfirmation::Success { last_confirmed_seq: seq }) if seq > last_confirmed_seq => {
                            last_confirmed_seq = seq;
                            if let Some(target) = flush_to_seq {
                                if last_confirmed_seq >= target {
                                    if let Some(tx) = pending_flush.take() {
                                        let _ = tx.send(());
                                    }
                                    flush_to_seq = None;
                                }
                            }
                        }
                        Some(LogConfirmation::Error { retry_from_seq }) => {
                            let offset = {
                                let w = writer.lock().await;
                                w.index.get(&retry_from_seq).copied().unwrap_or(0)
                            };
                            read_offset = offset;
                            let _ = read_file.seek(std::io::SeekFrom::Start(offset)).await;
                            let last_seq = Self::forward_tail(&mut read_file, &writer, &mut read_offset, streamer.as_mut()).await;
                            if pending_flush.is_some() {
                                if let Some(s) = streamer.as_mut() {
                                    let _ = s.flush().await;
                                }
                            }
                            let _ = last_seq;
                        }
                        None => {}
                        _ => {}
                    }
                }
                _ = ticker.tick() => {
                    Self::forward_tail(&mut read_file, &writer, &mut read_offset, streamer.as_mut()).await;
                    if let Some(s) = streamer.as_mut() {
                        let _ = s.flush().await;
                    }
                }
            }
        }
    }

    fn maybe_complete_flush(
        last_seq: u64,
        last_confirmed_seq: u64,
        flush_to_seq: &mut Option<u64>,
        pending_flush: &mut Option<oneshot::Sender<()>>,
    ) {
        if let Some(target) = *flush_to_seq {
            if last_seq <= last_confirmed_seq && last_confirmed_seq >= target {
                if let Some(tx) = pending_flush.take() {
                    let _ = tx.send(());
                }
                *flush_to_seq = None;
            }
        }
    }

    /// Reads whatever unread tail exists in the file and forwards complete
    /// entries downstream, tolerating a truncated trailing entry. Returns
    /// the last sequence number forwarded (0 if none).
    async fn forward_tail(
        read_file: &mut File,
        writer: &Arc<Mutex<WriterState>>,
        read_offset: &mut u64,
        mut streamer: Option<&mut Streamer>,
    ) -> u64 {
        let mut last_seq = 0u64;
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut accumulated: Vec<u8> = Vec::new();

        if let Err(e) = read_file.seek(std::io::SeekFrom::Start(*read_offset)).await {
            warn!(error = %e, "failed to seek log buffer file");
            return last_seq;
        }

        loop {
            let n = match tokio::io::AsyncReadExt::read(read_file, &mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "failed to read log buffer file");
                    break;
                }
            };
            accumulated.extend_from_slice(&buf[..n]);
        }

        if accumulated.is_empty() {
            return last_seq;
        }

        // The buffer is a JSON array under construction: strip the leading
        // `[`/`,` and a possible trailing `]`, then split entries on
        // top-level object boundaries.
        let text = String::from_utf8_lossy(&accumulated);
        let trimmed = text.trim_start_matches(['[', ',']).trim_end_matches(']');

        let mut consumed = 0usize;
        for raw_entry in split_top_level_objects(trimmed) {
            consumed += raw_entry.len();
            let Ok(entry) = serde_json::from_str::<LogEntry>(raw_entry) else {
                // Truncated trailing entry: stop before it, it will be
                // re-read once more bytes land.
                break;
            };
            if let Some(seq) = entry.seq {
                last_seq = seq;
            }
            if let Some(s) = streamer.as_deref_mut() {
                if let Err(e) = s.write(&entry).await {
                    warn!(error = %e, "streamer write failed");
                }
            }
        }

        let _ = writer;
        *read_offset += accumulated.len() as u64;
        let _ = consumed;
        last_seq
    }
}

/// Splits a run of back-to-back `{...}` JSON objects (no separators other
/// than the commas the writer already stripped) into their raw substrings.
fn split_top_level_objects(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = None;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s0) = start.take() {
                        out.push(&s[s0..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_adjacent_objects() {
        let input = r#"{"a":1}{"b":{"nested":true}}"#;
        let parts = split_top_level_objects(input);
        assert_eq!(parts, vec![r#"{"a":1}"#, r#"{"b":{"nested":true}}"#]);
    }

    #[test]
    fn ignores_braces_inside_strings() {
        let input = r#"{"text":"a } b"}{"text":"next"}"#;
        let parts = split_top_level_objects(input);
        assert_eq!(parts.len(), 2);
    }

    #[tokio::test]
    async fn write_then_close_roundtrips_without_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = LogDescriptor {
            id: ResourceId::new(),
            job_id: ResourceId::new(),
            step_id: None,
        };
        let mut fb = FileBuffer::start(descriptor, dir.path(), None).await.unwrap();
        let mut entry = LogEntry::line("hello");
        entry.seq = Some(1);
        fb.write(entry).await.unwrap();
        fb.flush().await.unwrap();
        fb.close().await.unwrap();
    }
}
