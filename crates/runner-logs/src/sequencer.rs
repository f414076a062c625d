//! Assigns monotonic sequence numbers (and, for line-numbered kinds, line
//! numbers) to every entry. Single-threaded on its input by construction:
//! it owns `&mut self` counters and is never shared across tasks.

use runner_core::log::LogEntry;

use crate::error::Result;
use crate::file_buffer::FileBuffer;

pub struct Sequencer {
    next_seq: u64,
    next_line_no: u64,
    next: FileBuffer,
}

impl Sequencer {
    pub fn new(next: FileBuffer) -> Self {
        Self {
            next_seq: 1,
            next_line_no: 1,
            next,
        }
    }

    pub async fn write(&mut self, mut entry: LogEntry) -> Result<()> {
        entry.seq = Some(self.next_seq);
        self.next_seq += 1;
        if entry.kind.is_line_numbered() {
            entry.line_no = Some(self.next_line_no);
            self.next_line_no += 1;
        }
        self.next.write(entry).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.next.flush().await
    }

    pub async fn close(self) -> Result<()> {
        self.next.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_core::log::LogDescriptor;
    use runner_core::ResourceId;

    #[tokio::test]
    async fn assigns_increasing_seq_and_line_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = LogDescriptor {
            id: ResourceId::new(),
            job_id: ResourceId::new(),
            step_id: None,
        };
        let fb = FileBuffer::start(descriptor, dir.path(), None).await.unwrap();
        let mut seq = Sequencer::new(fb);

        seq.write(LogEntry::line("one")).await.unwrap();
        seq.write(LogEntry::line("two")).await.unwrap();
        assert_eq!(seq.next_seq, 3);
        assert_eq!(seq.next_line_no, 3);
        seq.close().await.unwrap();
    }
}
