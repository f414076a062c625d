//! Log entry and confirmation types shared by every stage of the log
//! pipeline. Modelled as a tagged sum rather than an inheritance hierarchy:
//! persistence-relevant fields (sequence, line number) live on the common
//! header so the sequencer never has to know every variant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;

/// The payload of a log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEntryKind {
    Line { text: String },
    Error { text: String },
    BlockOpen { name: String },
}

impl LogEntryKind {
    /// Entries that occupy a line-number slot; `BlockOpen` does not.
    pub fn is_line_numbered(&self) -> bool {
        matches!(self, LogEntryKind::Line { .. } | LogEntryKind::Error { .. })
    }
}

/// One entry flowing through the pipeline.
///
/// `seq` and `line_no` start unset and are assigned by the Sequencer stage;
/// everything upstream of the Sequencer carries them as `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub block: Option<ResourceId>,
    pub kind: LogEntryKind,
    pub seq: Option<u64>,
    pub line_no: Option<u64>,
}

impl LogEntry {
    pub fn line(text: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            block: None,
            kind: LogEntryKind::Line { text: text.into() },
            seq: None,
            line_no: None,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            block: None,
            kind: LogEntryKind::Error { text: text.into() },
            seq: None,
            line_no: None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            LogEntryKind::Line { text } | LogEntryKind::Error { text } => Some(text),
            LogEntryKind::BlockOpen { .. } => None,
        }
    }

    pub fn with_text(&self, text: String) -> Self {
        let kind = match &self.kind {
            LogEntryKind::Line { .. } => LogEntryKind::Line { text },
            LogEntryKind::Error { .. } => LogEntryKind::Error { text },
            other => other.clone(),
        };
        Self {
            kind,
            ..self.clone()
        }
    }
}

/// Back-channel message from the Streamer to the FileBuffer.
#[derive(Debug, Clone)]
pub enum LogConfirmation {
    Success { last_confirmed_seq: u64 },
    Error { retry_from_seq: u64 },
}

/// Identifies which log a descriptor belongs to (job-scoped or step-scoped).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LogDescriptor {
    pub id: ResourceId,
    pub job_id: ResourceId,
    pub step_id: Option<ResourceId>,
}
