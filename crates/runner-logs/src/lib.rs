//! Structured log pipeline: Scrubber -> Sequencer -> FileBuffer -> Streamer.
//!
//! The FileBuffer is the durability anchor and owns the only task that
//! talks to the Streamer; everything upstream runs in-thread on the
//! caller.

pub mod error;
pub mod file_buffer;
pub mod pipeline;
pub mod scrubber;
pub mod sequencer;
pub mod streamer;

pub use error::{LogError, Result};
pub use pipeline::{LogPipeline, LogSink, NoOpLogPipeline};
