//! Estela - batched, backpressured trace-event recording
//!
//! Producer threads hand pre-built rows to a per-table [`table::Table`]; a
//! bounded ring buffer absorbs bursts and blocks producers when full, and a
//! background worker per table writes full batches into SQLite, one
//! transaction per batch. At shutdown every table is flushed and its staged
//! rows merged into permanent storage, exactly once, even from a process-exit
//! hook.
//!
//! Events can carry their call stack: [`stack_capture`] resolves frames
//! in-process (`native-unwind` feature) or through an external helper
//! (`external-helper` feature), and frame text is interned through
//! [`string_table`].

pub mod batch_writer;
pub mod cli;
pub mod config;
pub mod exit_hook;
pub mod overhead;
pub mod ring_buffer;
pub mod rows;
pub mod session;
pub mod stack_capture;
pub mod string_table;
pub mod table;
pub mod workload;

pub use config::{PipelineConfig, TracerConfig};
pub use rows::{CopyApiRow, CopyKind, StackFrameRow, TableRow};
pub use session::{FinalizeSummary, Session};
pub use table::{Table, TableStats};
