//! Trace session: every table pipeline plus stack capture
//!
//! A session owns one [`Table`] per record kind, each with its own
//! connection, buffer and drain worker:
//!
//! ```text
//! record_copy(api, row) ──► estela_copyapi
//!        │
//!        └─ unwind(api, id) ──► frames ──► estela_string (interned text)
//!                                     └──► estela_stackframe
//! every batch write ──────────────────────► estela_overhead
//! ```
//!
//! Finalization runs once per session, from an explicit call or from the
//! process-exit hook registered when the first event is captured.

use crate::batch_writer::StorageError;
use crate::config::{ConfigError, TracerConfig};
use crate::exit_hook::{self, ExitFinalize};
use crate::overhead::{OverheadRow, OverheadSink};
use crate::rows::{CopyApiRow, StackFrameRow, TableRow};
use crate::stack_capture::{command_launcher, StackCapture};
use crate::string_table::StringTable;
use crate::table::{Table, TableStats};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{info, warn};

/// Errors opening a session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Rows merged into permanent storage per table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FinalizeSummary {
    pub copy_api: usize,
    pub stack_frames: usize,
    pub strings: usize,
    pub overhead: usize,
}

pub struct Session {
    config: TracerConfig,
    copy_api: Table<CopyApiRow>,
    stack_frames: Table<StackFrameRow>,
    strings: StringTable,
    overhead: Arc<Table<OverheadRow>>,
    capture: StackCapture,
    finalized: AtomicBool,
    self_ref: Weak<Session>,
}

impl Session {
    /// Open a session with the capture strategy named in `config`
    pub fn open(config: TracerConfig) -> Result<Arc<Self>, SessionError> {
        let capture = StackCapture::new(
            &config.stack_frames,
            config.skip_frames,
            command_launcher(config.helper_command.clone()),
        );
        Self::with_capture(config, capture)
    }

    /// Open a session with an explicit capture
    pub fn with_capture(
        config: TracerConfig,
        capture: StackCapture,
    ) -> Result<Arc<Self>, SessionError> {
        config.validate()?;
        let pipeline = config.pipeline();
        let path = config.output.as_path();

        let overhead = Arc::new(Table::<OverheadRow>::open(path, &pipeline, None)?);
        let sink: Arc<dyn OverheadSink> = overhead.clone();
        let copy_api = Table::<CopyApiRow>::open(path, &pipeline, Some(Arc::clone(&sink)))?;
        let stack_frames = Table::<StackFrameRow>::open(path, &pipeline, Some(Arc::clone(&sink)))?;
        let strings = StringTable::open(path, &pipeline, Some(sink))?;

        info!(
            output = %path.display(),
            stack_frames = %capture.strategy(),
            id_offset = config.id_offset,
            "trace session opened"
        );

        Ok(Arc::new_cyclic(|self_ref| Session {
            config,
            copy_api,
            stack_frames,
            strings,
            overhead,
            capture,
            finalized: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        }))
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    pub fn capture(&self) -> &StackCapture {
        &self.capture
    }

    pub fn copy_api(&self) -> &Table<CopyApiRow> {
        &self.copy_api
    }

    pub fn stack_frames(&self) -> &Table<StackFrameRow> {
        &self.stack_frames
    }

    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    pub fn overhead(&self) -> &Table<OverheadRow> {
        &self.overhead
    }

    /// Record one copy event and its call stack
    ///
    /// Returns the number of stack frames captured. The first event requests
    /// exit-time finalization, whatever the capture strategy.
    #[inline(never)]
    pub fn record_copy(&self, api: &str, row: CopyApiRow) -> usize {
        let api_id = row.api_id;
        self.copy_api.insert(row);
        self.request_exit_finalize();
        self.unwind(api, api_id)
    }

    /// Capture the current stack for event `api_id`
    ///
    /// One frame record per captured line, depth 0 first. A non-empty
    /// capture also requests exit-time finalization.
    #[inline(never)]
    pub fn unwind(&self, api: &str, api_id: i64) -> usize {
        let frames = self.capture.frames(api);
        for (depth, text) in frames.iter().enumerate() {
            self.stack_frames.insert(StackFrameRow {
                api_id,
                depth: depth as u32,
                name_id: self.strings.get_or_create(text),
            });
        }
        if !frames.is_empty() {
            self.request_exit_finalize();
        }
        frames.len()
    }

    /// Ask for this session to be finalized at process exit
    ///
    /// Only the first request in the process registers anything; later
    /// requests cost one atomic load.
    pub fn request_exit_finalize(&self) -> bool {
        if exit_hook::is_registered() {
            return false;
        }
        let target: Weak<dyn ExitFinalize> = self.self_ref.clone();
        exit_hook::register_once(target)
    }

    /// Flush every table's buffer into staging
    pub fn flush(&self) {
        self.copy_api.flush();
        self.stack_frames.flush();
        self.strings.table().flush();
        self.overhead.flush();
    }

    /// Finalize all tables, overhead last
    ///
    /// Runs once; later calls return `None`.
    pub fn finalize(&self) -> Option<FinalizeSummary> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return None;
        }

        let summary = FinalizeSummary {
            copy_api: merged(self.copy_api.finalize(), CopyApiRow::TABLE),
            stack_frames: merged(self.stack_frames.finalize(), StackFrameRow::TABLE),
            strings: merged(self.strings.table().finalize(), "estela_string"),
            overhead: merged(self.overhead.finalize(), OverheadRow::TABLE),
        };
        info!(?summary, "trace session finalized");
        Some(summary)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> Vec<TableStats> {
        vec![
            self.copy_api.stats(),
            self.stack_frames.stats(),
            self.strings.table().stats(),
            self.overhead.stats(),
        ]
    }
}

fn merged(result: Result<Option<usize>, StorageError>, table: &'static str) -> usize {
    match result {
        Ok(rows) => rows.unwrap_or(0),
        Err(e) => {
            warn!(table, error = %e, "merge into permanent storage failed");
            0
        }
    }
}

impl ExitFinalize for Session {
    fn finalize_at_exit(&self) {
        self.finalize();
    }
}
