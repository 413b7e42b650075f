//! Self-observability: the pipeline times its own batches
//!
//! Every batch write emits one overhead record. The session routes those
//! records into its own overhead table, so the tracer's cost is persisted
//! through the same pipeline as the events it traces.

use crate::rows::TableRow;
use crate::table::Table;
use nix::time::{clock_gettime, ClockId};
use rusqlite::{params, Statement};

/// Receiver of timing records
pub trait OverheadSink: Send + Sync {
    fn record(&self, start_ns: u64, end_ns: u64, label: &str, detail: &str);
}

/// Monotonic clock in nanoseconds (0 if the clock is unavailable)
pub fn monotonic_ns() -> u64 {
    clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map(|ts| ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
        .unwrap_or(0)
}

/// One timed section of tracer work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverheadRow {
    pub start_ns: u64,
    pub end_ns: u64,
    pub label: String,
    pub detail: String,
}

impl TableRow for OverheadRow {
    const TABLE: &'static str = "estela_overhead";

    const SCHEMA: &'static str = "\"start_ns\" integer NOT NULL, \
         \"end_ns\" integer NOT NULL, \
         \"label\" varchar(128) NOT NULL, \
         \"detail\" varchar(4096) NOT NULL";

    const COLUMNS: &'static [&'static str] = &["start_ns", "end_ns", "label", "detail"];

    fn execute(&self, stmt: &mut Statement<'_>, _id_offset: i64) -> rusqlite::Result<usize> {
        stmt.execute(params![
            self.start_ns as i64,
            self.end_ns as i64,
            self.label,
            self.detail,
        ])
    }
}

impl OverheadSink for Table<OverheadRow> {
    fn record(&self, start_ns: u64, end_ns: u64, label: &str, detail: &str) {
        self.insert(OverheadRow {
            start_ns,
            end_ns,
            label: label.to_string(),
            detail: detail.to_string(),
        });
    }
}
