//! Synthetic copy-event workload
//!
//! Drives a session from several producer threads the way instrumented
//! copy calls would, for smoke runs and throughput measurement.

use crate::rows::{CopyApiRow, CopyKind};
use crate::session::{FinalizeSummary, Session};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::debug;

/// Shape of a synthetic run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Workload {
    pub producers: usize,
    /// Events per producer
    pub events: usize,
}

/// Outcome of a run
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadReport {
    pub producers: usize,
    pub events: usize,
    pub frames: usize,
    pub elapsed_ms: f64,
    pub events_per_sec: f64,
    pub stack_frames: String,
    pub merged: FinalizeSummary,
}

impl Workload {
    pub fn new(producers: usize, events: usize) -> Self {
        Self { producers, events }
    }

    pub fn total_events(&self) -> usize {
        self.producers * self.events
    }

    /// Record every event, then finalize the session
    pub fn run(&self, session: &Arc<Session>) -> WorkloadReport {
        let start = Instant::now();

        let handles: Vec<_> = (0..self.producers)
            .map(|producer| {
                let session = Arc::clone(session);
                let events = self.events;
                thread::spawn(move || {
                    let mut frames = 0;
                    for seq in 0..events {
                        let api_id = (producer * events + seq + 1) as i64;
                        let (api, row) = synthetic_event(api_id, producer, seq);
                        frames += session.record_copy(api, row);
                    }
                    debug!(producer, events, frames, "producer finished");
                    frames
                })
            })
            .collect();

        let frames = handles
            .into_iter()
            .map(|h| h.join().unwrap_or(0))
            .sum();

        let merged = session.finalize().unwrap_or_default();
        let elapsed = start.elapsed().as_secs_f64();
        let events = self.total_events();

        WorkloadReport {
            producers: self.producers,
            events,
            frames,
            elapsed_ms: elapsed * 1000.0,
            events_per_sec: if elapsed > 0.0 {
                events as f64 / elapsed
            } else {
                0.0
            },
            stack_frames: session.capture().strategy().to_string(),
            merged,
        }
    }
}

/// One copy event; every third is a 2D copy, every fifth is synchronous
fn synthetic_event(api_id: i64, producer: usize, seq: usize) -> (&'static str, CopyApiRow) {
    let kind = CopyKind::from_code((seq % 5) as i32).unwrap_or_default();
    let stream = format!("{:#x}", 0x1000 + producer);
    let size = 64 << (seq % 8);

    let mut row = CopyApiRow::linear(api_id, stream, size, kind);
    row.dst = format!("{:#x}", 0x7f00_0000_0000_u64 + (seq as u64) * 0x1000);
    row.src = format!("{:#x}", 0x5500_0000_0000_u64 + (seq as u64) * 0x1000);
    row.dst_device = producer as i32;
    row.src_device = producer as i32;

    if seq % 3 == 2 {
        row.size = None;
        row.width = Some(size / 8);
        row.height = Some(8);
        return ("hipMemcpy2D", row);
    }
    if seq % 5 == 0 {
        row.sync = true;
        return ("hipMemcpy", row);
    }
    ("hipMemcpyAsync", row)
}

impl std::fmt::Display for WorkloadReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "producers:      {}", self.producers)?;
        writeln!(f, "events:         {}", self.events)?;
        writeln!(f, "stack frames:   {} ({})", self.frames, self.stack_frames)?;
        writeln!(f, "elapsed:        {:.2} ms", self.elapsed_ms)?;
        writeln!(f, "throughput:     {:.0} events/s", self.events_per_sec)?;
        writeln!(f, "merged rows:")?;
        writeln!(f, "  copy api      {}", self.merged.copy_api)?;
        writeln!(f, "  stack frames  {}", self.merged.stack_frames)?;
        writeln!(f, "  strings       {}", self.merged.strings)?;
        write!(f, "  overhead      {}", self.merged.overhead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TracerConfig;
    use tempfile::tempdir;

    #[test]
    fn test_synthetic_event_shapes() {
        let (api, row) = synthetic_event(3, 0, 2);
        assert_eq!(api, "hipMemcpy2D");
        assert!(row.size.is_none());
        assert_eq!(row.height, Some(8));

        let (api, row) = synthetic_event(1, 1, 0);
        assert_eq!(api, "hipMemcpy");
        assert!(row.sync);
        assert_eq!(row.kind, CopyKind::HostToHost);
        assert_eq!(row.stream, "0x1001");
    }

    #[test]
    fn test_run_merges_every_event() {
        let dir = tempdir().unwrap();
        let mut config = TracerConfig {
            output: dir.path().join("trace.rpd"),
            ..TracerConfig::default()
        };
        config.buffer.capacity = 32;
        config.buffer.batch_size = 8;
        let session = Session::open(config).unwrap();

        let report = Workload::new(3, 25).run(&session);
        assert_eq!(report.events, 75);
        assert_eq!(report.frames, 0);
        assert_eq!(report.merged.copy_api, 75);
        assert!(report.merged.overhead > 0);
        assert!(report.to_string().contains("events:         75"));
    }
}
