//! One pipeline per table kind: ring buffer, batch writer and drain worker
//!
//! A [`Table`] is created together with its worker thread and lives for the
//! session. Each table owns an independent buffer, lock, connection and
//! worker, so tables drain fully in parallel.
//!
//! # Shutdown
//!
//! ```text
//! finalize()
//!   ├─ done = true, wake worker      (cooperative, no timeout)
//!   ├─ join worker                   (Terminated)
//!   ├─ flush()                       (rows that raced the worker's last check)
//!   └─ INSERT INTO main.<t> SELECT * FROM temp.temp_<t>
//! ```
//!
//! Staged rows only become visible in permanent storage at the merge, so a
//! crash mid-run leaves nothing but the disposable staging table.

use crate::batch_writer::{BatchReport, BatchWriter, StorageError};
use crate::config::PipelineConfig;
use crate::overhead::OverheadSink;
use crate::ring_buffer::{RingBuffer, WorkerState};
use crate::rows::TableRow;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

struct TableInner<R: TableRow> {
    ring: RingBuffer<R>,
    writer: BatchWriter<R>,
    batches: AtomicU64,
    rows_written: AtomicU64,
    rows_failed: AtomicU64,
}

impl<R: TableRow> TableInner<R> {
    /// Write one batch and apply the log-and-continue policy to its failures
    fn drain_once(&self) -> Option<BatchReport> {
        let report = self.writer.write_batch(&self.ring)?;

        self.batches.fetch_add(1, Ordering::Relaxed);
        self.rows_written
            .fetch_add(report.written as u64, Ordering::Relaxed);
        self.rows_failed
            .fetch_add(report.failed() as u64, Ordering::Relaxed);

        for failure in &report.failures {
            warn!(table = R::TABLE, error = %failure, "storage error during batch write");
        }
        trace!(
            table = R::TABLE,
            first = report.first,
            last = report.last,
            rows = report.rows,
            remaining = report.remaining,
            "batch committed"
        );

        Some(report)
    }
}

/// Buffered, batched writer for one row type
pub struct Table<R: TableRow> {
    inner: Arc<TableInner<R>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    finalized: AtomicBool,
}

impl<R: TableRow> Table<R> {
    /// Open the staging table on `path` and start the drain worker
    ///
    /// An invalid buffer geometry is rejected before anything is opened.
    pub fn open(
        path: &Path,
        config: &PipelineConfig,
        overhead: Option<Arc<dyn OverheadSink>>,
    ) -> Result<Self, StorageError> {
        config.validate().map_err(|source| StorageError::Config {
            table: R::TABLE,
            source,
        })?;
        let writer = BatchWriter::open(path, config.id_offset, overhead)?;
        let inner = Arc::new(TableInner {
            ring: RingBuffer::new(config.capacity, config.batch_size),
            writer,
            batches: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            rows_failed: AtomicU64::new(0),
        });

        let worker_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(format!("estela-{}", R::TABLE))
            .spawn(move || {
                worker_inner.ring.run_worker(|| {
                    worker_inner.drain_once();
                });
                debug!(table = R::TABLE, "drain worker terminated");
            })
            .map_err(|source| StorageError::Spawn {
                table: R::TABLE,
                source,
            })?;

        debug!(
            table = R::TABLE,
            capacity = config.capacity,
            batch_size = config.batch_size,
            id_offset = config.id_offset,
            "table opened"
        );

        Ok(Self {
            inner,
            worker: Mutex::new(Some(handle)),
            finalized: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &'static str {
        R::TABLE
    }

    /// Enqueue a row (blocks while the buffer is full, never fails)
    pub fn insert(&self, row: R) {
        self.inner.ring.insert(row, || {
            self.inner.drain_once();
        });
    }

    /// Write one batch now, regardless of the worker
    pub fn write_batch(&self) -> Option<BatchReport> {
        self.inner.drain_once()
    }

    /// Write batches until the buffer is empty
    ///
    /// Safe from any thread at any time. Returns the number of batches written.
    pub fn flush(&self) -> usize {
        let mut batches = 0;
        while self.inner.drain_once().is_some() {
            batches += 1;
        }
        batches
    }

    /// Stop the worker, flush the residue and merge staged rows
    ///
    /// Runs once; later calls return `Ok(None)`. On success returns the number
    /// of rows copied into permanent storage.
    pub fn finalize(&self) -> Result<Option<usize>, StorageError> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }

        self.inner.ring.shut_down();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!(table = R::TABLE, "drain worker panicked");
            }
        }

        self.flush();

        let merged = self.inner.writer.merge()?;
        info!(table = R::TABLE, merged, "merged staged rows into permanent storage");
        Ok(Some(merged))
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Rows committed to staging so far
    pub fn staged_rows(&self) -> Result<u64, StorageError> {
        self.inner.writer.staged_rows()
    }

    pub fn stats(&self) -> TableStats {
        let snap = self.inner.ring.snapshot();
        TableStats {
            table: R::TABLE,
            capacity: self.inner.ring.capacity(),
            batch_size: self.inner.ring.batch_size(),
            head: snap.head,
            tail: snap.tail,
            worker: snap.worker,
            batches: self.inner.batches.load(Ordering::Relaxed),
            rows_written: self.inner.rows_written.load(Ordering::Relaxed),
            rows_failed: self.inner.rows_failed.load(Ordering::Relaxed),
        }
    }
}

impl<R: TableRow> Drop for Table<R> {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            warn!(table = R::TABLE, error = %e, "finalize on drop failed");
        }
    }
}

/// Table statistics
#[derive(Debug, Clone, Copy)]
pub struct TableStats {
    pub table: &'static str,
    pub capacity: usize,
    pub batch_size: usize,
    /// Last index produced
    pub head: u64,
    /// Last index consumed
    pub tail: u64,
    pub worker: WorkerState,
    /// Batches written (worker, flush and inline)
    pub batches: u64,
    pub rows_written: u64,
    pub rows_failed: u64,
}

impl TableStats {
    pub fn backlog(&self) -> u64 {
        self.head - self.tail
    }

    /// Buffer utilization (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        self.backlog() as f64 / self.capacity as f64
    }
}
