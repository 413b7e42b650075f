//! Batch-transaction writer
//!
//! Moves one batch from a [`RingBuffer`] into the connection-private staging
//! table inside a single deferred transaction, then merges the staging table
//! into permanent storage at finalize.
//!
//! # Transaction Shape
//!
//! ```text
//! lock(ring)   → select [tail+1, min(head, tail+batch)], move rows out
//! unlock(ring)
//! BEGIN DEFERRED TRANSACTION
//!   execute cached insert × N   (id columns shifted by id_offset)
//! lock(ring)   → tail = last; wake producers
//! unlock(ring)
//! END TRANSACTION
//! overhead.record(start, end, "<table>::write_batch", "count=N | remaining=M")
//! ```
//!
//! Storage I/O never runs under the ring lock. The connection has its own
//! lock, held for the whole batch, so batches on one table never overlap and
//! commit in increasing `tail` order.
//!
//! # Failure Policy
//!
//! Per-row and per-transaction failures do not stop the batch. They are
//! collected into the [`BatchReport`] and the caller logs them and moves on.
//!
//! # Busy Timeout
//!
//! The pipeline itself never times out: producers and the worker wait on
//! their conditions indefinitely. The one bounded wait is SQLite's busy
//! handler ([`BUSY_TIMEOUT`]), which only applies while another connection
//! holds the main database lock, i.e. during table creation and the merge.
//! Staging writes go to each connection's private temp database and never
//! contend for it. A merge that stays busy past the timeout fails with
//! [`StorageError::Merge`] instead of hanging finalization at process exit.

use crate::config::ConfigError;
use crate::overhead::{monotonic_ns, OverheadSink};
use crate::ring_buffer::RingBuffer;
use crate::rows::TableRow;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How long schema creation and the merge wait on another connection
/// holding the main database
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from the storage sink
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to open trace database {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to create schema for {table}: {source}")]
    Schema {
        table: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to begin transaction on {table}: {source}")]
    Begin {
        table: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to prepare insert for {table}: {source}")]
    Prepare {
        table: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to insert row {index} into {table}: {source}")]
    Insert {
        table: &'static str,
        index: u64,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to commit batch on {table}: {source}")]
    Commit {
        table: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to merge staged rows into {table}: {source}")]
    Merge {
        table: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to query {table}: {source}")]
    Query {
        table: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Invalid pipeline configuration for {table}: {source}")]
    Config {
        table: &'static str,
        #[source]
        source: ConfigError,
    },

    #[error("Failed to spawn drain worker for {table}: {source}")]
    Spawn {
        table: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of one [`BatchWriter::write_batch`]
#[derive(Debug)]
pub struct BatchReport {
    pub table: &'static str,
    /// First ring index in the batch
    pub first: u64,
    /// Last ring index in the batch, inclusive
    pub last: u64,
    /// Rows selected for the batch
    pub rows: usize,
    /// Rows whose insert succeeded
    pub written: usize,
    /// Backlog left in the ring once `tail` advanced
    pub remaining: u64,
    pub started_ns: u64,
    pub finished_ns: u64,
    pub failures: Vec<StorageError>,
}

impl BatchReport {
    pub fn failed(&self) -> usize {
        self.rows - self.written
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Detail string of the overhead record
    pub fn detail(&self) -> String {
        format!("count={} | remaining={}", self.rows, self.remaining)
    }
}

/// Owns one SQLite connection and the SQL for one row type
pub struct BatchWriter<R: TableRow> {
    conn: Mutex<Connection>,
    insert_sql: String,
    merge_sql: String,
    count_sql: String,
    label: String,
    id_offset: i64,
    overhead: Option<Arc<dyn OverheadSink>>,
    _row: PhantomData<fn(R)>,
}

impl<R: TableRow> BatchWriter<R> {
    /// Open a connection, create the permanent table if missing and the
    /// staging table for this connection
    pub fn open(
        path: &Path,
        id_offset: i64,
        overhead: Option<Arc<dyn OverheadSink>>,
    ) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(|source| StorageError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|source| StorageError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let schema = |source| StorageError::Schema {
            table: R::TABLE,
            source,
        };
        conn.execute_batch(&R::permanent_ddl()).map_err(schema)?;
        conn.execute_batch(&R::staging_ddl()).map_err(schema)?;

        let insert_sql = R::insert_sql();
        conn.prepare_cached(&insert_sql)
            .map_err(|source| StorageError::Prepare {
                table: R::TABLE,
                source,
            })?;

        Ok(Self {
            conn: Mutex::new(conn),
            insert_sql,
            merge_sql: R::merge_sql(),
            count_sql: format!("SELECT COUNT(*) FROM temp.\"{}\"", R::staging_table()),
            label: format!("{}::write_batch", R::TABLE),
            id_offset,
            overhead,
            _row: PhantomData,
        })
    }

    pub fn id_offset(&self) -> i64 {
        self.id_offset
    }

    /// Write the next batch from `ring`, or `None` when the ring is empty
    pub fn write_batch(&self, ring: &RingBuffer<R>) -> Option<BatchReport> {
        let conn = self.conn.lock();
        let batch = ring.take_batch()?;

        let started_ns = monotonic_ns();
        let mut failures = Vec::new();
        let mut written = 0;

        if let Err(source) = conn.execute_batch("BEGIN DEFERRED TRANSACTION") {
            failures.push(StorageError::Begin {
                table: R::TABLE,
                source,
            });
        }

        match conn.prepare_cached(&self.insert_sql) {
            Ok(mut stmt) => {
                for (index, row) in (batch.first..).zip(&batch.rows) {
                    match row.execute(&mut stmt, self.id_offset) {
                        Ok(_) => written += 1,
                        Err(source) => failures.push(StorageError::Insert {
                            table: R::TABLE,
                            index,
                            source,
                        }),
                    }
                }
            }
            Err(source) => failures.push(StorageError::Prepare {
                table: R::TABLE,
                source,
            }),
        }

        let remaining = ring.complete_batch(batch.last);

        if let Err(source) = conn.execute_batch("END TRANSACTION") {
            failures.push(StorageError::Commit {
                table: R::TABLE,
                source,
            });
        }
        drop(conn);

        let report = BatchReport {
            table: R::TABLE,
            first: batch.first,
            last: batch.last,
            rows: batch.rows.len(),
            written,
            remaining,
            started_ns,
            finished_ns: monotonic_ns(),
            failures,
        };

        if let Some(sink) = &self.overhead {
            sink.record(
                report.started_ns,
                report.finished_ns,
                &self.label,
                &report.detail(),
            );
        }

        Some(report)
    }

    /// Copy every staged row into the permanent table
    pub fn merge(&self) -> Result<usize, StorageError> {
        self.conn
            .lock()
            .execute(&self.merge_sql, [])
            .map_err(|source| StorageError::Merge {
                table: R::TABLE,
                source,
            })
    }

    /// Rows committed to the staging table so far
    pub fn staged_rows(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .lock()
            .query_row(&self.count_sql, [], |row| row.get(0))
            .map_err(|source| StorageError::Query {
                table: R::TABLE,
                source,
            })?;
        Ok(count as u64)
    }
}
