//! Integration tests for the buffered table pipeline
//!
//! # Test Coverage
//!
//! - ✅ Worker drains full batches only, flush drains the residue
//! - ✅ Finalize merges every row, in insertion order
//! - ✅ Unset dimensions persisted as ''
//! - ✅ Id offset applied to every id column
//! - ✅ Backpressure: many producers, tiny buffer, no loss
//! - ✅ One overhead record per batch

use estela::overhead::OverheadSink;
use estela::{CopyApiRow, CopyKind, PipelineConfig, StackFrameRow, Table};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn query_i64s(path: &Path, sql: &str) -> Vec<i64> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn.prepare(sql).unwrap();
    let rows = stmt.query_map([], |row| row.get(0)).unwrap();
    rows.map(|r| r.unwrap()).collect()
}

#[derive(Default)]
struct CollectingSink {
    records: Mutex<Vec<(String, String)>>,
}

impl OverheadSink for CollectingSink {
    fn record(&self, start_ns: u64, end_ns: u64, label: &str, detail: &str) {
        assert!(end_ns >= start_ns);
        self.records
            .lock()
            .push((label.to_string(), detail.to_string()));
    }
}

#[test]
fn test_capacity_8_batch_4_ten_rows() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.rpd");
    let table: Table<CopyApiRow> =
        Table::open(&path, &PipelineConfig::new(8, 4, 0), None).unwrap();

    // Row 9 blocks until the worker frees space
    for id in 1..=10 {
        table.insert(CopyApiRow::linear(id, "0x0", 0, CopyKind::Default));
    }

    wait_for(|| table.stats().tail == 8);
    let stats = table.stats();
    assert_eq!(stats.batches, 2);
    assert_eq!(stats.backlog(), 2);
    assert_eq!(table.staged_rows().unwrap(), 8);

    assert_eq!(table.flush(), 1);
    assert_eq!(table.staged_rows().unwrap(), 10);

    assert_eq!(table.finalize().unwrap(), Some(10));
    assert_eq!(
        query_i64s(&path, "SELECT api_id FROM estela_copyapi ORDER BY rowid"),
        (1..=10).collect::<Vec<_>>()
    );
}

#[test]
fn test_unset_dimensions_persist_as_empty_string() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.rpd");
    let table: Table<CopyApiRow> =
        Table::open(&path, &PipelineConfig::new(8, 4, 0), None).unwrap();

    let mut row = CopyApiRow::linear(1, "0x1a", 0, CopyKind::DeviceToHost);
    row.width = Some(0);
    row.height = Some(16);
    table.insert(row);
    table.finalize().unwrap();

    let conn = Connection::open(&path).unwrap();
    let (size, width, height, kind): (String, String, i64, i64) = conn
        .query_row(
            "SELECT size, width, height, kind FROM estela_copyapi",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .unwrap();
    assert_eq!(size, "");
    assert_eq!(width, "");
    assert_eq!(height, 16);
    assert_eq!(kind, CopyKind::DeviceToHost.code() as i64);
}

#[test]
fn test_id_offset_applied_to_id_columns() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.rpd");
    let table: Table<StackFrameRow> =
        Table::open(&path, &PipelineConfig::new(8, 4, 1000), None).unwrap();

    table.insert(StackFrameRow {
        api_id: 1,
        depth: 0,
        name_id: 7,
    });
    table.finalize().unwrap();

    assert_eq!(query_i64s(&path, "SELECT api_id FROM estela_stackframe"), vec![1001]);
    assert_eq!(query_i64s(&path, "SELECT name_id FROM estela_stackframe"), vec![1007]);
    assert_eq!(query_i64s(&path, "SELECT depth FROM estela_stackframe"), vec![0]);
}

#[test]
fn test_backpressure_loses_nothing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.rpd");
    let table: Arc<Table<StackFrameRow>> =
        Arc::new(Table::open(&path, &PipelineConfig::new(4, 2, 0), None).unwrap());

    let producers = 4;
    let per_producer = 250;
    let handles: Vec<_> = (0..producers)
        .map(|producer| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for seq in 0..per_producer {
                    table.insert(StackFrameRow {
                        api_id: (producer * 1000 + seq) as i64,
                        depth: producer as u32,
                        name_id: 1,
                    });
                    assert!(table.stats().backlog() <= 4);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(table.finalize().unwrap(), Some(producers * per_producer));

    // Each producer's rows commit in the order it inserted them
    for producer in 0..producers {
        let ids = query_i64s(
            &path,
            &format!(
                "SELECT api_id FROM estela_stackframe WHERE depth = {} ORDER BY rowid",
                producer
            ),
        );
        let expected: Vec<i64> = (0..per_producer)
            .map(|seq| (producer * 1000 + seq) as i64)
            .collect();
        assert_eq!(ids, expected);
    }
}

#[test]
fn test_one_overhead_record_per_batch() {
    let dir = tempdir().unwrap();
    let sink = Arc::new(CollectingSink::default());
    let table: Table<StackFrameRow> = Table::open(
        &dir.path().join("trace.rpd"),
        &PipelineConfig::new(8, 4, 0),
        Some(sink.clone() as Arc<dyn OverheadSink>),
    )
    .unwrap();

    for id in 0..10 {
        table.insert(StackFrameRow {
            api_id: id,
            depth: 0,
            name_id: 1,
        });
    }
    table.finalize().unwrap();

    let records = sink.records.lock();
    assert_eq!(records.len() as u64, table.stats().batches);
    assert!(records
        .iter()
        .all(|(label, _)| label == "estela_stackframe::write_batch"));

    let total: usize = records
        .iter()
        .map(|(_, detail)| {
            let count = detail
                .strip_prefix("count=")
                .and_then(|rest| rest.split(' ').next())
                .unwrap();
            count.parse::<usize>().unwrap()
        })
        .sum();
    assert_eq!(total, 10);
}

#[test]
fn test_tables_share_one_database() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.rpd");
    let config = PipelineConfig::new(16, 4, 0);
    let copies: Table<CopyApiRow> = Table::open(&path, &config, None).unwrap();
    let frames: Table<StackFrameRow> = Table::open(&path, &config, None).unwrap();

    for id in 1..=9 {
        copies.insert(CopyApiRow::linear(id, "0x0", 128, CopyKind::HostToDevice));
        frames.insert(StackFrameRow {
            api_id: id,
            depth: 0,
            name_id: id,
        });
    }

    assert_eq!(copies.finalize().unwrap(), Some(9));
    assert_eq!(frames.finalize().unwrap(), Some(9));
    assert_eq!(query_i64s(&path, "SELECT COUNT(*) FROM estela_copyapi"), vec![9]);
    assert_eq!(query_i64s(&path, "SELECT COUNT(*) FROM estela_stackframe"), vec![9]);
}
