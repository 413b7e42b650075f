//! String interning for frame text and other repeated strings
//!
//! `get_or_create` hands out a stable id per distinct string. Only the first
//! sighting of a string is enqueued into the string table's own pipeline.

use crate::batch_writer::StorageError;
use crate::config::PipelineConfig;
use crate::overhead::OverheadSink;
use crate::rows::{offset_id, TableRow};
use crate::table::Table;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use rusqlite::{params, Statement};
use std::path::Path;
use std::sync::Arc;

/// One interned string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringRow {
    pub id: i64,
    pub text: String,
}

impl TableRow for StringRow {
    const TABLE: &'static str = "estela_string";

    const SCHEMA: &'static str = "\"id\" integer NOT NULL PRIMARY KEY, \
         \"string\" varchar(4096) NOT NULL";

    const COLUMNS: &'static [&'static str] = &["id", "string"];

    fn execute(&self, stmt: &mut Statement<'_>, id_offset: i64) -> rusqlite::Result<usize> {
        stmt.execute(params![offset_id(self.id, id_offset)?, self.text])
    }
}

/// Deduplicating string store
pub struct StringTable {
    ids: Mutex<FnvHashMap<String, i64>>,
    table: Table<StringRow>,
}

impl StringTable {
    pub fn open(
        path: &Path,
        config: &PipelineConfig,
        overhead: Option<Arc<dyn OverheadSink>>,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            ids: Mutex::new(FnvHashMap::default()),
            table: Table::open(path, config, overhead)?,
        })
    }

    /// Stable id for `text`, creating it on first use
    ///
    /// Ids start at 1 and are not offset here; the id offset is applied when
    /// rows are written.
    pub fn get_or_create(&self, text: &str) -> i64 {
        let mut ids = self.ids.lock();
        if let Some(id) = ids.get(text) {
            return *id;
        }
        let id = ids.len() as i64 + 1;
        ids.insert(text.to_owned(), id);
        drop(ids);

        self.table.insert(StringRow {
            id,
            text: text.to_owned(),
        });
        id
    }

    /// Number of distinct strings seen
    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn table(&self) -> &Table<StringRow> {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_dedup() {
        let dir = tempdir().unwrap();
        let strings = StringTable::open(&dir.path().join("t.db"), &PipelineConfig::new(8, 4, 0), None)
            .unwrap();

        let a = strings.get_or_create("hipMemcpy");
        let b = strings.get_or_create("hipMemcpyAsync");
        assert_eq!(strings.get_or_create("hipMemcpy"), a);
        assert_ne!(a, b);
        assert_eq!(strings.len(), 2);
        assert_eq!(strings.table().finalize().unwrap(), Some(2));
    }

    #[test]
    fn test_concurrent_interning_agrees() {
        let dir = tempdir().unwrap();
        let strings = Arc::new(
            StringTable::open(&dir.path().join("t.db"), &PipelineConfig::new(64, 16, 0), None)
                .unwrap(),
        );

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let strings = Arc::clone(&strings);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|i| strings.get_or_create(&format!("frame_{}", i % 10)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<Vec<i64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for ids in &results[1..] {
            assert_eq!(ids, &results[0]);
        }
        assert_eq!(strings.len(), 10);
        assert_eq!(strings.table().finalize().unwrap(), Some(10));
    }
}
