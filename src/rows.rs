//! Row shapes persisted by the pipeline
//!
//! Every table kind owns one row type. A row type knows its permanent table
//! name, its column layout, and how to bind itself positionally onto the
//! cached insert statement of its staging table.
//!
//! # Staging Layout
//!
//! ```text
//! temp.temp_<table>   (connection-private, filled batch by batch)
//!        │
//!        │  finalize: INSERT INTO main.<table> SELECT * FROM temp.temp_<table>
//!        ▼
//! main.<table>        (permanent, created if missing)
//! ```
//!
//! Both tables are declared from the same [`TableRow::SCHEMA`], so the bulk
//! copy at finalize lines columns up by position.

use rusqlite::types::Value;
use rusqlite::{params, Statement};
use thiserror::Error;

/// A fixed-shape record that can be buffered and written by a [`crate::table::Table`]
pub trait TableRow: Send + 'static {
    /// Permanent table name
    const TABLE: &'static str;

    /// Column definitions shared by the staging and permanent tables
    const SCHEMA: &'static str;

    /// Column names in bind order
    const COLUMNS: &'static [&'static str];

    /// Bind this row onto the staging insert statement and execute it.
    ///
    /// `id_offset` is added to every id column so independently captured
    /// traces can be merged into one id space.
    fn execute(&self, stmt: &mut Statement<'_>, id_offset: i64) -> rusqlite::Result<usize>;

    /// Name of the connection-private staging table
    fn staging_table() -> String {
        format!("temp_{}", Self::TABLE)
    }

    /// `CREATE TABLE IF NOT EXISTS` for the permanent table
    fn permanent_ddl() -> String {
        format!("CREATE TABLE IF NOT EXISTS main.\"{}\" ({})", Self::TABLE, Self::SCHEMA)
    }

    /// `CREATE TEMPORARY TABLE` for the staging table
    fn staging_ddl() -> String {
        format!(
            "CREATE TEMPORARY TABLE IF NOT EXISTS \"{}\" ({})",
            Self::staging_table(),
            Self::SCHEMA
        )
    }

    /// Positional insert into the staging table
    fn insert_sql() -> String {
        let placeholders = (1..=Self::COLUMNS.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO temp.\"{}\" ({}) VALUES ({})",
            Self::staging_table(),
            Self::COLUMNS.join(", "),
            placeholders
        )
    }

    /// Bulk copy of all staged rows into permanent storage
    fn merge_sql() -> String {
        format!(
            "INSERT INTO main.\"{}\" SELECT * FROM temp.\"{}\"",
            Self::TABLE,
            Self::staging_table()
        )
    }
}

/// Direction of a memory copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum CopyKind {
    HostToHost = 0,
    HostToDevice = 1,
    DeviceToHost = 2,
    DeviceToDevice = 3,
    /// Direction inferred by the runtime from the pointers
    #[default]
    Default = 4,
}

impl CopyKind {
    /// Integer code stored in the `kind` column
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Inverse of [`CopyKind::code`]
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(CopyKind::HostToHost),
            1 => Some(CopyKind::HostToDevice),
            2 => Some(CopyKind::DeviceToHost),
            3 => Some(CopyKind::DeviceToDevice),
            4 => Some(CopyKind::Default),
            _ => None,
        }
    }
}

/// One memory-copy API call
///
/// `size`, `width` and `height` are optional: `None` (and a zero value) means
/// "unset" and is persisted as the empty string so the permanent layout keeps
/// its NOT NULL columns.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CopyApiRow {
    /// Correlation id of the owning API call
    pub api_id: i64,
    pub stream: String,
    pub size: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub kind: CopyKind,
    pub dst: String,
    pub src: String,
    pub dst_device: i32,
    pub src_device: i32,
    pub sync: bool,
    pub pinned: bool,
}

impl CopyApiRow {
    /// Linear copy of `size` bytes
    pub fn linear(api_id: i64, stream: impl Into<String>, size: u32, kind: CopyKind) -> Self {
        Self {
            api_id,
            stream: stream.into(),
            size: Some(size).filter(|s| *s > 0),
            kind,
            ..Self::default()
        }
    }
}

/// An id column pushed past `i64` by the configured offset
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("id {id} with offset {offset} overflows i64")]
pub struct IdOverflow {
    pub id: i64,
    pub offset: i64,
}

/// `id + offset`, or a bind error that fails this row only
pub fn offset_id(id: i64, offset: i64) -> rusqlite::Result<i64> {
    id.checked_add(offset)
        .ok_or_else(|| rusqlite::Error::ToSqlConversionFailure(Box::new(IdOverflow { id, offset })))
}

/// Bind value for an optional dimension
///
/// Unset and zero both become `''`, matching the existing on-disk layout.
pub fn dimension_value(value: Option<u32>) -> Value {
    match value {
        Some(v) if v > 0 => Value::Integer(i64::from(v)),
        _ => Value::Text(String::new()),
    }
}

impl TableRow for CopyApiRow {
    const TABLE: &'static str = "estela_copyapi";

    const SCHEMA: &'static str = "\"api_id\" integer NOT NULL PRIMARY KEY, \
         \"stream\" varchar(18) NOT NULL, \
         \"size\" integer NOT NULL, \
         \"width\" integer NOT NULL, \
         \"height\" integer NOT NULL, \
         \"kind\" integer NOT NULL, \
         \"dst\" varchar(18) NOT NULL, \
         \"src\" varchar(18) NOT NULL, \
         \"dst_device\" integer NOT NULL, \
         \"src_device\" integer NOT NULL, \
         \"sync\" bool NOT NULL, \
         \"pinned\" bool NOT NULL";

    const COLUMNS: &'static [&'static str] = &[
        "api_id",
        "stream",
        "size",
        "width",
        "height",
        "kind",
        "dst",
        "src",
        "dst_device",
        "src_device",
        "sync",
        "pinned",
    ];

    fn execute(&self, stmt: &mut Statement<'_>, id_offset: i64) -> rusqlite::Result<usize> {
        stmt.execute(params![
            offset_id(self.api_id, id_offset)?,
            self.stream,
            dimension_value(self.size),
            dimension_value(self.width),
            dimension_value(self.height),
            self.kind.code(),
            self.dst,
            self.src,
            self.dst_device,
            self.src_device,
            self.sync,
            self.pinned,
        ])
    }
}

/// One resolved call-stack line of a captured event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackFrameRow {
    /// Correlation id of the owning event
    pub api_id: i64,
    /// 0 is the call-site frame
    pub depth: u32,
    /// Interned frame text
    pub name_id: i64,
}

impl TableRow for StackFrameRow {
    const TABLE: &'static str = "estela_stackframe";

    const SCHEMA: &'static str = "\"api_id\" integer NOT NULL, \
         \"depth\" integer NOT NULL, \
         \"name_id\" integer NOT NULL";

    const COLUMNS: &'static [&'static str] = &["api_id", "depth", "name_id"];

    fn execute(&self, stmt: &mut Statement<'_>, id_offset: i64) -> rusqlite::Result<usize> {
        stmt.execute(params![
            offset_id(self.api_id, id_offset)?,
            self.depth,
            offset_id(self.name_id, id_offset)?,
        ])
    }
}
