//! Reading rows out of SQLite source tables.
//!
//! Numeric cells become scalars. TEXT cells holding a JSON array of numbers
//! become multi-valued columns addressable as `name[index]`; other TEXT is
//! parsed as a number when possible and is NULL otherwise.

use std::ops::Range;
use std::path::{Path, PathBuf};

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};

use megrid_core::{EventSource, RowData, Value};

use crate::error::{Result, StoreError};
use crate::schema::{quote_ident, table_columns, table_exists};

/// Expand a glob pattern to the files it matches, sorted.
///
/// A pattern without glob metacharacters must name an existing file.
pub fn expand_pattern(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in glob::glob(pattern)? {
        match entry {
            Ok(p) if p.is_file() => paths.push(p),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "unreadable path while expanding pattern"),
        }
    }
    if paths.is_empty() {
        return Err(StoreError::SourceNotFound(format!("no file matches '{pattern}'")));
    }
    paths.sort();
    Ok(paths)
}

/// Split `file:table` into its parts; the table defaults to `default`.
pub fn split_location<'a>(location: &'a str, default: &'a str) -> (&'a str, &'a str) {
    match location.rsplit_once(':') {
        Some((file, table)) if !file.is_empty() && !table.is_empty() => (file, table),
        _ => (location, default),
    }
}

fn convert(cell: ValueRef<'_>) -> Value {
    match cell {
        ValueRef::Null | ValueRef::Blob(_) => Value::Null,
        ValueRef::Integer(i) => Value::Scalar(i as f64),
        ValueRef::Real(r) => Value::Scalar(r),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            let text = text.trim();
            if text.starts_with('[') {
                serde_json::from_str::<Vec<f64>>(text).map_or(Value::Null, Value::Array)
            } else {
                text.parse::<f64>().map_or(Value::Null, Value::Scalar)
            }
        }
    }
}

/// One table in one SQLite file, read in rowid order.
pub struct TableReader {
    conn: Connection,
    path: PathBuf,
    table: String,
    columns: Vec<String>,
}

impl TableReader {
    /// Open `table` in an existing file; nothing is created.
    pub fn open(path: &Path, table: &str) -> Result<Self> {
        if !path.is_file() {
            return Err(StoreError::SourceNotFound(format!("{} does not exist", path.display())));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        if !table_exists(&conn, table)? {
            return Err(StoreError::SourceNotFound(format!(
                "table '{table}' not in {}",
                path.display()
            )));
        }
        let columns = table_columns(&conn, table)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            table: table.to_string(),
            columns,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn len(&self) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(&self.table)),
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Rowids in table order.
    pub fn rowids(&self) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT rowid FROM {} ORDER BY rowid",
            quote_ident(&self.table)
        ))?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(ids)
    }

    fn select_list(columns: &[String]) -> String {
        if columns.is_empty() {
            "rowid".to_string()
        } else {
            columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        }
    }

    fn to_row(columns: &[String], row: &rusqlite::Row<'_>) -> rusqlite::Result<RowData> {
        let mut data = RowData::new();
        for (i, c) in columns.iter().enumerate() {
            data.insert(c, convert(row.get_ref(i)?));
        }
        Ok(data)
    }

    /// Visit rows with index in `range` (table order), reading only `columns`.
    ///
    /// The visitor receives the row index within this table.
    pub fn for_each<F>(&self, columns: &[String], range: Option<Range<u64>>, mut visit: F) -> Result<()>
    where
        F: FnMut(u64, RowData) -> Result<()>,
    {
        let (offset, limit) = match &range {
            Some(r) => (r.start, r.end.saturating_sub(r.start) as i64),
            None => (0, -1),
        };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM {} ORDER BY rowid LIMIT ?1 OFFSET ?2",
            Self::select_list(columns),
            quote_ident(&self.table)
        ))?;
        let mut rows = stmt.query(rusqlite::params![limit, offset as i64])?;
        let mut index = offset;
        while let Some(row) = rows.next()? {
            visit(index, Self::to_row(columns, row)?)?;
            index += 1;
        }
        Ok(())
    }

    /// Read the row with the given rowid, all columns.
    pub fn row_by_id(&self, rowid: i64) -> Result<RowData> {
        let sql = format!(
            "SELECT {} FROM {} WHERE rowid = ?1",
            Self::select_list(&self.columns),
            quote_ident(&self.table)
        );
        let row = self
            .conn
            .query_row(&sql, [rowid], |row| Self::to_row(&self.columns, row))?;
        Ok(row)
    }
}

// ---------------------------------------------------------------------------
// Event source
// ---------------------------------------------------------------------------

/// Events spread over one or more files, addressed by a global entry index.
pub struct EventTable {
    readers: Vec<TableReader>,
    /// (reader index, rowid) per global entry.
    index: Vec<(usize, i64)>,
}

impl EventTable {
    pub fn open(paths: &[PathBuf], table: &str) -> Result<Self> {
        if paths.is_empty() {
            return Err(StoreError::SourceNotFound("no event files given".into()));
        }
        let mut readers = Vec::with_capacity(paths.len());
        let mut index = Vec::new();
        for (i, path) in paths.iter().enumerate() {
            let reader = TableReader::open(path, table)?;
            index.extend(reader.rowids()?.into_iter().map(|id| (i, id)));
            tracing::info!(path = %path.display(), table, "opened event table");
            readers.push(reader);
        }
        Ok(Self { readers, index })
    }
}

impl EventSource for EventTable {
    type Error = StoreError;

    fn entries(&self) -> u64 {
        self.index.len() as u64
    }

    fn has_column(&self, name: &str) -> bool {
        self.readers.iter().all(|r| r.has_column(name))
    }

    fn load(&mut self, entry: u64) -> Result<RowData> {
        let &(reader, rowid) = self
            .index
            .get(entry as usize)
            .ok_or_else(|| StoreError::InvalidData(format!("entry {entry} out of range")))?;
        self.readers[reader].row_by_id(rowid)
    }
}
