//! Result tables and the crash-recovery side buffer.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, params};
use uuid::Uuid;

use megrid_core::{ResultRecord, ResultSink, SideBuffer};

use crate::error::{Result, StoreError};
use crate::schema::{self, normalize_column, quote_ident};

/// Appends result rows to one table per evaluation unit.
///
/// Every row of a run carries the same `run_id`, so repeated runs into the
/// same file stay distinguishable.
pub struct ResultWriter {
    conn: Connection,
    run_id: Uuid,
    prepared: HashSet<String>,
}

impl ResultWriter {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        schema::initialize(&conn)?;
        let run_id = Uuid::new_v4();
        tracing::info!(%run_id, "opened result writer");
        Ok(Self {
            conn,
            run_id,
            prepared: HashSet::new(),
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Table name used for a unit's results.
    pub fn table_for(unit: &str) -> String {
        normalize_column(unit)
    }

    fn ensure_table(&mut self, table: &str) -> Result<()> {
        if self.prepared.contains(table) {
            return Ok(());
        }
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id       INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id   TEXT NOT NULL,
                me       REAL NOT NULL,
                error    REAL NOT NULL,
                neval    INTEGER NOT NULL,
                time     REAL NOT NULL,
                cpu_time REAL,
                entry    INTEGER NOT NULL,
                evtnum   INTEGER NOT NULL,
                runnum   INTEGER NOT NULL,
                extra    TEXT NOT NULL DEFAULT '[]'
            );",
            quote_ident(table)
        ))?;
        self.prepared.insert(table.to_string());
        Ok(())
    }

    /// Rows recorded for `unit` in this run.
    pub fn count(&self, unit: &str) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE run_id = ?1",
                quote_ident(&Self::table_for(unit))
            ),
            [self.run_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }
}

impl ResultSink for ResultWriter {
    type Error = StoreError;

    fn record(&mut self, result: &ResultRecord) -> Result<()> {
        let table = Self::table_for(&result.unit);
        if table.is_empty() {
            return Err(StoreError::InvalidData(format!(
                "unit name '{}' yields no table name",
                result.unit
            )));
        }
        self.ensure_table(&table)?;
        self.conn.execute(
            &format!(
                "INSERT INTO {} (run_id, me, error, neval, time, cpu_time, entry, evtnum, runnum, extra)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                quote_ident(&table)
            ),
            params![
                self.run_id.to_string(),
                result.me,
                result.error,
                result.neval as i64,
                result.time,
                result.cpu_time,
                result.entry as i64,
                result.evtnum,
                result.runnum,
                serde_json::to_string(&result.extra)?,
            ],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Side buffer
// ---------------------------------------------------------------------------

/// Snapshot of the record in flight, replaced atomically on every write.
///
/// The file always holds either the previous or the new snapshot: the
/// record is written to a sibling temp file, synced, then renamed over it.
pub struct JsonSideBuffer {
    path: Option<PathBuf>,
}

impl JsonSideBuffer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// A buffer that writes nothing.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read back the last snapshot, if any.
    pub fn read(path: &Path) -> Result<Option<ResultRecord>> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl SideBuffer for JsonSideBuffer {
    type Error = StoreError;

    fn snapshot(&mut self, result: &ResultRecord) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut file = File::create(&tmp)?;
            serde_json::to_writer(&mut file, result)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use megrid_core::Stage;
    use tempfile::TempDir;

    fn record(unit: &str, entry: u64, stage: Stage) -> ResultRecord {
        ResultRecord {
            unit: unit.into(),
            me: 1.5e-3,
            error: 2.0e-4,
            neval: 120,
            time: 0.01,
            cpu_time: Some(0.008),
            entry,
            evtnum: 1000 + entry as i64,
            runnum: 161_005,
            extra: vec![1.0, -2.0],
            stage,
        }
    }

    #[test]
    fn test_results_go_to_unit_tables() {
        let mut w = ResultWriter::open_in_memory().unwrap();
        w.record(&record("hww125", 0, Stage::Record)).unwrap();
        w.record(&record("hww125", 1, Stage::Record)).unwrap();
        w.record(&record("ww", 1, Stage::Record)).unwrap();
        assert_eq!(w.count("hww125").unwrap(), 2);
        assert_eq!(w.count("ww").unwrap(), 1);

        let (me, extra, run_id, cpu): (f64, String, String, Option<f64>) = w
            .conn()
            .query_row(
                "SELECT me, extra, run_id, cpu_time FROM ww",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .unwrap();
        assert_eq!(me, 1.5e-3);
        assert_eq!(cpu, Some(0.008));
        assert_eq!(extra, "[1.0,-2.0]");
        assert_eq!(run_id, w.run_id().to_string());
    }

    #[test]
    fn test_runs_are_distinguished() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.db");
        let first = {
            let mut w = ResultWriter::open(&path).unwrap();
            w.record(&record("ww", 0, Stage::Record)).unwrap();
            w.run_id()
        };
        let mut w = ResultWriter::open(&path).unwrap();
        assert_ne!(w.run_id(), first);
        assert_eq!(w.count("ww").unwrap(), 0);
        w.record(&record("ww", 0, Stage::Record)).unwrap();
        let total: i64 = w
            .conn()
            .query_row("SELECT COUNT(*) FROM ww", [], |r| r.get(0))
            .unwrap();
        assert_eq!(total, 2);
    }

    #[test]
    fn test_side_buffer_keeps_latest_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buffer.json");
        let mut buf = JsonSideBuffer::new(&path);
        assert_eq!(JsonSideBuffer::read(&path).unwrap(), None);

        buf.snapshot(&record("ww", 3, Stage::DensityEval)).unwrap();
        let partial = JsonSideBuffer::read(&path).unwrap().unwrap();
        assert_eq!(partial.stage, Stage::DensityEval);
        assert_eq!(partial.entry, 3);

        buf.snapshot(&record("ww", 3, Stage::Record)).unwrap();
        assert_eq!(JsonSideBuffer::read(&path).unwrap().unwrap().stage, Stage::Record);
        assert!(!dir.path().join("buffer.json.tmp").exists());
    }

    #[test]
    fn test_disabled_side_buffer() {
        let mut buf = JsonSideBuffer::disabled();
        assert!(buf.path().is_none());
        buf.snapshot(&record("ww", 0, Stage::Record)).unwrap();
    }
}
