use std::sync::LazyLock;

use regex::Regex;
use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

static NON_IDENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_]").unwrap());

/// Pragmas and bookkeeping tables for a database megrid writes to.
pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS grid_metadata (
            grid_table TEXT PRIMARY KEY,
            name       TEXT NOT NULL,
            ndim       INTEGER NOT NULL,
            columns    TEXT NOT NULL,
            provenance TEXT NOT NULL DEFAULT '[]',
            pipeline   TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;
    tracing::debug!(version = SCHEMA_VERSION, "schema initialized");
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
    let version = stmt
        .query_row([], |row| {
            let v: String = row.get(0)?;
            Ok(v.parse::<i64>().unwrap_or(0))
        })
        .ok();
    Ok(version)
}

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Column names of `table` in declaration order.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<_, _>>()?;
    Ok(columns)
}

/// Turn an expression into a column name: `jet_px[0]` becomes `jet_px0`,
/// arithmetic operators are spelled out and other punctuation is dropped.
pub fn normalize_column(expr: &str) -> String {
    let spelled = expr
        .replace('+', "_plus_")
        .replace('-', "_minus_")
        .replace('*', "_times_")
        .replace('/', "_div_");
    NON_IDENT.replace_all(&spelled, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        assert!(table_exists(&conn, "metadata").unwrap());
        assert!(table_exists(&conn, "grid_metadata").unwrap());
        assert!(!table_exists(&conn, "grid").unwrap());
        assert_eq!(get_schema_version(&conn).unwrap(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_table_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (a REAL, \"b c\" REAL, w REAL);")
            .unwrap();
        assert_eq!(table_columns(&conn, "t").unwrap(), vec!["a", "b c", "w"]);
    }

    #[test]
    fn test_normalize_column() {
        assert_eq!(normalize_column("jet_px[0]"), "jet_px0");
        assert_eq!(normalize_column("lp_x+lm_x"), "lp_x_plus_lm_x");
        assert_eq!(normalize_column("sqrt(a*b) / c"), "sqrta_times_b_div_c");
        assert_eq!(normalize_column("-x"), "_minus_x");
    }
}
