use std::fmt;

use megrid_core::GridError;

#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    Json(serde_json::Error),
    Toml(toml::de::Error),
    Io(std::io::Error),
    Glob(glob::PatternError),
    /// No file matched a pattern, or a file lacks the named table.
    SourceNotFound(String),
    Grid(GridError),
    InvalidData(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "SQLite error: {e}"),
            StoreError::Json(e) => write!(f, "JSON error: {e}"),
            StoreError::Toml(e) => write!(f, "TOML error: {e}"),
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
            StoreError::Glob(e) => write!(f, "invalid file pattern: {e}"),
            StoreError::SourceNotFound(what) => write!(f, "source not found: {what}"),
            StoreError::Grid(e) => write!(f, "{e}"),
            StoreError::InvalidData(msg) => write!(f, "invalid data: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Sqlite(e) => Some(e),
            StoreError::Json(e) => Some(e),
            StoreError::Toml(e) => Some(e),
            StoreError::Io(e) => Some(e),
            StoreError::Glob(e) => Some(e),
            StoreError::Grid(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Json(e)
    }
}

impl From<toml::de::Error> for StoreError {
    fn from(e: toml::de::Error) -> Self {
        StoreError::Toml(e)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<glob::PatternError> for StoreError {
    fn from(e: glob::PatternError) -> Self {
        StoreError::Glob(e)
    }
}

impl From<GridError> for StoreError {
    fn from(e: GridError) -> Self {
        StoreError::Grid(e)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
