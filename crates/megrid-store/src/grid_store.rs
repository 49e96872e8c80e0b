//! Loading grids from source tables and persisting grids as tables.

use std::ops::Range;
use std::path::Path;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rusqlite::{Connection, params_from_iter};
use serde::Serialize;

use megrid_core::{
    CompiledExpr, FixedRotation, Grid, GridError, GridPoint, Provenance, SourceConfig,
    TransformPipeline,
};

use crate::error::{Result, StoreError};
use crate::schema::{self, normalize_column, quote_ident, table_exists};
use crate::source::{TableReader, expand_pattern};

/// What to read from one set of source files.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadRequest {
    pub name: String,
    pub pattern: String,
    pub table: String,
    /// One expression per grid dimension.
    pub coordinates: Vec<String>,
    /// Empty means unit weight.
    pub weight: String,
    /// Empty means every row.
    pub selection: String,
    pub max_points: Option<usize>,
    pub seed: u64,
    /// Row indices to read, per file.
    pub entry_range: Option<Range<u64>>,
}

impl LoadRequest {
    pub fn from_source(source: &SourceConfig) -> Self {
        Self {
            name: source.name.clone(),
            pattern: source.pattern.clone(),
            table: source.table.clone(),
            coordinates: source.coordinates.clone(),
            weight: source.weight.clone(),
            selection: source.selection.clone(),
            max_points: source.max_points,
            seed: source.seed,
            entry_range: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LoadReport {
    pub files: usize,
    pub rows_read: u64,
    pub selected: u64,
    pub skipped_missing: u64,
    pub skipped_zero_weight: u64,
    pub skipped_negative_weight: u64,
    pub kept: usize,
}

/// Algorithm R: a uniform sample of fixed size from a stream of unknown length.
pub struct Reservoir<T> {
    capacity: Option<usize>,
    seen: u64,
    items: Vec<T>,
    rng: SmallRng,
}

impl<T> Reservoir<T> {
    /// `None` keeps everything.
    pub fn new(capacity: Option<usize>, seed: u64) -> Self {
        Self {
            capacity,
            seen: 0,
            items: Vec::new(),
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn offer(&mut self, item: T) {
        let i = self.seen;
        self.seen += 1;
        match self.capacity {
            None => self.items.push(item),
            Some(cap) if (i as usize) < cap => self.items.push(item),
            Some(cap) => {
                let j = self.rng.random_range(0..=i);
                if (j as usize) < cap {
                    self.items[j as usize] = item;
                }
            }
        }
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn into_inner(self) -> Vec<T> {
        self.items
    }
}

fn compile_optional(source: &str) -> Result<Option<CompiledExpr>> {
    if source.trim().is_empty() {
        Ok(None)
    } else {
        Ok(Some(CompiledExpr::compile(source)?))
    }
}

/// Load one grid from every file matching the request's pattern.
///
/// Rows failing the selection are dropped, rows with a missing value are
/// skipped and counted, and zero or negative weights are skipped. When
/// `max_points` is set a seeded reservoir sample is kept, so the result is
/// an unbiased subsample of every selected row.
pub fn load(request: &LoadRequest) -> Result<(Grid, LoadReport)> {
    let ndim = request.coordinates.len();
    if ndim == 0 {
        return Err(GridError::InvalidConfig(format!(
            "grid '{}' has no coordinate expressions",
            request.name
        ))
        .into());
    }
    let coords = request
        .coordinates
        .iter()
        .map(|c| CompiledExpr::compile(c))
        .collect::<megrid_core::Result<Vec<_>>>()?;
    let weight = compile_optional(&request.weight)?;
    let selection = compile_optional(&request.selection)?;

    let mut columns: Vec<String> = Vec::new();
    for e in coords.iter().chain(weight.iter()).chain(selection.iter()) {
        for v in &e.variables {
            if !columns.contains(&v.column) {
                columns.push(v.column.clone());
            }
        }
    }

    let files = expand_pattern(&request.pattern)?;
    let mut report = LoadReport {
        files: files.len(),
        ..Default::default()
    };
    let mut reservoir = Reservoir::new(request.max_points, request.seed);

    for path in &files {
        let reader = TableReader::open(path, &request.table)?;
        if let Some(missing) = columns.iter().find(|c| !reader.has_column(c)) {
            return Err(GridError::MissingColumn(format!(
                "{missing} (in {}:{})",
                path.display(),
                request.table
            ))
            .into());
        }
        reader.for_each(&columns, request.entry_range.clone(), |_, row| {
            report.rows_read += 1;
            if let Some(sel) = &selection {
                match sel.test(&row) {
                    Some(true) => {}
                    Some(false) => return Ok(()),
                    None => {
                        report.skipped_missing += 1;
                        return Ok(());
                    }
                }
            }
            report.selected += 1;

            let w = match &weight {
                Some(e) => match e.eval(&row) {
                    Some(w) => w,
                    None => {
                        report.skipped_missing += 1;
                        return Ok(());
                    }
                },
                None => 1.0,
            };
            if w == 0.0 {
                report.skipped_zero_weight += 1;
                return Ok(());
            }
            if w.is_nan() || w < 0.0 {
                report.skipped_negative_weight += 1;
                return Ok(());
            }

            let Some(values) = coords.iter().map(|c| c.eval(&row)).collect::<Option<Vec<f64>>>()
            else {
                report.skipped_missing += 1;
                return Ok(());
            };
            reservoir.offer(GridPoint::new(values, w));
            Ok(())
        })?;
        tracing::info!(path = %path.display(), table = %request.table, "read grid source");
    }

    if report.skipped_negative_weight > 0 {
        tracing::warn!(
            source = %request.name,
            rows = report.skipped_negative_weight,
            "skipped rows with negative weight"
        );
    }

    let points = reservoir.into_inner();
    report.kept = points.len();
    let mut grid = Grid::from_points(&request.name, ndim, points)?;
    grid.provenance.push(Provenance {
        name: request.name.clone(),
        pattern: request.pattern.clone(),
        table: request.table.clone(),
        points: grid.len(),
        total_weight: grid.total_weight(),
        mixture: 1.0,
    });
    tracing::info!(
        source = %request.name,
        kept = report.kept,
        selected = report.selected,
        total_weight = grid.total_weight(),
        "loaded grid"
    );
    Ok((grid, report))
}

/// Load every source, scale each by its mixture factor and merge them.
pub fn load_sources(name: &str, sources: &[SourceConfig]) -> Result<Grid> {
    let mut merged: Option<Grid> = None;
    for source in sources {
        let (mut grid, _) = load(&LoadRequest::from_source(source))?;
        if source.mixture != 1.0 {
            grid.scale_weights(source.mixture);
        }
        merged = Some(match merged {
            None => grid,
            Some(acc) => acc.merge(&grid)?,
        });
    }
    let mut grid = merged.ok_or_else(|| StoreError::InvalidData(format!("unit '{name}' has no sources")))?;
    grid.name = name.to_string();
    if grid.is_empty() {
        return Err(GridError::EmptyGrid.into());
    }
    Ok(grid)
}

// ---------------------------------------------------------------------------
// Grid tables
// ---------------------------------------------------------------------------

/// Write `grid` as `table` (one REAL column per dimension plus `weight` and
/// `members`) and record its metadata. An existing table is replaced.
pub fn save_grid(conn: &Connection, table: &str, grid: &Grid, column_names: &[String]) -> Result<()> {
    if column_names.len() != grid.ndim() {
        return Err(GridError::DimensionMismatch {
            expected: grid.ndim(),
            found: column_names.len(),
        }
        .into());
    }
    let columns: Vec<String> = column_names.iter().map(|c| normalize_column(c)).collect();
    for (i, c) in columns.iter().enumerate() {
        if c.is_empty() || c == "weight" || c == "members" || columns[..i].contains(c) {
            return Err(StoreError::InvalidData(format!(
                "column name '{}' is empty or repeated after normalization",
                column_names[i]
            )));
        }
    }

    schema::initialize(conn)?;
    let tx = conn.unchecked_transaction()?;
    let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    tx.execute_batch(&format!(
        "DROP TABLE IF EXISTS {t}; CREATE TABLE {t} ({cols}, weight REAL NOT NULL, members INTEGER NOT NULL DEFAULT 1);",
        t = quote_ident(table),
        cols = quoted
            .iter()
            .map(|c| format!("{c} REAL NOT NULL"))
            .collect::<Vec<_>>()
            .join(", ")
    ))?;
    {
        let placeholders = (1..=grid.ndim() + 2)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut insert = tx.prepare(&format!(
            "INSERT INTO {} ({}, weight, members) VALUES ({placeholders})",
            quote_ident(table),
            quoted.join(", ")
        ))?;
        for p in grid.points() {
            let mut values: Vec<rusqlite::types::Value> =
                p.coords.iter().map(|&c| rusqlite::types::Value::Real(c)).collect();
            values.push(rusqlite::types::Value::Real(p.weight));
            values.push(rusqlite::types::Value::Integer(p.members as i64));
            insert.execute(params_from_iter(values))?;
        }
    }
    tx.execute(
        "INSERT OR REPLACE INTO grid_metadata (grid_table, name, ndim, columns, provenance, pipeline)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            table,
            grid.name,
            grid.ndim() as i64,
            serde_json::to_string(&columns)?,
            serde_json::to_string(&grid.provenance)?,
            serde_json::to_string(grid.pipeline())?,
        ],
    )?;
    tx.commit()?;
    tracing::info!(table, points = grid.len(), ndim = grid.ndim(), "saved grid");
    Ok(())
}

/// Read a grid written by [`save_grid`], with its pipeline and provenance.
pub fn load_grid(conn: &Connection, table: &str) -> Result<Grid> {
    if !table_exists(conn, table)? || !table_exists(conn, "grid_metadata")? {
        return Err(StoreError::SourceNotFound(format!("grid table '{table}'")));
    }
    let (name, ndim, columns, provenance, pipeline): (String, i64, String, String, String) = conn
        .query_row(
            "SELECT name, ndim, columns, provenance, pipeline FROM grid_metadata WHERE grid_table = ?1",
            [table],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                StoreError::SourceNotFound(format!("metadata for grid table '{table}'"))
            }
            other => other.into(),
        })?;
    let columns: Vec<String> = serde_json::from_str(&columns)?;
    let provenance: Vec<Provenance> = serde_json::from_str(&provenance)?;
    let pipeline: TransformPipeline = serde_json::from_str(&pipeline)?;
    let ndim = ndim as usize;
    if columns.len() != ndim {
        return Err(StoreError::InvalidData(format!(
            "grid '{table}' declares {ndim} dimensions but {} columns",
            columns.len()
        )));
    }

    let select = columns
        .iter()
        .map(|c| quote_ident(c))
        .chain(["weight".to_string(), "members".to_string()])
        .collect::<Vec<_>>()
        .join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT {select} FROM {} ORDER BY rowid",
        quote_ident(table)
    ))?;
    let points = stmt
        .query_map([], |row| {
            let coords = (0..ndim)
                .map(|i| row.get::<_, f64>(i))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(GridPoint {
                coords,
                weight: row.get(ndim)?,
                members: row.get::<_, i64>(ndim + 1)? as u64,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Grid::from_parts(&name, ndim, points, provenance, pipeline)?)
}

// ---------------------------------------------------------------------------
// Rotation tool
// ---------------------------------------------------------------------------

/// Evaluate `coordinates` per row, rotate every `(x, y)` key pair by the
/// per-row `rotation` angle (counter-clockwise about the beam axis) and
/// write the result as a grid table with columns named by `keys`.
///
/// Rows with a missing value are skipped. Returns the rows written.
pub fn rotate_table(
    input: &Path,
    input_table: &str,
    output: &Connection,
    output_table: &str,
    coordinates: &[String],
    keys: &[String],
    rotation: &str,
) -> Result<usize> {
    if coordinates.len() != keys.len() {
        return Err(GridError::DimensionMismatch {
            expected: keys.len(),
            found: coordinates.len(),
        }
        .into());
    }
    let rotate = FixedRotation::from_keys(keys)?;
    let exprs = coordinates
        .iter()
        .map(|c| CompiledExpr::compile(c))
        .collect::<megrid_core::Result<Vec<_>>>()?;
    let angle = CompiledExpr::compile(rotation)?;

    let reader = TableReader::open(input, input_table)?;
    let mut columns: Vec<String> = Vec::new();
    for e in exprs.iter().chain(std::iter::once(&angle)) {
        for v in &e.variables {
            if !reader.has_column(&v.column) {
                return Err(GridError::MissingColumn(v.column.clone()).into());
            }
            if !columns.contains(&v.column) {
                columns.push(v.column.clone());
            }
        }
    }
    let weight_column = reader.has_column("weight").then(|| "weight".to_string());
    if let Some(w) = &weight_column
        && !columns.contains(w)
    {
        columns.push(w.clone());
    }

    let mut grid = Grid::new(output_table, keys.len());
    let mut skipped = 0u64;
    reader.for_each(&columns, None, |_, row| {
        let values = exprs.iter().map(|e| e.eval(&row)).collect::<Option<Vec<f64>>>();
        let (Some(mut values), Some(phi)) = (values, angle.eval(&row)) else {
            skipped += 1;
            return Ok(());
        };
        rotate.apply(&mut values, phi);
        let w = weight_column
            .as_deref()
            .and_then(|c| row.scalar(c))
            .unwrap_or(1.0);
        grid.push(GridPoint::new(values, w))?;
        Ok(())
    })?;
    if skipped > 0 {
        tracing::warn!(skipped, "rows with missing values not rotated");
    }
    save_grid(output, output_table, &grid, keys)?;
    Ok(grid.len())
}
