use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rusqlite::Connection;

use megrid_core::{
    ClusterAlgorithm, ClusterConfig, EvaluatorOptions, EventEvaluator, Grid, cluster,
    cluster_in_bricks,
};
use megrid_store::{
    EventTable, JsonSideBuffer, LoadRequest, ResultWriter, TableReader, build_unit, expand_pattern,
    load, load_grid, load_unit, rotate_table, save_grid, split_location,
};

#[derive(Parser)]
#[command(name = "megrid", about = "Build, cluster and evaluate matrix-element grids")]
struct Cli {
    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress a grid table into weighted clusters
    Cluster {
        /// Source as FILE:TABLE (table defaults to "grid")
        #[arg(long)]
        input: String,

        /// Destination as FILE:TABLE
        #[arg(long)]
        output: String,

        /// Number of clusters to keep
        #[arg(long)]
        nclusters: usize,

        /// Coordinate expressions separated by '|'
        #[arg(long)]
        coords: String,

        #[arg(long, default_value = "kmeans")]
        algorithm: ClusterAlgorithm,

        /// First row to read
        #[arg(long)]
        min: Option<u64>,

        /// Row to stop before
        #[arg(long)]
        max: Option<u64>,

        #[arg(long, default_value_t = 0)]
        seed: u64,

        #[arg(long)]
        max_iter: Option<usize>,

        /// Cluster in bricks of this many points and merge the results
        #[arg(long)]
        bricks: Option<usize>,
    },

    /// Rotate (x, y) pairs by a per-row angle and write a new grid table
    Rotate {
        #[arg(long)]
        input: String,

        #[arg(long)]
        output: String,

        /// Coordinate expressions separated by '|'
        #[arg(long)]
        coords: String,

        /// Output column names separated by '|'; pairs end in x and y
        #[arg(long)]
        keys: String,

        /// Rotation angle expression, counter-clockwise
        #[arg(long, allow_hyphen_values = true)]
        rotation: String,
    },

    /// Evaluate events against one or more configuration units
    Evaluate {
        /// Unit configuration file(s)
        #[arg(long = "cfg", required = true)]
        cfgs: Vec<PathBuf>,

        /// Event file(s) or glob patterns
        #[arg(long = "input", required = true)]
        inputs: Vec<String>,

        /// Results database
        #[arg(long)]
        output: PathBuf,

        /// Event table name
        #[arg(long, default_value = "events")]
        tree: String,

        #[arg(long, default_value_t = 0)]
        begin: u64,

        #[arg(long)]
        end: Option<u64>,

        /// Evaluate a random subsample of this many selected events
        #[arg(long)]
        random: Option<usize>,

        #[arg(long, default_value_t = 42)]
        seed: u64,

        #[arg(long, default_value_t = 42)]
        charge_seed: u64,

        /// Side-buffer file holding the record in flight
        #[arg(long)]
        buffer: Option<PathBuf>,
    },

    /// Show a grid table's shape, weight and first rows
    Inspect {
        #[arg(long)]
        input: String,

        /// Coordinate expressions separated by '|'; omit for a saved grid
        #[arg(long)]
        coords: Option<String>,

        #[arg(long, default_value_t = 5)]
        rows: usize,
    },
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Cluster {
            input,
            output,
            nclusters,
            coords,
            algorithm,
            min,
            max,
            seed,
            max_iter,
            bricks,
        } => {
            let mut config = ClusterConfig::new(algorithm, nclusters);
            config.seed = seed;
            if let Some(n) = max_iter {
                config.max_iter = n;
            }
            let range = (min.is_some() || max.is_some())
                .then(|| min.unwrap_or(0)..max.unwrap_or(u64::MAX));
            cmd_cluster(&input, &output, &split_coords(&coords), &config, range, bricks)
        }
        Commands::Rotate {
            input,
            output,
            coords,
            keys,
            rotation,
        } => cmd_rotate(&input, &output, &split_coords(&coords), &split_coords(&keys), &rotation),
        Commands::Evaluate {
            cfgs,
            inputs,
            output,
            tree,
            begin,
            end,
            random,
            seed,
            charge_seed,
            buffer,
        } => {
            let options = EvaluatorOptions {
                begin,
                end,
                random,
                seed,
                charge_seed,
            };
            cmd_evaluate(&cfgs, &inputs, &output, &tree, options, buffer.as_deref())
        }
        Commands::Inspect {
            input,
            coords,
            rows,
        } => cmd_inspect(&input, coords.as_deref(), rows),
    }
}

/// `"a|b|c"` into its trimmed, non-empty parts.
fn split_coords(list: &str) -> Vec<String> {
    list.split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Grid request for a plain table, weighted by its `weight` column if any.
fn table_request(file: &str, table: &str, coords: &[String]) -> Result<LoadRequest> {
    let reader = TableReader::open(Path::new(file), table)
        .with_context(|| format!("failed to open {file}:{table}"))?;
    let weight = if reader.has_column("weight") {
        "weight".to_string()
    } else {
        String::new()
    };
    Ok(LoadRequest {
        name: table.to_string(),
        pattern: file.to_string(),
        table: table.to_string(),
        coordinates: coords.to_vec(),
        weight,
        selection: String::new(),
        max_points: None,
        seed: 0,
        entry_range: None,
    })
}

fn open_output(file: &str) -> Result<Connection> {
    Connection::open(file).with_context(|| format!("failed to open output {file}"))
}

fn cmd_cluster(
    input: &str,
    output: &str,
    coords: &[String],
    config: &ClusterConfig,
    range: Option<std::ops::Range<u64>>,
    bricks: Option<usize>,
) -> Result<()> {
    if coords.is_empty() {
        bail!("--coords names no coordinates");
    }
    let (in_file, in_table) = split_location(input, "grid");
    let (out_file, out_table) = split_location(output, "grid");

    let mut request = table_request(in_file, in_table, coords)?;
    request.entry_range = range;
    let (grid, loaded) = load(&request).with_context(|| format!("failed to load {input}"))?;
    println!(
        "loaded {} points (read {}, skipped {})",
        loaded.kept,
        loaded.rows_read,
        loaded.skipped_missing + loaded.skipped_zero_weight + loaded.skipped_negative_weight
    );

    let (clustered, report) = match bricks {
        Some(size) => cluster_in_bricks(&grid, config, size),
        None => cluster(&grid, config),
    }
    .context("clustering failed")?;
    if !report.converged {
        eprintln!(
            "warning: {} stopped after {} iterations without converging",
            report.algorithm, report.iterations
        );
    }

    let conn = open_output(out_file)?;
    save_grid(&conn, out_table, &clustered, coords)
        .with_context(|| format!("failed to write {output}"))?;
    println!(
        "{}: {} -> {} points, total weight {:.6}, {} iterations",
        report.algorithm,
        report.input_points,
        report.output_points,
        report.total_weight,
        report.iterations
    );
    Ok(())
}

fn cmd_rotate(
    input: &str,
    output: &str,
    coords: &[String],
    keys: &[String],
    rotation: &str,
) -> Result<()> {
    let (in_file, in_table) = split_location(input, "grid");
    let (out_file, out_table) = split_location(output, "grid");
    let conn = open_output(out_file)?;
    let written = rotate_table(
        Path::new(in_file),
        in_table,
        &conn,
        out_table,
        coords,
        keys,
        rotation,
    )
    .with_context(|| format!("failed to rotate {input}"))?;
    println!("rotated {written} rows into {output}");
    Ok(())
}

fn cmd_evaluate(
    cfgs: &[PathBuf],
    inputs: &[String],
    output: &Path,
    tree: &str,
    options: EvaluatorOptions,
    buffer: Option<&Path>,
) -> Result<()> {
    let mut units = Vec::with_capacity(cfgs.len());
    let mut schema = None;
    for path in cfgs {
        let config =
            load_unit(path).with_context(|| format!("invalid configuration {}", path.display()))?;
        match &schema {
            None => schema = Some(config.schema.clone()),
            Some(s) if *s != config.schema => {
                bail!(
                    "unit '{}' in {} uses a different event schema",
                    config.name,
                    path.display()
                );
            }
            Some(_) => {}
        }
        let base = path.parent().unwrap_or(Path::new("."));
        let unit = build_unit(&config, base)
            .with_context(|| format!("failed to build unit '{}'", config.name))?;
        println!(
            "unit {}: {} grid points in {} dimensions",
            unit.name,
            unit.estimator.grid().len(),
            unit.estimator.grid().ndim()
        );
        units.push(unit);
    }
    let schema = schema.context("no configuration units given")?;

    let mut files = Vec::new();
    for pattern in inputs {
        files.extend(expand_pattern(pattern).with_context(|| format!("no input for {pattern}"))?);
    }
    let mut events = EventTable::open(&files, tree).context("failed to open event input")?;

    let evaluator = EventEvaluator::new(units, schema, options).context("invalid run setup")?;
    let mut writer = ResultWriter::open(output)
        .with_context(|| format!("failed to open results {}", output.display()))?;
    let mut side = match buffer {
        Some(p) => JsonSideBuffer::new(p),
        None => JsonSideBuffer::disabled(),
    };

    let summary = evaluator
        .run(&mut events, &mut writer, &mut side)
        .context("evaluation failed")?;
    println!("run {}", writer.run_id());
    println!("{summary}");
    Ok(())
}

fn cmd_inspect(input: &str, coords: Option<&str>, rows: usize) -> Result<()> {
    let (file, table) = split_location(input, "grid");
    let grid: Grid = match coords {
        Some(list) => {
            let coords = split_coords(list);
            if coords.is_empty() {
                bail!("--coords names no coordinates");
            }
            let request = table_request(file, table, &coords)?;
            load(&request)
                .with_context(|| format!("failed to load {input}"))?
                .0
        }
        None => {
            if !Path::new(file).is_file() {
                bail!("{file} does not exist");
            }
            let conn = open_output(file)?;
            load_grid(&conn, table).with_context(|| format!("failed to read saved grid {input}"))?
        }
    };

    println!("grid:         {}", grid.name);
    println!("ndim:         {}", grid.ndim());
    println!("points:       {}", grid.len());
    println!("members:      {}", grid.total_members());
    println!("total weight: {:.6}", grid.total_weight());
    for (i, (lo, hi)) in grid.extents().iter().enumerate() {
        println!("dim {i}:        [{lo:.6}, {hi:.6}]");
    }
    if !grid.pipeline().is_empty() {
        let names: Vec<&str> = grid.pipeline().steps().iter().map(|s| s.name.as_str()).collect();
        println!("transforms:   {}", names.join(", "));
    }
    for p in grid.points().iter().take(rows) {
        let coords: Vec<String> = p.coords.iter().map(|c| format!("{c:.6}")).collect();
        println!("{}  w={:.6} n={}", coords.join(" "), p.weight, p.members);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_coords() {
        assert_eq!(split_coords("lpx| lpy |"), vec!["lpx", "lpy"]);
        assert!(split_coords("").is_empty());
    }

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
