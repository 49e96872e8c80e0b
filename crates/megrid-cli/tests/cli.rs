//! CLI command integration tests.
//! Each test builds its own SQLite inputs in a temp directory.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use rusqlite::Connection;
use tempfile::TempDir;

fn megrid_cmd() -> Command {
    #[allow(deprecated)]
    Command::cargo_bin("megrid").unwrap()
}

/// 300 weighted (lpx, lpy, lmx, lmy) points in `grid.db:grid`.
fn grid_db(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("grid.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("CREATE TABLE grid (lpx REAL, lpy REAL, lmx REAL, lmy REAL, weight REAL);")
        .unwrap();
    for i in 0..300 {
        let phi = i as f64 * 0.21;
        let pt = 25.0 + (i % 11) as f64;
        conn.execute(
            "INSERT INTO grid VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                pt * phi.cos(),
                pt * phi.sin(),
                -0.7 * pt * phi.cos(),
                -0.7 * pt * phi.sin(),
                1.0 + (i % 2) as f64
            ],
        )
        .unwrap();
    }
    path
}

/// Ten opposite-sign dilepton events in `events.db:events`, momenta in MeV.
fn events_db(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("events.db");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE events (
            EventNumber INTEGER, RunNumber INTEGER,
            lepID0 INTEGER, lepID1 INTEGER,
            lepPt0 REAL, lepPt1 REAL, lepEta0 REAL, lepEta1 REAL, lepPhi0 REAL, lepPhi1 REAL,
            m_jet_n INTEGER, m_jet_pt TEXT, m_jet_eta TEXT, m_jet_phi TEXT,
            MET_x REAL, MET_y REAL, MET REAL
        );",
    )
    .unwrap();
    for i in 0..10 {
        let phi = 0.3 * i as f64;
        conn.execute(
            "INSERT INTO events VALUES (?1, 180164, 11, -13, ?2, ?3, 0.4, -0.2, ?4, ?5, 0, '[]', '[]', '[]', 1000.0, -2000.0, 2236.0)",
            rusqlite::params![
                1000 + i,
                28_000.0 + 500.0 * i as f64,
                21_000.0,
                phi,
                phi + std::f64::consts::PI
            ],
        )
        .unwrap();
    }
    path
}

fn write_unit(dir: &Path) -> PathBuf {
    let path = dir.join("ww.toml");
    std::fs::write(
        &path,
        r#"
name = "ww"
topology = "lvlv"
coordinates = ["lp.px", "lp.py"]

[[sources]]
name = "ww"
pattern = "grid.db"
coordinates = ["lpx", "lpy"]
weight = "weight"
"#,
    )
    .unwrap();
    path
}

fn location(path: &Path, table: &str) -> String {
    format!("{}:{table}", path.display())
}

#[test]
fn cluster_then_inspect() {
    let dir = TempDir::new().unwrap();
    let grid = grid_db(&dir);
    let out = dir.path().join("clustered.db");

    megrid_cmd()
        .args(["cluster", "--input", &location(&grid, "grid")])
        .args(["--output", &location(&out, "hww")])
        .args(["--nclusters", "20", "--coords", "lpx|lpy|lmx|lmy"])
        .args(["--algorithm", "hierarchical"])
        .assert()
        .success()
        .stdout(predicate::str::contains("loaded 300 points"))
        .stdout(predicate::str::contains("hierarchical: 300 -> 20 points"));

    megrid_cmd()
        .args(["inspect", "--input", &location(&out, "hww"), "--rows", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ndim:         4"))
        .stdout(predicate::str::contains("points:       20"))
        .stdout(predicate::str::contains("members:      300"))
        .stdout(predicate::str::contains("total weight: 450.000000"));
}

#[test]
fn cluster_index_range() {
    let dir = TempDir::new().unwrap();
    let grid = grid_db(&dir);
    let out = dir.path().join("clustered.db");

    megrid_cmd()
        .args(["cluster", "--input", &location(&grid, "grid")])
        .args(["--output", &location(&out, "part")])
        .args(["--nclusters", "10", "--coords", "lpx|lpy"])
        .args(["--min", "100", "--max", "200", "--seed", "7"])
        .assert()
        .success()
        .stdout(predicate::str::contains("loaded 100 points"))
        .stdout(predicate::str::contains("kmeans: 100 ->"));
}

#[test]
fn rotate_aligns_leading_lepton() {
    let dir = TempDir::new().unwrap();
    let grid = grid_db(&dir);
    let out = dir.path().join("rotated.db");

    megrid_cmd()
        .args(["rotate", "--input", &location(&grid, "grid")])
        .args(["--output", &location(&out, "rot")])
        .args(["--coords", "lpx|lpy|lmx|lmy", "--keys", "lpx|lpy|lmx|lmy"])
        .args(["--rotation", "-atan2(lpy, lpx)"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rotated 300 rows"));

    let conn = Connection::open(&out).unwrap();
    let max_lpy: f64 = conn
        .query_row("SELECT MAX(ABS(lpy)) FROM rot", [], |r| r.get(0))
        .unwrap();
    assert!(max_lpy < 1e-9);
    let min_lpx: f64 = conn
        .query_row("SELECT MIN(lpx) FROM rot", [], |r| r.get(0))
        .unwrap();
    assert!(min_lpx > 0.0);
}

#[test]
fn evaluate_writes_one_row_per_event() {
    let dir = TempDir::new().unwrap();
    grid_db(&dir);
    let events = events_db(&dir);
    let cfg = write_unit(dir.path());
    let results = dir.path().join("results.db");
    let buffer = dir.path().join("buffer.json");

    megrid_cmd()
        .arg("evaluate")
        .arg("--cfg")
        .arg(&cfg)
        .arg("--input")
        .arg(&events)
        .arg("--output")
        .arg(&results)
        .arg("--buffer")
        .arg(&buffer)
        .assert()
        .success()
        .stdout(predicate::str::contains("unit ww: 300 grid points in 2 dimensions"))
        .stdout(predicate::str::contains("evaluated=10 recorded=10"));

    let conn = Connection::open(&results).unwrap();
    let (rows, min_me): (i64, f64) = conn
        .query_row("SELECT COUNT(*), MIN(me) FROM ww", [], |r| Ok((r.get(0)?, r.get(1)?)))
        .unwrap();
    assert_eq!(rows, 10);
    assert!(min_me > 0.0);
    let timed: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM ww WHERE cpu_time IS NOT NULL AND cpu_time >= 0",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(timed, 10);
    let runnum: i64 = conn
        .query_row("SELECT DISTINCT runnum FROM ww", [], |r| r.get(0))
        .unwrap();
    assert_eq!(runnum, 180164);

    let snapshot = std::fs::read_to_string(&buffer).unwrap();
    assert!(snapshot.contains("\"stage\":\"record\""));
}

#[test]
fn evaluate_entry_range() {
    let dir = TempDir::new().unwrap();
    grid_db(&dir);
    let events = events_db(&dir);
    let cfg = write_unit(dir.path());
    let results = dir.path().join("results.db");

    megrid_cmd()
        .arg("evaluate")
        .arg("--cfg")
        .arg(&cfg)
        .arg("--input")
        .arg(&events)
        .arg("--output")
        .arg(&results)
        .args(["--begin", "2", "--end", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("entries=3"));

    let conn = Connection::open(&results).unwrap();
    let entries: Vec<i64> = conn
        .prepare("SELECT entry FROM ww ORDER BY entry")
        .unwrap()
        .query_map([], |r| r.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(entries, vec![2, 3, 4]);
}

// ---------------------------------------------------------------------------
// Failure exit codes
// ---------------------------------------------------------------------------

#[test]
fn cluster_rejects_zero_clusters() {
    let dir = TempDir::new().unwrap();
    let grid = grid_db(&dir);
    megrid_cmd()
        .args(["cluster", "--input", &location(&grid, "grid")])
        .args(["--output", &location(&dir.path().join("o.db"), "g")])
        .args(["--nclusters", "0", "--coords", "lpx|lpy"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("at least 1"));
}

#[test]
fn cluster_rejects_unknown_algorithm() {
    let dir = TempDir::new().unwrap();
    let grid = grid_db(&dir);
    megrid_cmd()
        .args(["cluster", "--input", &location(&grid, "grid")])
        .args(["--output", &location(&dir.path().join("o.db"), "g")])
        .args(["--nclusters", "5", "--coords", "lpx", "--algorithm", "spectral"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("spectral"));
}

#[test]
fn missing_input_fails() {
    let dir = TempDir::new().unwrap();
    megrid_cmd()
        .args(["inspect", "--input", &location(&dir.path().join("none.db"), "grid")])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));

    let grid = grid_db(&dir);
    megrid_cmd()
        .args(["inspect", "--input", &location(&grid, "nope"), "--coords", "lpx"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope"));
}

#[test]
fn rotate_rejects_unpaired_keys() {
    let dir = TempDir::new().unwrap();
    let grid = grid_db(&dir);
    megrid_cmd()
        .args(["rotate", "--input", &location(&grid, "grid")])
        .args(["--output", &location(&dir.path().join("r.db"), "rot")])
        .args(["--coords", "lpx|lpy|lmx", "--keys", "lpx|lpy|lmx"])
        .args(["--rotation", "0"])
        .assert()
        .failure();
}

#[test]
fn evaluate_rejects_bad_config() {
    let dir = TempDir::new().unwrap();
    let events = events_db(&dir);
    let cfg = dir.path().join("bad.toml");
    std::fs::write(&cfg, "name = \"ww\"\ntopology = \"lvlvjjj\"\n").unwrap();
    megrid_cmd()
        .arg("evaluate")
        .arg("--cfg")
        .arg(&cfg)
        .arg("--input")
        .arg(&events)
        .arg("--output")
        .arg(dir.path().join("results.db"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration"));
}
