//! Per-event orchestration.
//!
//! Each entry runs `LOAD -> SELECT -> RESOLVE_CHARGE -> BUILD_KINEMATICS ->
//! RECOIL_ESTIMATE -> DENSITY_EVAL -> RECORD`, exiting early at any stage.
//! The row is loaded and the kinematics are built once per entry; selection,
//! recoil, evaluation and recording run once per configured unit.
//!
//! Same-sign lepton pairs get their charges assigned by a seeded 50/50 draw.
//! The draw is an accepted source of non-determinism across seeds, and is
//! reproducible for a fixed `charge_seed`.

use std::time::Instant;

use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

use crate::density::DensityEstimator;
use crate::error::{GridError, Result};
use crate::event::{CoordinateSpec, EventRecord, EventSchema, ObjectId, Topology, resolve_charge};
use crate::expr::CompiledExpr;
use crate::recoil::{RecoilEstimator, RecoilInputs, estimate_recoil, recoil_key};
use crate::row::RowData;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Load,
    Select,
    ResolveCharge,
    BuildKinematics,
    RecoilEstimate,
    DensityEval,
    Record,
}

/// One evaluated event for one unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub unit: String,
    pub me: f64,
    pub error: f64,
    /// Neighbors used by the estimator.
    pub neval: usize,
    /// Wall time of the density evaluation in seconds.
    pub time: f64,
    /// Process CPU time of the density evaluation in seconds, where the
    /// platform exposes a process clock.
    pub cpu_time: Option<f64>,
    pub entry: u64,
    pub evtnum: i64,
    pub runnum: i64,
    /// Recoil px, py when estimated.
    pub extra: Vec<f64>,
    pub stage: Stage,
}

/// Counts reported at the end of a run.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunSummary {
    /// Entries visited.
    pub entries: u64,
    /// Unit evaluations rejected by the selection predicate.
    pub selected_out: u64,
    /// Unit evaluations skipped for having too few jets.
    pub skipped_jets: u64,
    /// Unit evaluations skipped for missing optional values.
    pub skipped_missing: u64,
    /// Entries whose kinematics could not be built, such as tau leptons.
    pub failed: u64,
    pub evaluated: u64,
    pub recorded: u64,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "entries={} selected_out={} skipped_jets={} skipped_missing={} failed={} evaluated={} recorded={}",
            self.entries,
            self.selected_out,
            self.skipped_jets,
            self.skipped_missing,
            self.failed,
            self.evaluated,
            self.recorded
        )
    }
}

// ---------------------------------------------------------------------------
// Collaborator seams
// ---------------------------------------------------------------------------

/// Random-access input table of events.
pub trait EventSource {
    type Error: From<GridError>;

    fn entries(&self) -> u64;
    fn has_column(&self, name: &str) -> bool;
    fn load(&mut self, entry: u64) -> std::result::Result<RowData, Self::Error>;
}

/// Destination of result rows; each append is durable when it returns.
pub trait ResultSink {
    type Error: From<GridError>;

    fn record(&mut self, result: &ResultRecord) -> std::result::Result<(), Self::Error>;
}

/// Crash-recovery snapshot of the record currently being processed.
pub trait SideBuffer {
    type Error: From<GridError>;

    fn snapshot(&mut self, result: &ResultRecord) -> std::result::Result<(), Self::Error>;
}

// ---------------------------------------------------------------------------
// Units and options
// ---------------------------------------------------------------------------

/// A configured grid with everything needed to evaluate events against it.
pub struct EvaluationUnit {
    pub name: String,
    pub topology: Topology,
    pub coordinates: Vec<CoordinateSpec>,
    pub estimator: DensityEstimator,
    pub selection: Option<CompiledExpr>,
    pub recoil: Option<Box<dyn RecoilEstimator>>,
}

impl EvaluationUnit {
    /// Check that event coordinates line up with the grid's query space and
    /// that the recoil model covers every jet multiplicity the unit accepts.
    pub fn validate(&self) -> Result<()> {
        let expected = self
            .estimator
            .grid()
            .pipeline()
            .query_ndim()
            .unwrap_or_else(|| self.estimator.grid().ndim());
        if self.coordinates.len() != expected {
            return Err(GridError::DimensionMismatch {
                expected,
                found: self.coordinates.len(),
            });
        }
        let uses_recoil = self.coordinates.iter().any(|c| c.object == ObjectId::Recoil);
        if uses_recoil && self.recoil.is_none() {
            return Err(GridError::InvalidConfig(format!(
                "unit '{}' uses recoil coordinates without a recoil model",
                self.name
            )));
        }
        if let Some(model) = &self.recoil {
            // events below the topology's jet count never reach the model
            let counts: &[usize] = if self.topology.jets() == 0 { &[0, 1] } else { &[1] };
            for &njets in counts {
                let key = recoil_key(&self.name, njets)?;
                if !model.has_key(&key) {
                    return Err(GridError::InvalidConfig(format!(
                        "recoil model for unit '{}' has no key '{key}'",
                        self.name
                    )));
                }
            }
        }
        let needs_sublead = self.coordinates.iter().any(|c| c.object == ObjectId::SubleadJet);
        let needs_lead = self.coordinates.iter().any(|c| c.object == ObjectId::LeadJet);
        let needed = if needs_sublead { 2 } else { usize::from(needs_lead) };
        if needed > self.topology.jets() {
            return Err(GridError::InvalidConfig(format!(
                "unit '{}' references {needed} jets but topology {:?} provides {}",
                self.name,
                self.topology,
                self.topology.jets()
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorOptions {
    pub begin: u64,
    /// Exclusive end; `None` runs to the last entry.
    pub end: Option<u64>,
    /// Evaluate a random subsample of this many selected entries.
    pub random: Option<usize>,
    pub seed: u64,
    pub charge_seed: u64,
}

impl Default for EvaluatorOptions {
    fn default() -> Self {
        Self {
            begin: 0,
            end: None,
            random: None,
            seed: 42,
            charge_seed: 42,
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

pub struct EventEvaluator {
    units: Vec<EvaluationUnit>,
    schema: EventSchema,
    options: EvaluatorOptions,
}

enum Selection {
    Pass,
    Fail,
    Missing,
}

impl EventEvaluator {
    pub fn new(
        units: Vec<EvaluationUnit>,
        schema: EventSchema,
        options: EvaluatorOptions,
    ) -> Result<Self> {
        if units.is_empty() {
            return Err(GridError::InvalidConfig("no evaluation units".into()));
        }
        for u in &units {
            u.validate()?;
        }
        if schema.unit.is_nan() || schema.unit <= 0.0 {
            return Err(GridError::InvalidConfig(format!(
                "momentum unit must be positive, got {}",
                schema.unit
            )));
        }
        Ok(Self {
            units,
            schema,
            options,
        })
    }

    pub fn units(&self) -> &[EvaluationUnit] {
        &self.units
    }

    pub fn schema(&self) -> &EventSchema {
        &self.schema
    }

    /// Fail on the first column the run needs but the source lacks.
    pub fn check_source<S: EventSource>(&self, source: &S) -> Result<()> {
        let recoil = self.units.iter().any(|u| u.recoil.is_some());
        self.schema.check_columns(|c| source.has_column(c), recoil)?;
        for u in &self.units {
            if let Some(sel) = &u.selection
                && let Some(v) = sel.variables.iter().find(|v| !source.has_column(&v.column))
            {
                return Err(GridError::MissingColumn(v.column.clone()));
            }
        }
        Ok(())
    }

    /// Entries to visit, in order.
    ///
    /// With `random` set, entries passing any unit's selection are collected
    /// first and a seeded sample of them is returned.
    pub fn plan<S: EventSource>(&self, source: &mut S) -> std::result::Result<Vec<u64>, S::Error> {
        let end = self
            .options
            .end
            .map_or(source.entries(), |e| e.min(source.entries()));
        let range = self.options.begin.min(end)..end;
        let Some(n) = self.options.random else {
            return Ok(range.collect());
        };

        let mut selected = Vec::new();
        for entry in range {
            let row = source.load(entry)?;
            let pass = self
                .units
                .iter()
                .any(|u| matches!(select(u, &row), Selection::Pass));
            if pass {
                selected.push(entry);
            }
        }
        if n >= selected.len() {
            return Ok(selected);
        }
        let mut rng = SmallRng::seed_from_u64(self.options.seed);
        let mut picked: Vec<u64> = rand::seq::index::sample(&mut rng, selected.len(), n)
            .into_iter()
            .map(|i| selected[i])
            .collect();
        picked.sort_unstable();
        Ok(picked)
    }

    /// Evaluate every planned entry against every unit.
    pub fn run<S, K, B, E>(
        &self,
        source: &mut S,
        sink: &mut K,
        buffer: &mut B,
    ) -> std::result::Result<RunSummary, E>
    where
        S: EventSource<Error = E>,
        K: ResultSink<Error = E>,
        B: SideBuffer<Error = E>,
        E: From<GridError>,
    {
        self.check_source(source)?;
        let entries = self.plan(source)?;
        let mut charge_rng = SmallRng::seed_from_u64(self.options.charge_seed);
        let mut summary = RunSummary::default();
        tracing::info!(entries = entries.len(), units = self.units.len(), "starting event loop");

        for entry in entries {
            summary.entries += 1;
            let row = source.load(entry)?;

            let mut active = Vec::with_capacity(self.units.len());
            for (i, unit) in self.units.iter().enumerate() {
                match select(unit, &row) {
                    Selection::Pass => active.push(i),
                    Selection::Fail => {
                        tracing::debug!(entry, unit = %unit.name, "failed selection");
                        summary.selected_out += 1;
                    }
                    Selection::Missing => {
                        tracing::debug!(entry, unit = %unit.name, "selection inputs missing");
                        summary.skipped_missing += 1;
                    }
                }
            }
            if active.is_empty() {
                continue;
            }

            let (id0, id1) = self.schema.lepton_ids(&row)?;
            let ids = resolve_charge(id0, id1, &mut charge_rng);
            if ids != (id0, id1) {
                tracing::debug!(entry, id0, id1, "resolved same-sign pair");
            }
            let event = match self.schema.build(&row, entry, ids) {
                Ok(event) => event,
                Err(GridError::UnsupportedLepton(id)) => {
                    tracing::warn!(entry, id, "unsupported lepton; skipping event");
                    summary.failed += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            for i in active {
                let unit = &self.units[i];
                if let Some(record) = self.evaluate_unit(unit, &event, &row, buffer, &mut summary)? {
                    sink.record(&record)?;
                    summary.recorded += 1;
                }
            }
        }

        tracing::info!(%summary, "event loop finished");
        Ok(summary)
    }

    fn evaluate_unit<B, E>(
        &self,
        unit: &EvaluationUnit,
        event: &EventRecord,
        row: &RowData,
        buffer: &mut B,
        summary: &mut RunSummary,
    ) -> std::result::Result<Option<ResultRecord>, E>
    where
        B: SideBuffer<Error = E>,
        E: From<GridError>,
    {
        if !event.fits(unit.topology) {
            tracing::debug!(entry = event.entry, unit = %unit.name, jets = event.jets.len(), "too few jets");
            summary.skipped_jets += 1;
            return Ok(None);
        }

        let mut event = event.clone();
        let mut extra = Vec::new();
        if let Some(model) = &unit.recoil {
            let inputs = match RecoilInputs::gather(&event, row, &self.schema) {
                Ok(inputs) => inputs,
                Err(GridError::MissingField(field)) => {
                    tracing::debug!(entry = event.entry, unit = %unit.name, field = %field, "recoil inputs missing");
                    summary.skipped_missing += 1;
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };
            let key = recoil_key(&unit.name, event.jets.len())?;
            let recoil = estimate_recoil(model.as_ref(), &key, &inputs)?;
            extra = vec![recoil.px, recoil.py];
            event.recoil = Some(recoil);
        }

        let Some(coords) = event.coordinates(&unit.coordinates) else {
            summary.skipped_missing += 1;
            return Ok(None);
        };

        let mut record = ResultRecord {
            unit: unit.name.clone(),
            me: 0.0,
            error: 0.0,
            neval: 0,
            time: 0.0,
            cpu_time: None,
            entry: event.entry,
            evtnum: event.event_number,
            runnum: event.run_number,
            extra,
            stage: Stage::DensityEval,
        };
        buffer.snapshot(&record)?;

        let start = Instant::now();
        let cpu_start = process_cpu_time();
        let density = unit.estimator.evaluate(&coords)?;
        record.time = start.elapsed().as_secs_f64();
        record.cpu_time = cpu_start
            .zip(process_cpu_time())
            .map(|(a, b)| (b - a).max(0.0));
        record.me = density.value;
        record.error = density.error;
        record.neval = density.diagnostics.neighbors;
        record.stage = Stage::Record;
        summary.evaluated += 1;
        if !density.diagnostics.bracketed {
            tracing::debug!(entry = event.entry, unit = %unit.name, "filter variance not bracketed");
        }
        buffer.snapshot(&record)?;
        Ok(Some(record))
    }
}

/// Seconds of CPU time consumed by this process.
#[cfg(unix)]
fn process_cpu_time() -> Option<f64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // fills ts on success, leaves it untouched otherwise
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_PROCESS_CPUTIME_ID, &mut ts) };
    (rc == 0).then(|| ts.tv_sec as f64 + ts.tv_nsec as f64 * 1e-9)
}

#[cfg(not(unix))]
fn process_cpu_time() -> Option<f64> {
    None
}

fn select(unit: &EvaluationUnit, row: &RowData) -> Selection {
    match &unit.selection {
        None => Selection::Pass,
        Some(expr) => match expr.test(row) {
            Some(true) => Selection::Pass,
            Some(false) => Selection::Fail,
            None => Selection::Missing,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::density::DensityParams;
    use crate::grid::Grid;
    use crate::point::GridPoint;
    use crate::recoil::LinearRecoilModel;
    use crate::row::Value;
    use rand::Rng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(42)
    }

    struct MemSource {
        rows: Vec<RowData>,
        loads: usize,
    }

    impl EventSource for MemSource {
        type Error = GridError;

        fn entries(&self) -> u64 {
            self.rows.len() as u64
        }

        fn has_column(&self, name: &str) -> bool {
            self.rows.first().is_some_and(|r| r.has(name))
        }

        fn load(&mut self, entry: u64) -> Result<RowData> {
            self.loads += 1;
            Ok(self.rows[entry as usize].clone())
        }
    }

    #[derive(Default)]
    struct MemSink(Vec<ResultRecord>);

    impl ResultSink for MemSink {
        type Error = GridError;

        fn record(&mut self, result: &ResultRecord) -> Result<()> {
            self.0.push(result.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemBuffer(Vec<Stage>);

    impl SideBuffer for MemBuffer {
        type Error = GridError;

        fn snapshot(&mut self, result: &ResultRecord) -> Result<()> {
            self.0.push(result.stage);
            Ok(())
        }
    }

    fn event_row(i: usize, id1: f64, njets: usize) -> RowData {
        let jets: Vec<f64> = (0..njets).map(|j| 50_000.0 - 10_000.0 * j as f64).collect();
        RowData::new()
            .with("EventNumber", Value::Scalar(1000.0 + i as f64))
            .with("RunNumber", Value::Scalar(1.0))
            .with("lepID0", Value::Scalar(-11.0))
            .with("lepID1", Value::Scalar(id1))
            .with("lepPt0", Value::Scalar(30_000.0 + 1000.0 * i as f64))
            .with("lepPt1", Value::Scalar(20_000.0))
            .with("lepEta0", Value::Scalar(0.1))
            .with("lepEta1", Value::Scalar(-0.4))
            .with("lepPhi0", Value::Scalar(0.3))
            .with("lepPhi1", Value::Scalar(-2.0))
            .with("m_jet_n", Value::Scalar(njets as f64))
            .with("m_jet_pt", Value::Array(jets))
            .with("m_jet_eta", Value::Array(vec![0.5; njets]))
            .with("m_jet_phi", Value::Array(vec![1.0; njets]))
            .with("MET_x", Value::Scalar(15_000.0))
            .with("MET_y", Value::Scalar(5_000.0))
            .with("MET", Value::Scalar(15_811.0))
            .with("MET_x_TrackHWW", Value::Scalar(14_000.0))
            .with("MET_y_TrackHWW", Value::Scalar(4_000.0))
            .with("Nvxp", Value::Scalar(10.0))
            .with("averageIntPerXing", Value::Scalar(20.0))
    }

    fn grid_2d(name: &str) -> Grid {
        let mut rng = rng();
        let points = (0..500)
            .map(|_| {
                GridPoint::new(
                    vec![rng.random::<f64>() * 60.0, rng.random::<f64>() * 60.0],
                    1.0,
                )
            })
            .collect();
        Grid::from_points(name, 2, points).unwrap()
    }

    fn unit(name: &str, coords: &[&str], selection: Option<&str>) -> EvaluationUnit {
        let specs: Vec<String> = coords.iter().map(|s| s.to_string()).collect();
        EvaluationUnit {
            name: name.to_string(),
            topology: Topology::Dilepton,
            coordinates: CoordinateSpec::parse_all(&specs).unwrap(),
            estimator: DensityEstimator::new(grid_2d(name), DensityParams::default()).unwrap(),
            selection: selection.map(|s| CompiledExpr::compile(s).unwrap()),
            recoil: None,
        }
    }

    fn source(n: usize) -> MemSource {
        MemSource {
            rows: (0..n).map(|i| event_row(i, 13.0, 1)).collect(),
            loads: 0,
        }
    }

    #[test]
    fn test_records_every_selected_event() {
        let ev = EventEvaluator::new(
            vec![unit("hww", &["lp.pt", "lm.pt"], None)],
            EventSchema::default(),
            EvaluatorOptions::default(),
        )
        .unwrap();
        let mut src = source(5);
        let mut sink = MemSink::default();
        let mut buf = MemBuffer::default();
        let summary = ev.run(&mut src, &mut sink, &mut buf).unwrap();

        assert_eq!(summary.entries, 5);
        assert_eq!(summary.recorded, 5);
        assert_eq!(sink.0.len(), 5);
        assert!(sink.0.iter().all(|r| r.me > 0.0 && r.error > 0.0 && r.stage == Stage::Record));
        assert_eq!(sink.0[2].evtnum, 1002);
        // before and after density evaluation, per record
        assert_eq!(buf.0.len(), 10);
        assert_eq!(buf.0[0], Stage::DensityEval);
        assert_eq!(buf.0[1], Stage::Record);
        #[cfg(unix)]
        assert!(sink.0.iter().all(|r| r.cpu_time.is_some_and(|t| t >= 0.0)));
    }

    #[test]
    fn test_selection_and_range() {
        let ev = EventEvaluator::new(
            vec![unit("hww", &["lp.pt", "lm.pt"], Some("lepPt0 > 31500"))],
            EventSchema::default(),
            EvaluatorOptions {
                begin: 1,
                end: Some(4),
                ..Default::default()
            },
        )
        .unwrap();
        let mut src = source(6);
        let mut sink = MemSink::default();
        let summary = ev.run(&mut src, &mut sink, &mut MemBuffer::default()).unwrap();
        assert_eq!(summary.entries, 3);
        assert_eq!(summary.selected_out, 1);
        let entries: Vec<u64> = sink.0.iter().map(|r| r.entry).collect();
        assert_eq!(entries, vec![2, 3]);
    }

    #[test]
    fn test_random_subsample_is_seeded() {
        let make = |seed| {
            EventEvaluator::new(
                vec![unit("hww", &["lp.pt", "lm.pt"], Some("lepPt0 >= 32000"))],
                EventSchema::default(),
                EvaluatorOptions {
                    random: Some(4),
                    seed,
                    ..Default::default()
                },
            )
            .unwrap()
        };
        let a = make(3).plan(&mut source(20)).unwrap();
        let b = make(3).plan(&mut source(20)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 4);
        assert!(a.iter().all(|&e| e >= 2));
        assert!(a.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_missing_required_column_is_fatal() {
        let ev = EventEvaluator::new(
            vec![unit("hww", &["lp.pt", "lm.pt"], None)],
            EventSchema {
                met: "MET_RefFinal".into(),
                ..Default::default()
            },
            EvaluatorOptions::default(),
        )
        .unwrap();
        let err = ev
            .run(&mut source(3), &mut MemSink::default(), &mut MemBuffer::default())
            .unwrap_err();
        assert_eq!(err, GridError::MissingField("MET_RefFinal".into()));
    }

    #[test]
    fn test_unknown_selection_column_is_fatal() {
        let ev = EventEvaluator::new(
            vec![unit("hww", &["lp.pt", "lm.pt"], Some("Mll > 10"))],
            EventSchema::default(),
            EvaluatorOptions::default(),
        )
        .unwrap();
        let err = ev
            .run(&mut source(3), &mut MemSink::default(), &mut MemBuffer::default())
            .unwrap_err();
        assert_eq!(err, GridError::MissingColumn("Mll".into()));
    }

    #[test]
    fn test_topology_skips_events_without_jets() {
        let mut u = unit("hww", &["lp.pt", "leadj.pt"], None);
        u.topology = Topology::OneJet;
        let ev = EventEvaluator::new(vec![u], EventSchema::default(), EvaluatorOptions::default())
            .unwrap();
        let mut src = MemSource {
            rows: vec![event_row(0, 13.0, 0), event_row(1, 13.0, 2)],
            loads: 0,
        };
        let mut sink = MemSink::default();
        let summary = ev.run(&mut src, &mut sink, &mut MemBuffer::default()).unwrap();
        assert_eq!(summary.skipped_jets, 1);
        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].entry, 1);
    }

    #[test]
    fn test_rejects_inconsistent_units() {
        let wrong_dim = unit("hww", &["lp.pt"], None);
        assert!(EventEvaluator::new(vec![wrong_dim], EventSchema::default(), Default::default()).is_err());

        let jets = unit("hww", &["lp.pt", "subleadj.pt"], None);
        assert!(EventEvaluator::new(vec![jets], EventSchema::default(), Default::default()).is_err());

        let recoil = unit("hww", &["lp.pt", "recoil.pt"], None);
        assert!(EventEvaluator::new(vec![recoil], EventSchema::default(), Default::default()).is_err());

        assert!(EventEvaluator::new(Vec::new(), EventSchema::default(), Default::default()).is_err());
    }

    #[test]
    fn test_same_sign_charge_reproducible() {
        let run = |charge_seed| {
            let ev = EventEvaluator::new(
                vec![unit("hww", &["lp.pt", "lm.pt"], None)],
                EventSchema::default(),
                EvaluatorOptions {
                    charge_seed,
                    ..Default::default()
                },
            )
            .unwrap();
            let mut src = MemSource {
                rows: (0..30).map(|i| event_row(i, -13.0, 0)).collect(),
                loads: 0,
            };
            let mut sink = MemSink::default();
            ev.run(&mut src, &mut sink, &mut MemBuffer::default()).unwrap();
            sink.0.iter().map(|r| r.me).collect::<Vec<_>>()
        };
        assert_eq!(run(9), run(9));
    }

    #[test]
    fn test_recoil_estimate_feeds_coordinates() {
        let model = LinearRecoilModel::from_json(
            r#"{"ggf_0j": {"intercept": -10.0}, "ggf_Nj": {"intercept": -20.0}}"#,
        )
        .unwrap();
        let mut u = unit("ggf125", &["lp.pt", "recoil.pt"], None);
        u.recoil = Some(Box::new(model));
        let ev = EventEvaluator::new(vec![u], EventSchema::default(), EvaluatorOptions::default())
            .unwrap();
        let mut src = MemSource {
            rows: vec![event_row(0, 13.0, 0), event_row(1, 13.0, 1)],
            loads: 0,
        };
        let mut sink = MemSink::default();
        ev.run(&mut src, &mut sink, &mut MemBuffer::default()).unwrap();
        assert_eq!(sink.0.len(), 2);
        assert_eq!(sink.0[0].extra, vec![10.0, 10.0]);
        assert_eq!(sink.0[1].extra, vec![20.0, 20.0]);
    }

    #[test]
    fn test_recoil_model_checked_at_setup() {
        let model = |json: &str| -> Box<dyn RecoilEstimator> {
            Box::new(LinearRecoilModel::from_json(json).unwrap())
        };
        let both = r#"{"ggf_0j": {}, "ggf_Nj": {}, "ww_0j": {}, "ww_Nj": {}}"#;

        let mut ttbar = unit("ttbar", &["lp.pt", "recoil.pt"], None);
        ttbar.recoil = Some(model(both));
        let err = EventEvaluator::new(vec![ttbar], EventSchema::default(), Default::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("ttbar"), "{err}");

        let mut no_jets_key = unit("hww", &["lp.pt", "recoil.pt"], None);
        no_jets_key.recoil = Some(model(r#"{"ggf_0j": {}}"#));
        let err = EventEvaluator::new(vec![no_jets_key], EventSchema::default(), Default::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("ggf_Nj"), "{err}");

        // a one-jet unit never asks for the zero-jet key
        let mut one_jet = unit("ww", &["lp.pt", "recoil.pt"], None);
        one_jet.topology = Topology::OneJet;
        one_jet.recoil = Some(model(r#"{"ww_Nj": {}}"#));
        assert!(EventEvaluator::new(vec![one_jet], EventSchema::default(), Default::default()).is_ok());
    }

    #[test]
    fn test_unsupported_lepton_skips_event() {
        let ev = EventEvaluator::new(
            vec![unit("hww", &["lp.pt", "lm.pt"], None)],
            EventSchema::default(),
            EvaluatorOptions::default(),
        )
        .unwrap();
        let mut src = MemSource {
            rows: vec![event_row(0, 13.0, 0), event_row(1, 15.0, 0), event_row(2, 11.0, 0)],
            loads: 0,
        };
        let mut sink = MemSink::default();
        let summary = ev.run(&mut src, &mut sink, &mut MemBuffer::default()).unwrap();
        assert_eq!(summary.entries, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.recorded, 2);
        let entries: Vec<u64> = sink.0.iter().map(|r| r.entry).collect();
        assert_eq!(entries, vec![0, 2]);
        assert!(summary.to_string().contains("failed=1 evaluated=2 recorded=2"));
    }

    #[test]
    fn test_row_loaded_once_per_entry() {
        let ev = EventEvaluator::new(
            vec![
                unit("hww", &["lp.pt", "lm.pt"], None),
                unit("ww", &["lp.pt", "met.pt"], None),
            ],
            EventSchema::default(),
            EvaluatorOptions::default(),
        )
        .unwrap();
        let mut src = source(4);
        let mut sink = MemSink::default();
        let summary = ev.run(&mut src, &mut sink, &mut MemBuffer::default()).unwrap();
        assert_eq!(src.loads, 4);
        assert_eq!(summary.recorded, 8);
        assert_eq!(sink.0.iter().filter(|r| r.unit == "ww").count(), 4);
    }
}
