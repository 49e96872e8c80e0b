//! Recoil estimation: the transverse momentum of the system recoiling
//! against the dilepton pair, supplied by an external regression model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};
use crate::event::{EventRecord, EventSchema};
use crate::kinematics::FourMomentum;
use crate::row::RowData;

/// Black-box regression: named inputs in, one scalar out.
///
/// Called twice per event, once with the x projections and once with the y
/// projections of the same inputs.
pub trait RecoilEstimator {
    fn estimate(&self, key: &str, inputs: &[(&'static str, f64)]) -> Result<f64>;

    /// Whether the model serves `key`.
    fn has_key(&self, key: &str) -> bool;
}

/// Model key from the grid name and jet multiplicity.
///
/// `hww*`, `gww*` and `ggf*` grids share the `ggf` model, `ww*` grids use
/// `ww`. The suffix is `_0j` without jets and `_Nj` otherwise.
pub fn recoil_key(grid_name: &str, njets: usize) -> Result<String> {
    let name = grid_name.to_ascii_lowercase();
    let base = if ["hww", "gww", "ggf"].iter().any(|p| name.starts_with(p)) {
        "ggf"
    } else if name.starts_with("ww") {
        "ww"
    } else {
        return Err(GridError::InvalidConfig(format!(
            "no recoil model for grid '{grid_name}'"
        )));
    };
    let suffix = if njets == 0 { "_0j" } else { "_Nj" };
    Ok(format!("{base}{suffix}"))
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Axis {
    X,
    Y,
}

/// Per-event regression inputs in GeV.
#[derive(Clone, Debug, PartialEq)]
pub struct RecoilInputs {
    pub dilep_pt: f64,
    pub dilep: (f64, f64),
    pub totjet: (f64, f64),
    pub totjet_scalarsumpt: f64,
    pub trackmet: (f64, f64),
    pub calomet: (f64, f64),
    pub numjets: usize,
    pub numprimvertices: f64,
    pub mu: f64,
}

impl RecoilInputs {
    /// Gather inputs from the built event and the raw row.
    pub fn gather(event: &EventRecord, row: &RowData, schema: &EventSchema) -> Result<Self> {
        let get = |c: &str| {
            row.scalar(c)
                .ok_or_else(|| GridError::MissingField(c.to_string()))
        };
        let u = schema.unit;
        let dilep = event.lp + event.lm;
        let totjet: FourMomentum = event.jets.iter().copied().sum();
        Ok(Self {
            dilep_pt: dilep.pt(),
            dilep: (dilep.px, dilep.py),
            totjet: (totjet.px, totjet.py),
            totjet_scalarsumpt: event.jets.iter().map(|j| j.pt()).sum(),
            trackmet: (get(&schema.trackmet_x)? / u, get(&schema.trackmet_y)? / u),
            calomet: (event.met.px, event.met.py),
            numjets: event.jets.len(),
            numprimvertices: get(&schema.vertices)?,
            mu: get(&schema.pileup)?,
        })
    }

    fn project(&self, axis: Axis) -> Vec<(&'static str, f64)> {
        let pick = |v: (f64, f64)| match axis {
            Axis::X => v.0,
            Axis::Y => v.1,
        };
        let mut out = vec![
            ("dilep_pt", self.dilep_pt),
            ("dilep_pxpy", pick(self.dilep)),
        ];
        if self.numjets > 0 {
            out.push(("totjet_pxpy", pick(self.totjet)));
            out.push(("totjet_scalarsumpt", self.totjet_scalarsumpt));
        }
        out.push(("trackmet_pxpy", pick(self.trackmet)));
        out.push(("calomet_pxpy", pick(self.calomet)));
        if self.numjets > 0 {
            out.push(("numjets", self.numjets as f64));
        }
        out.push(("numprimvertices", self.numprimvertices));
        out.push(("mu", self.mu));
        out
    }

    /// Named inputs for the x regression.
    pub fn x(&self) -> Vec<(&'static str, f64)> {
        self.project(Axis::X)
    }

    /// Named inputs for the y regression.
    pub fn y(&self) -> Vec<(&'static str, f64)> {
        self.project(Axis::Y)
    }
}

/// Run the estimator for both axes; the recoil is the negated estimate.
pub fn estimate_recoil<E: RecoilEstimator + ?Sized>(
    estimator: &E,
    key: &str,
    inputs: &RecoilInputs,
) -> Result<FourMomentum> {
    let px = estimator.estimate(key, &inputs.x())?;
    let py = estimator.estimate(key, &inputs.y())?;
    Ok(FourMomentum::transverse(-px, -py))
}

// ---------------------------------------------------------------------------
// Linear model
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearTerm {
    #[serde(default)]
    pub intercept: f64,
    #[serde(default)]
    pub coefficients: HashMap<String, f64>,
}

/// `intercept + sum(coefficient * input)` per model key.
///
/// Inputs without a coefficient contribute nothing; a coefficient naming
/// an input the key does not provide is a configuration error.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinearRecoilModel {
    pub models: HashMap<String, LinearTerm>,
}

impl LinearRecoilModel {
    pub fn from_json(text: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl RecoilEstimator for LinearRecoilModel {
    fn has_key(&self, key: &str) -> bool {
        self.models.contains_key(key)
    }

    fn estimate(&self, key: &str, inputs: &[(&'static str, f64)]) -> Result<f64> {
        let term = self
            .models
            .get(key)
            .ok_or_else(|| GridError::InvalidConfig(format!("recoil model has no key '{key}'")))?;
        let mut sum = term.intercept;
        for (name, c) in &term.coefficients {
            let v = inputs
                .iter()
                .find(|(n, _)| *n == name.as_str())
                .map(|(_, v)| *v)
                .ok_or_else(|| {
                    GridError::InvalidConfig(format!(
                        "recoil model '{key}' uses unknown input '{name}'"
                    ))
                })?;
            sum += c * v;
        }
        Ok(sum)
    }
}
