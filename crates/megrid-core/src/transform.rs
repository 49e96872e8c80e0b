//! Ordered coordinate transformations fitted on a grid and replayed on queries.
//!
//! A [`TransformSpec`] describes a step as configured. Fitting it against the
//! grid's current points produces a [`TransformStep`] with frozen parameters.
//! The [`TransformPipeline`] records every fitted step so that query vectors
//! go through exactly the same chain the grid went through.

use serde::{Deserialize, Serialize};

use crate::constants::EPSILON;
use crate::error::{GridError, Result};
use crate::point::GridPoint;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Azimuthal coordinate groups for [`TransformSpec::RotatePhi`].
///
/// Either a compact layout string such as `"x0:y0:z0:x1:y1:z1"`, where each
/// token's position is the coordinate index and its digit names the particle,
/// or explicit `[x, y]` index pairs. The first pair is the reference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PhiGroups {
    Layout(String),
    Pairs(Vec<[usize; 2]>),
}

impl PhiGroups {
    pub fn resolve(&self) -> Result<Vec<[usize; 2]>> {
        let pairs = match self {
            PhiGroups::Pairs(pairs) => pairs.clone(),
            PhiGroups::Layout(layout) => parse_layout(layout)?,
        };
        if pairs.is_empty() {
            return Err(GridError::InvalidConfig(
                "rotate_phi needs at least one (x, y) pair".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for &i in pairs.iter().flatten() {
            if !seen.insert(i) {
                return Err(GridError::InvalidConfig(format!(
                    "rotate_phi uses coordinate {i} in more than one place"
                )));
            }
        }
        Ok(pairs)
    }
}

/// Parse `"x0:y0:z0:x1:y1:z1"` into `[[0, 1], [3, 4]]`.
///
/// Particles are ordered by first appearance; `z` tokens and any other axis
/// letters only occupy an index.
fn parse_layout(layout: &str) -> Result<Vec<[usize; 2]>> {
    let mut particles: Vec<(String, Option<usize>, Option<usize>)> = Vec::new();

    for (index, token) in layout.split(':').enumerate() {
        let token = token.trim();
        let mut chars = token.chars();
        let axis = chars
            .next()
            .ok_or_else(|| GridError::InvalidConfig(format!("empty token in layout '{layout}'")))?
            .to_ascii_lowercase();
        let particle: String = chars.collect();
        if particle.is_empty() {
            return Err(GridError::InvalidConfig(format!(
                "layout token '{token}' has no particle id"
            )));
        }

        let slot = match particles.iter().position(|(p, _, _)| *p == particle) {
            Some(i) => i,
            None => {
                particles.push((particle.clone(), None, None));
                particles.len() - 1
            }
        };
        let target = match axis {
            'x' => &mut particles[slot].1,
            'y' => &mut particles[slot].2,
            _ => continue,
        };
        if target.replace(index).is_some() {
            return Err(GridError::InvalidConfig(format!(
                "particle '{particle}' repeats axis {axis} in layout '{layout}'"
            )));
        }
    }

    particles
        .into_iter()
        .filter_map(|(particle, x, y)| match (x, y) {
            (Some(x), Some(y)) => Some(Ok([x, y])),
            (None, None) => None,
            _ => Some(Err(GridError::InvalidConfig(format!(
                "particle '{particle}' needs both x and y in layout"
            )))),
        })
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_sampling() -> usize {
    1
}

/// A transform as configured, before fitting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformSpec {
    FixedScale {
        factors: Vec<f64>,
        #[serde(default = "default_true")]
        replay: bool,
    },
    GaussianWhiten {
        #[serde(default)]
        dims: Option<Vec<usize>>,
        #[serde(default = "default_true")]
        replay: bool,
    },
    RotatePhi {
        groups: PhiGroups,
        #[serde(default = "default_true")]
        replay: bool,
    },
    QuantileScale {
        #[serde(default = "default_sampling")]
        sampling: usize,
        #[serde(default = "default_true")]
        replay: bool,
    },
}

impl TransformSpec {
    /// Whether query vectors go through this step.
    ///
    /// A non-replayed step converts grid units only, e.g. MeV grids queried
    /// with GeV events.
    pub fn replay(&self) -> bool {
        match self {
            TransformSpec::FixedScale { replay, .. }
            | TransformSpec::GaussianWhiten { replay, .. }
            | TransformSpec::RotatePhi { replay, .. }
            | TransformSpec::QuantileScale { replay, .. } => *replay,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransformSpec::FixedScale { .. } => "fixed_scale",
            TransformSpec::GaussianWhiten { .. } => "gaussian_whiten",
            TransformSpec::RotatePhi { .. } => "rotate_phi",
            TransformSpec::QuantileScale { .. } => "quantile_scale",
        }
    }

    /// Fit this step against `points` of dimension `ndim`.
    pub fn fit(&self, points: &[GridPoint], ndim: usize) -> Result<TransformStep> {
        match self {
            TransformSpec::FixedScale { factors, .. } => {
                if factors.len() != ndim {
                    return Err(GridError::DimensionMismatch {
                        expected: ndim,
                        found: factors.len(),
                    });
                }
                Ok(TransformStep::FixedScale {
                    factors: factors.clone(),
                })
            }
            TransformSpec::GaussianWhiten { dims, .. } => {
                let dims = match dims {
                    Some(d) => d.clone(),
                    None => (0..ndim).collect(),
                };
                check_indices(&dims, ndim)?;
                fit_whiten(points, dims)
            }
            TransformSpec::RotatePhi { groups, .. } => {
                let pairs = groups.resolve()?;
                let flat: Vec<usize> = pairs.iter().flatten().copied().collect();
                check_indices(&flat, ndim)?;
                Ok(TransformStep::RotatePhi { pairs })
            }
            TransformSpec::QuantileScale { sampling, .. } => {
                if *sampling == 0 {
                    return Err(GridError::InvalidConfig(
                        "quantile_scale sampling must be at least 1".into(),
                    ));
                }
                fit_quantiles(points, ndim, *sampling)
            }
        }
    }
}

fn check_indices(indices: &[usize], ndim: usize) -> Result<()> {
    match indices.iter().find(|&&i| i >= ndim) {
        Some(&i) => Err(GridError::DimensionMismatch {
            expected: ndim,
            found: i + 1,
        }),
        None => Ok(()),
    }
}

fn fit_whiten(points: &[GridPoint], dims: Vec<usize>) -> Result<TransformStep> {
    if points.is_empty() {
        return Err(GridError::EmptyGrid);
    }
    let total: f64 = points.iter().map(|p| p.weight).sum();
    if total <= 0.0 {
        return Err(GridError::InvalidConfig(
            "cannot whiten a grid with zero total weight".into(),
        ));
    }

    let mut mean = Vec::with_capacity(dims.len());
    let mut std = Vec::with_capacity(dims.len());
    for &d in &dims {
        let m = points.iter().map(|p| p.weight * p.coords[d]).sum::<f64>() / total;
        let var = points
            .iter()
            .map(|p| {
                let dx = p.coords[d] - m;
                p.weight * dx * dx
            })
            .sum::<f64>()
            / total;
        let s = var.sqrt();
        if s.is_nan() || s <= EPSILON * (1.0 + m.abs()) {
            return Err(GridError::DegenerateDimension(d));
        }
        mean.push(m);
        std.push(s);
    }

    Ok(TransformStep::GaussianWhiten { dims, mean, std })
}

fn fit_quantiles(points: &[GridPoint], ndim: usize, sampling: usize) -> Result<TransformStep> {
    if points.is_empty() {
        return Err(GridError::EmptyGrid);
    }
    let mut knots = Vec::with_capacity(ndim);
    for d in 0..ndim {
        let mut values: Vec<f64> = points.iter().map(|p| p.coords[d]).collect();
        values.sort_by(f64::total_cmp);
        let last = values[values.len() - 1];
        let mut sampled: Vec<f64> = values.into_iter().step_by(sampling).collect();
        if sampled.last() != Some(&last) {
            sampled.push(last);
        }
        sampled.dedup();
        knots.push(sampled);
    }
    Ok(TransformStep::QuantileScale { knots })
}

// ---------------------------------------------------------------------------
// Fitted steps
// ---------------------------------------------------------------------------

/// A fitted transform, replayable without refitting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformStep {
    FixedScale {
        factors: Vec<f64>,
    },
    GaussianWhiten {
        dims: Vec<usize>,
        mean: Vec<f64>,
        std: Vec<f64>,
    },
    /// Rotate every pair by the angle that puts the first pair on +x, then
    /// drop the first pair's y coordinate.
    RotatePhi {
        pairs: Vec<[usize; 2]>,
    },
    /// Map each coordinate onto its empirical CDF through sorted knots.
    QuantileScale {
        knots: Vec<Vec<f64>>,
    },
}

impl TransformStep {
    pub fn output_ndim(&self, ndim: usize) -> usize {
        match self {
            TransformStep::RotatePhi { .. } => ndim - 1,
            _ => ndim,
        }
    }

    /// Apply the step to one coordinate vector.
    pub fn apply(&self, coords: &[f64]) -> Vec<f64> {
        match self {
            TransformStep::FixedScale { factors } => {
                coords.iter().zip(factors).map(|(x, f)| x * f).collect()
            }
            TransformStep::GaussianWhiten { dims, mean, std } => {
                let mut out = coords.to_vec();
                for (i, &d) in dims.iter().enumerate() {
                    out[d] = (coords[d] - mean[i]) / std[i];
                }
                out
            }
            TransformStep::RotatePhi { pairs } => {
                let [rx, ry] = pairs[0];
                let phi = coords[ry].atan2(coords[rx]);
                let mut out = coords.to_vec();
                rotate_pairs(&mut out, pairs, -phi);
                out.remove(ry);
                out
            }
            TransformStep::QuantileScale { knots } => coords
                .iter()
                .zip(knots)
                .map(|(&x, k)| empirical_cdf(k, x))
                .collect(),
        }
    }

    /// Reciprocal of a fixed scale; `None` for steps without a closed inverse.
    pub fn inverse(&self) -> Option<TransformStep> {
        match self {
            TransformStep::FixedScale { factors } => Some(TransformStep::FixedScale {
                factors: factors.iter().map(|f| 1.0 / f).collect(),
            }),
            _ => None,
        }
    }
}

/// Rotate every `(x, y)` pair of `coords` counter-clockwise by `angle`.
pub fn rotate_pairs(coords: &mut [f64], pairs: &[[usize; 2]], angle: f64) {
    let (sin, cos) = angle.sin_cos();
    for &[ix, iy] in pairs {
        let x = coords[ix];
        let y = coords[iy];
        coords[ix] = x * cos - y * sin;
        coords[iy] = x * sin + y * cos;
    }
}

/// Per-row rotation of named `(x, y)` pairs about the beam axis.
///
/// Unlike [`TransformSpec::RotatePhi`] the angle comes from outside (one per
/// row) and no dimension is dropped.
#[derive(Clone, Debug, PartialEq)]
pub struct FixedRotation {
    pairs: Vec<[usize; 2]>,
}

impl FixedRotation {
    /// Pair keys such as `lpx`/`lpy` by their particle prefix.
    ///
    /// Keys not ending in `x` or `y` are left alone; an `x` without its `y`
    /// (or the reverse) is an error.
    pub fn from_keys(keys: &[String]) -> Result<Self> {
        let mut pairs = Vec::new();
        for (ix, key) in keys.iter().enumerate() {
            let lower = key.to_ascii_lowercase();
            let Some(prefix) = lower.strip_suffix('x') else {
                continue;
            };
            let partner = format!("{prefix}y");
            let iy = keys
                .iter()
                .position(|k| k.to_ascii_lowercase() == partner)
                .ok_or_else(|| GridError::InvalidConfig(format!("key '{key}' has no y partner")))?;
            pairs.push([ix, iy]);
        }
        for key in keys {
            let lower = key.to_ascii_lowercase();
            if let Some(prefix) = lower.strip_suffix('y')
                && !keys.iter().any(|k| k.to_ascii_lowercase() == format!("{prefix}x"))
            {
                return Err(GridError::InvalidConfig(format!("key '{key}' has no x partner")));
            }
        }
        if pairs.is_empty() {
            return Err(GridError::InvalidConfig("no (x, y) key pairs to rotate".into()));
        }
        Ok(Self { pairs })
    }

    pub fn pairs(&self) -> &[[usize; 2]] {
        &self.pairs
    }

    pub fn apply(&self, coords: &mut [f64], angle: f64) {
        rotate_pairs(coords, &self.pairs, angle);
    }
}

fn empirical_cdf(knots: &[f64], x: f64) -> f64 {
    if knots.len() < 2 {
        return 0.5;
    }
    let last = knots.len() - 1;
    if x <= knots[0] {
        return 0.0;
    }
    if x >= knots[last] {
        return 1.0;
    }
    // knots[hi - 1] < x <= knots[hi]
    let hi = knots.partition_point(|&k| k < x);
    let lo = hi - 1;
    let frac = (x - knots[lo]) / (knots[hi] - knots[lo]);
    (lo as f64 + frac) / last as f64
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FittedStep {
    pub name: String,
    pub step: TransformStep,
    pub replay: bool,
    pub input_ndim: usize,
}

/// The ordered chain of fitted transforms applied to a grid.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformPipeline {
    steps: Vec<FittedStep>,
    #[serde(default)]
    frozen: bool,
}

impl TransformPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> &[FittedStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Fit `spec` on `points`, transform them in place and record the step.
    ///
    /// Returns the new dimensionality.
    pub fn fit_apply(
        &mut self,
        spec: &TransformSpec,
        points: &mut [GridPoint],
        ndim: usize,
    ) -> Result<usize> {
        if self.frozen {
            return Err(GridError::PipelineFrozen);
        }
        let step = spec.fit(points, ndim)?;
        for p in points.iter_mut() {
            p.coords = step.apply(&p.coords);
        }
        let out = step.output_ndim(ndim);
        tracing::debug!(step = spec.name(), ndim, out, "fitted transform");
        self.steps.push(FittedStep {
            name: spec.name().to_string(),
            step,
            replay: spec.replay(),
            input_ndim: ndim,
        });
        Ok(out)
    }

    /// Dimension of query vectors accepted by [`Self::apply`], or `None`
    /// when no replayed step constrains it.
    pub fn query_ndim(&self) -> Option<usize> {
        self.steps.iter().find(|s| s.replay).map(|s| s.input_ndim)
    }

    /// Replay the fitted chain on a query vector.
    ///
    /// Steps marked as non-replayed are skipped.
    pub fn apply(&self, query: &[f64]) -> Result<Vec<f64>> {
        let mut v = query.to_vec();
        for s in self.steps.iter().filter(|s| s.replay) {
            if v.len() != s.input_ndim {
                return Err(GridError::DimensionMismatch {
                    expected: s.input_ndim,
                    found: v.len(),
                });
            }
            v = s.step.apply(&v);
        }
        Ok(v)
    }
}
