//! Adaptive Gaussian filter (AGF) density estimation over a frozen grid.
//!
//! For each query the filter variance is solved so that the kernel-weighted
//! neighbor weight equals `wc` effective points: the bandwidth shrinks in
//! dense regions and grows in sparse ones. The estimate is
//! `W / (2 pi var)^(ndim/2) / total_weight`.
//!
//! The variance is confined to a window around the grid's own spread, so a
//! query far outside the support cannot widen the kernel to reach it.

use serde::{Deserialize, Serialize};

use crate::constants::{
    EPSILON, KMIN, MAX_FILTER_VARIANCE, MIN_FILTER_VARIANCE, WC_DEFAULT, WEIGHTS_MAXITER,
    WEIGHTS_TOL,
};
use crate::error::{GridError, Result};
use crate::grid::Grid;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kernel {
    #[default]
    Agf,
    Knn,
}

impl std::str::FromStr for Kernel {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "agf" | "adaptive" => Ok(Kernel::Agf),
            "knn" => Ok(Kernel::Knn),
            other => Err(GridError::InvalidConfig(format!("unknown kernel '{other}'"))),
        }
    }
}

/// Per-grid tunables, fixed when the estimator is built.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DensityParams {
    pub kernel: Kernel,
    /// Target filter weight in effective points.
    pub wc: f64,
    /// Nearest neighbors considered per query; 0 means all points.
    pub maxk: usize,
}

impl Default for DensityParams {
    fn default() -> Self {
        Self {
            kernel: Kernel::Agf,
            wc: WC_DEFAULT,
            maxk: 0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    /// Bracket moves plus root-finder iterations.
    pub iterations: usize,
    /// Filter weight of the farthest neighbor over the nearest.
    pub weight_ratio: f64,
    /// Achieved kernel-weighted neighbor weight.
    pub filter_weight: f64,
    pub variance: f64,
    pub neighbors: usize,
    pub bracketed: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Density {
    pub value: f64,
    pub error: f64,
    pub diagnostics: Diagnostics,
}

/// Serves density queries against a grid whose pipeline is frozen.
pub struct DensityEstimator {
    grid: Grid,
    params: DensityParams,
    total_weight: f64,
    mean_weight: f64,
    /// Weighted mean squared distance of the points from their centroid.
    spread: f64,
}

impl DensityEstimator {
    /// Take ownership of `grid` and freeze its transform pipeline.
    pub fn new(mut grid: Grid, params: DensityParams) -> Result<Self> {
        if grid.is_empty() {
            return Err(GridError::EmptyGrid);
        }
        let total_weight = grid.total_weight();
        if total_weight <= 0.0 || !total_weight.is_finite() {
            return Err(GridError::InvalidConfig(format!(
                "grid '{}' has non-positive total weight {total_weight}",
                grid.name
            )));
        }
        let params = DensityParams {
            wc: if params.wc > 0.0 { params.wc } else { WC_DEFAULT },
            ..params
        };
        grid.freeze();
        let mean_weight = total_weight / grid.len() as f64;
        let spread = spread(&grid, total_weight);
        tracing::debug!(grid = %grid.name, spread, "density estimator ready");
        Ok(Self {
            grid,
            params,
            total_weight,
            mean_weight,
            spread,
        })
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn params(&self) -> &DensityParams {
        &self.params
    }

    /// Evaluate at a query in the grid's original coordinate space.
    pub fn evaluate(&self, query: &[f64]) -> Result<Density> {
        let coords = self.grid.pipeline().apply(query)?;
        self.evaluate_transformed(&coords)
    }

    /// Evaluate at a query already in the grid's transformed space.
    pub fn evaluate_transformed(&self, coords: &[f64]) -> Result<Density> {
        if coords.len() != self.grid.ndim() {
            return Err(GridError::DimensionMismatch {
                expected: self.grid.ndim(),
                found: coords.len(),
            });
        }
        let mut neighbors: Vec<(f64, f64)> = self
            .grid
            .points()
            .iter()
            .map(|p| (p.distance_sq(coords), p.weight))
            .collect();

        let k = self.neighbor_count();
        if k < neighbors.len() {
            neighbors.select_nth_unstable_by(k - 1, |a, b| a.0.total_cmp(&b.0));
            neighbors.truncate(k);
        }
        neighbors.sort_by(|a, b| a.0.total_cmp(&b.0));

        Ok(match self.params.kernel {
            Kernel::Agf => self.adaptive(&neighbors),
            Kernel::Knn => self.knn(&neighbors),
        })
    }

    fn neighbor_count(&self) -> usize {
        let n = self.grid.len();
        match (self.params.kernel, self.params.maxk) {
            (Kernel::Agf, 0) => n,
            (Kernel::Agf, k) => k.max(KMIN).min(n),
            (Kernel::Knn, 0) => (self.params.wc.round() as usize).clamp(1, n),
            (Kernel::Knn, k) => k.clamp(1, n),
        }
    }

    fn adaptive(&self, neighbors: &[(f64, f64)]) -> Density {
        let ndim = self.grid.ndim() as f64;
        let n = self.grid.len() as f64;
        let wanted = self.params.wc * self.mean_weight;

        let nbr_weight: f64 = neighbors.iter().map(|&(_, w)| w).sum();
        let mean_dsq = neighbors.iter().map(|&(d, w)| d * w).sum::<f64>() / nbr_weight.max(EPSILON);
        let scale = mean_dsq.max(EPSILON);
        let min_var = MIN_FILTER_VARIANCE * self.spread;
        let max_var = MAX_FILTER_VARIANCE * self.spread;

        let solution = solve_variance(
            neighbors,
            wanted,
            (scale / n.powf(2.0 / ndim) / 32.0).clamp(min_var, max_var),
            scale.clamp(min_var, max_var),
            min_var,
            max_var,
        );
        if !solution.bracketed {
            tracing::warn!(
                wanted,
                variance = solution.variance,
                filter_weight = solution.weight,
                "failed to bracket filter variance; using bracket end"
            );
        }

        let var = solution.variance;
        let norm = (2.0 * std::f64::consts::PI * var).powf(ndim / 2.0);
        let value = solution.weight / norm / self.total_weight;

        let nearest = neighbors.first().map_or(0.0, |&(d, _)| (-d / var / 2.0).exp());
        let farthest = neighbors.last().map_or(0.0, |&(d, _)| (-d / var / 2.0).exp());
        let effective = solution.weight / self.mean_weight;

        Density {
            value,
            error: if effective > 0.0 { value / effective.sqrt() } else { value },
            diagnostics: Diagnostics {
                iterations: solution.iterations,
                weight_ratio: if nearest > 0.0 { farthest / nearest } else { 0.0 },
                filter_weight: solution.weight,
                variance: var,
                neighbors: neighbors.len(),
                bracketed: solution.bracketed,
            },
        }
    }

    fn knn(&self, neighbors: &[(f64, f64)]) -> Density {
        let ndim = self.grid.ndim();
        let inside: f64 = neighbors.iter().map(|&(_, w)| w).sum();
        let radius_sq = neighbors.last().map_or(EPSILON, |&(d, _)| d.max(EPSILON));
        let volume = unit_ball_volume(ndim) * radius_sq.powf(ndim as f64 / 2.0);
        let value = inside / self.total_weight / volume;
        let effective = inside / self.mean_weight;

        Density {
            value,
            error: if effective > 0.0 { value / effective.sqrt() } else { value },
            diagnostics: Diagnostics {
                iterations: 0,
                weight_ratio: 1.0,
                filter_weight: inside,
                variance: radius_sq,
                neighbors: neighbors.len(),
                bracketed: true,
            },
        }
    }
}

/// Falls back to 1 for a grid collapsed onto a single location.
fn spread(grid: &Grid, total_weight: f64) -> f64 {
    let ndim = grid.ndim();
    let mut centroid = vec![0.0; ndim];
    for p in grid.points() {
        for (c, x) in centroid.iter_mut().zip(&p.coords) {
            *c += p.weight * x;
        }
    }
    centroid.iter_mut().for_each(|c| *c /= total_weight);
    let s = grid
        .points()
        .iter()
        .map(|p| p.weight * p.distance_sq(&centroid))
        .sum::<f64>()
        / total_weight;
    if s > EPSILON && s.is_finite() { s } else { 1.0 }
}

/// Volume of the unit ball in `ndim` dimensions.
pub fn unit_ball_volume(ndim: usize) -> f64 {
    let mut v = [1.0, 2.0];
    for d in 2..=ndim {
        v[d % 2] *= 2.0 * std::f64::consts::PI / d as f64;
    }
    v[ndim % 2]
}

// ---------------------------------------------------------------------------
// Variance solver
// ---------------------------------------------------------------------------

struct Solution {
    variance: f64,
    weight: f64,
    iterations: usize,
    bracketed: bool,
}

/// Kernel-weighted neighbor weight and its derivative in the variance.
fn filter_weight(neighbors: &[(f64, f64)], var: f64) -> (f64, f64) {
    let mut w = 0.0;
    let mut dw = 0.0;
    for &(dsq, weight) in neighbors {
        let k = weight * (-dsq / var / 2.0).exp();
        w += k;
        dw += dsq * k / var / var / 2.0;
    }
    (w, dw)
}

fn solve_variance(
    neighbors: &[(f64, f64)],
    target: f64,
    mut lo: f64,
    mut hi: f64,
    min_var: f64,
    max_var: f64,
) -> Solution {
    let mut iterations = 0;

    let (mut w_lo, _) = filter_weight(neighbors, lo);
    while w_lo > target && lo > min_var && iterations < WEIGHTS_MAXITER {
        lo = (lo / 2.0).max(min_var);
        w_lo = filter_weight(neighbors, lo).0;
        iterations += 1;
    }
    let (mut w_hi, _) = filter_weight(neighbors, hi);
    while w_hi < target && hi < max_var && iterations < WEIGHTS_MAXITER {
        hi = (hi * 2.0).min(max_var);
        w_hi = filter_weight(neighbors, hi).0;
        iterations += 1;
    }

    if w_lo > target {
        return Solution {
            variance: lo,
            weight: w_lo,
            iterations,
            bracketed: false,
        };
    }
    if w_hi < target {
        return Solution {
            variance: hi,
            weight: w_hi,
            iterations,
            bracketed: false,
        };
    }

    // Newton on W(var) = target, bisecting in log space when a step leaves
    // the bracket. W is monotone increasing in var.
    let tol = WEIGHTS_TOL * target;
    let mut var = (lo * hi).sqrt();
    let (mut w, mut dw) = filter_weight(neighbors, var);
    while (w - target).abs() > tol && iterations < WEIGHTS_MAXITER {
        if w > target {
            hi = var;
        } else {
            lo = var;
        }
        let step = if dw > 0.0 { var - (w - target) / dw } else { f64::NAN };
        var = if step > lo && step < hi {
            step
        } else {
            (lo * hi).sqrt()
        };
        (w, dw) = filter_weight(neighbors, var);
        iterations += 1;
    }

    Solution {
        variance: var,
        weight: w,
        iterations,
        bracketed: true,
    }
}
