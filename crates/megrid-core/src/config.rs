//! Declarative configuration of one evaluation unit.
//!
//! A unit binds a grid (its sources, transforms and optional compression)
//! to the event coordinates it is queried with. Every option has a default
//! and the whole unit is checked by [`UnitConfig::validate`] before any
//! grid is loaded.

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterConfig;
use crate::constants::WC_DEFAULT;
use crate::density::{DensityParams, Kernel};
use crate::error::{GridError, Result};
use crate::event::{CoordinateSpec, EventSchema, Topology};
use crate::expr::CompiledExpr;
use crate::recoil::recoil_key;
use crate::transform::TransformSpec;

fn default_table() -> String {
    "grid".to_string()
}

fn default_mixture() -> f64 {
    1.0
}

fn default_wc() -> f64 {
    WC_DEFAULT
}

/// One set of source files contributing points to a grid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// Glob pattern of SQLite files.
    pub pattern: String,
    #[serde(default = "default_table")]
    pub table: String,
    /// One expression per grid dimension.
    pub coordinates: Vec<String>,
    /// Empty means unit weight.
    #[serde(default)]
    pub weight: String,
    #[serde(default)]
    pub selection: String,
    /// Reservoir-sample down to this many points; unlimited when absent.
    #[serde(default)]
    pub max_points: Option<usize>,
    /// Factor applied to this source's weights at merge time.
    #[serde(default = "default_mixture")]
    pub mixture: f64,
    #[serde(default)]
    pub seed: u64,
}

/// Greedy pair-merge resampling before clustering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResampleConfig {
    pub passes: usize,
    #[serde(default)]
    pub max_distance: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterStep {
    #[serde(flatten)]
    pub config: ClusterConfig,
    /// Cluster consecutive bricks of this many points independently.
    #[serde(default)]
    pub brick_size: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecoilConfig {
    /// Path of a linear recoil model file.
    pub model: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnitConfig {
    pub name: String,
    #[serde(default)]
    pub topology: Topology,
    /// Event coordinates, e.g. `lp.px`, in grid dimension order.
    pub coordinates: Vec<String>,
    #[serde(default = "default_wc")]
    pub wc: f64,
    #[serde(default)]
    pub maxk: usize,
    #[serde(default)]
    pub kernel: Kernel,
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub transforms: Vec<TransformSpec>,
    /// Event selection predicate.
    #[serde(default)]
    pub selection: Option<String>,
    #[serde(default)]
    pub recoil: Option<RecoilConfig>,
    #[serde(default)]
    pub resample: Option<ResampleConfig>,
    #[serde(default)]
    pub cluster: Option<ClusterStep>,
    #[serde(default)]
    pub schema: EventSchema,
}

impl UnitConfig {
    /// Reject anything that would fail later in the run.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GridError::InvalidConfig("unit name is empty".into()));
        }
        let specs = self.coordinate_specs()?;
        if specs.is_empty() {
            return Err(GridError::InvalidConfig(format!(
                "unit '{}' has no event coordinates",
                self.name
            )));
        }
        if !self.wc.is_finite() {
            return Err(GridError::InvalidConfig(format!("wc must be finite, got {}", self.wc)));
        }
        if self.sources.is_empty() {
            return Err(GridError::InvalidConfig(format!(
                "unit '{}' has no grid sources",
                self.name
            )));
        }

        let ndim = self.grid_ndim();
        if ndim == 0 {
            return Err(GridError::InvalidConfig(format!(
                "source '{}' has no coordinate expressions",
                self.sources[0].name
            )));
        }
        for s in &self.sources {
            if s.coordinates.len() != ndim {
                return Err(GridError::DimensionMismatch {
                    expected: ndim,
                    found: s.coordinates.len(),
                });
            }
            if s.mixture.is_nan() || s.mixture <= 0.0 {
                return Err(GridError::InvalidConfig(format!(
                    "source '{}' has non-positive mixture {}",
                    s.name, s.mixture
                )));
            }
            for c in &s.coordinates {
                CompiledExpr::compile(c)?;
            }
            for e in [&s.weight, &s.selection] {
                if !e.trim().is_empty() {
                    CompiledExpr::compile(e)?;
                }
            }
        }

        for t in &self.transforms {
            match t {
                TransformSpec::FixedScale { factors, .. }
                    if factors.iter().any(|f| *f == 0.0 || !f.is_finite()) =>
                {
                    return Err(GridError::InvalidConfig(
                        "fixed scale factors must be finite and non-zero".into(),
                    ));
                }
                TransformSpec::RotatePhi { groups, .. } => {
                    groups.resolve()?;
                }
                _ => {}
            }
        }
        if self.recoil.is_some() {
            recoil_key(&self.name, 0)?;
        }
        if let Some(r) = &self.resample
            && r.passes == 0
        {
            return Err(GridError::InvalidConfig("resample passes must be at least 1".into()));
        }
        if let Some(c) = &self.cluster {
            // axes refer to the transformed space, checked when clustering
            c.config.validate(usize::MAX)?;
            if c.brick_size == Some(0) {
                return Err(GridError::InvalidConfig("brick size must be at least 1".into()));
            }
        }
        self.compiled_selection()?;
        Ok(())
    }

    /// Dimensionality of the grid before transforms.
    pub fn grid_ndim(&self) -> usize {
        self.sources.first().map_or(0, |s| s.coordinates.len())
    }

    pub fn coordinate_specs(&self) -> Result<Vec<CoordinateSpec>> {
        CoordinateSpec::parse_all(&self.coordinates)
    }

    pub fn density_params(&self) -> DensityParams {
        DensityParams {
            kernel: self.kernel,
            wc: self.wc,
            maxk: self.maxk,
        }
    }

    pub fn compiled_selection(&self) -> Result<Option<CompiledExpr>> {
        match self.selection.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => CompiledExpr::compile(s).map(Some),
        }
    }
}
