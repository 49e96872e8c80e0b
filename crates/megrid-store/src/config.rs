//! TOML unit files and turning them into ready-to-query evaluation units.

use std::fs;
use std::path::{Path, PathBuf};

use megrid_core::{
    DensityEstimator, EvaluationUnit, Grid, LinearRecoilModel, RecoilEstimator, UnitConfig,
    cluster, cluster_in_bricks, pair_merge,
};

use crate::error::Result;
use crate::grid_store::load_sources;

/// Parse and validate a unit file.
pub fn load_unit(path: &Path) -> Result<UnitConfig> {
    let text = fs::read_to_string(path)?;
    let unit: UnitConfig = toml::from_str(&text)?;
    unit.validate()?;
    tracing::info!(path = %path.display(), unit = %unit.name, "loaded unit config");
    Ok(unit)
}

pub fn load_recoil_model(path: &Path) -> Result<LinearRecoilModel> {
    let text = fs::read_to_string(path)?;
    Ok(LinearRecoilModel::from_json(&text)?)
}

fn resolve(base: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() { p.to_path_buf() } else { base.join(p) }
}

/// Load, merge, transform and compress the unit's grid.
///
/// Relative source patterns are resolved against `base`.
pub fn build_grid(config: &UnitConfig, base: &Path) -> Result<Grid> {
    let sources: Vec<_> = config
        .sources
        .iter()
        .map(|s| {
            let mut s = s.clone();
            s.pattern = resolve(base, &s.pattern).to_string_lossy().into_owned();
            s
        })
        .collect();
    let mut grid = load_sources(&config.name, &sources)?;
    for t in &config.transforms {
        grid.apply_transform(t)?;
    }
    if let Some(r) = &config.resample {
        grid = pair_merge(&grid, r.passes, r.max_distance)?;
    }
    if let Some(step) = &config.cluster {
        let (clustered, report) = match step.brick_size {
            Some(size) => cluster_in_bricks(&grid, &step.config, size)?,
            None => cluster(&grid, &step.config)?,
        };
        if !report.converged {
            tracing::warn!(unit = %config.name, iterations = report.iterations, "clustering did not converge");
        }
        grid = clustered;
    }
    tracing::info!(
        unit = %config.name,
        points = grid.len(),
        ndim = grid.ndim(),
        total_weight = grid.total_weight(),
        "grid ready"
    );
    Ok(grid)
}

/// Build everything a unit needs to evaluate events.
pub fn build_unit(config: &UnitConfig, base: &Path) -> Result<EvaluationUnit> {
    config.validate()?;
    let grid = build_grid(config, base)?;
    let recoil = match &config.recoil {
        Some(r) => {
            let model = load_recoil_model(&resolve(base, &r.model))?;
            Some(Box::new(model) as Box<dyn RecoilEstimator>)
        }
        None => None,
    };
    let unit = EvaluationUnit {
        name: config.name.clone(),
        topology: config.topology,
        coordinates: config.coordinate_specs()?,
        estimator: DensityEstimator::new(grid, config.density_params())?,
        selection: config.compiled_selection()?,
        recoil,
    };
    unit.validate()?;
    Ok(unit)
}
