use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};
use crate::point::GridPoint;
use crate::transform::{TransformPipeline, TransformSpec};

/// One source merged into a grid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub name: String,
    pub pattern: String,
    pub table: String,
    pub points: usize,
    pub total_weight: f64,
    /// Factor applied to this source's weights when it was merged.
    pub mixture: f64,
}

/// A weighted point cloud approximating a density over a coordinate space.
///
/// Every point has exactly `ndim` coordinates. Only a dimension-reducing
/// transform changes `ndim`, and only while the pipeline is not frozen.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Grid {
    pub name: String,
    ndim: usize,
    points: Vec<GridPoint>,
    pub provenance: Vec<Provenance>,
    pipeline: TransformPipeline,
}

impl Grid {
    pub fn new(name: &str, ndim: usize) -> Self {
        Self {
            name: name.to_string(),
            ndim,
            points: Vec::new(),
            provenance: Vec::new(),
            pipeline: TransformPipeline::new(),
        }
    }

    pub fn from_points(name: &str, ndim: usize, points: Vec<GridPoint>) -> Result<Self> {
        let mut grid = Self::new(name, ndim);
        grid.points.reserve(points.len());
        for p in points {
            grid.push(p)?;
        }
        Ok(grid)
    }

    /// Rebuild a grid from persisted parts.
    pub fn from_parts(
        name: &str,
        ndim: usize,
        points: Vec<GridPoint>,
        provenance: Vec<Provenance>,
        pipeline: TransformPipeline,
    ) -> Result<Self> {
        let mut grid = Self::from_points(name, ndim, points)?;
        grid.provenance = provenance;
        grid.pipeline = pipeline;
        Ok(grid)
    }

    /// A new grid sharing this grid's metadata but holding `points`.
    pub fn derive(&self, points: Vec<GridPoint>) -> Result<Self> {
        let mut grid = Self::from_points(&self.name, self.ndim, points)?;
        grid.provenance = self.provenance.clone();
        grid.pipeline = self.pipeline.clone();
        Ok(grid)
    }

    pub fn push(&mut self, point: GridPoint) -> Result<()> {
        if point.ndim() != self.ndim {
            return Err(GridError::DimensionMismatch {
                expected: self.ndim,
                found: point.ndim(),
            });
        }
        if self.pipeline.is_frozen() {
            return Err(GridError::PipelineFrozen);
        }
        self.points.push(point);
        Ok(())
    }

    pub fn ndim(&self) -> usize {
        self.ndim
    }

    pub fn points(&self) -> &[GridPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn pipeline(&self) -> &TransformPipeline {
        &self.pipeline
    }

    pub fn is_frozen(&self) -> bool {
        self.pipeline.is_frozen()
    }

    pub fn freeze(&mut self) {
        self.pipeline.freeze();
    }

    pub fn total_weight(&self) -> f64 {
        self.points.iter().map(|p| p.weight).sum()
    }

    /// Total number of raw points represented, counting cluster members.
    pub fn total_members(&self) -> u64 {
        self.points.iter().map(|p| p.members).sum()
    }

    /// Per-dimension `(min, max)` of the point coordinates.
    pub fn extents(&self) -> Vec<(f64, f64)> {
        let mut ext = vec![(f64::INFINITY, f64::NEG_INFINITY); self.ndim];
        for p in &self.points {
            for (e, &x) in ext.iter_mut().zip(&p.coords) {
                e.0 = e.0.min(x);
                e.1 = e.1.max(x);
            }
        }
        ext
    }

    /// Multiply every weight by `factor`.
    pub fn scale_weights(&mut self, factor: f64) {
        for p in &mut self.points {
            p.weight *= factor;
        }
        for src in &mut self.provenance {
            src.total_weight *= factor;
            src.mixture *= factor;
        }
    }

    /// Fit and apply one transform to every point.
    pub fn apply_transform(&mut self, spec: &TransformSpec) -> Result<()> {
        if self.points.is_empty() {
            return Err(GridError::EmptyGrid);
        }
        self.ndim = self.pipeline.fit_apply(spec, &mut self.points, self.ndim)?;
        Ok(())
    }

    /// Concatenate two grids with equal dimension and equal transform chains.
    pub fn merge(&self, other: &Grid) -> Result<Grid> {
        if self.ndim != other.ndim {
            return Err(GridError::DimensionMismatch {
                expected: self.ndim,
                found: other.ndim,
            });
        }
        if self.pipeline.steps() != other.pipeline.steps() {
            return Err(GridError::InvalidConfig(format!(
                "cannot merge '{}' and '{}': transform chains differ",
                self.name, other.name
            )));
        }
        let mut points = Vec::with_capacity(self.len() + other.len());
        points.extend_from_slice(&self.points);
        points.extend_from_slice(&other.points);

        let mut provenance = self.provenance.clone();
        provenance.extend(other.provenance.iter().cloned());

        Ok(Grid {
            name: self.name.clone(),
            ndim: self.ndim,
            points,
            provenance,
            pipeline: self.pipeline.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(name: &str, pts: &[(f64, f64, f64)]) -> Grid {
        Grid::from_points(
            name,
            2,
            pts.iter()
                .map(|&(x, y, w)| GridPoint::new(vec![x, y], w))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_push_dimension_mismatch() {
        let mut g = Grid::new("g", 3);
        let err = g.push(GridPoint::new(vec![1.0, 2.0], 1.0)).unwrap_err();
        assert_eq!(
            err,
            GridError::DimensionMismatch {
                expected: 3,
                found: 2
            }
        );
    }

    #[test]
    fn test_merge_adds_weights_and_provenance() {
        let mut a = grid("a", &[(0.0, 0.0, 1.0), (1.0, 1.0, 2.0)]);
        a.provenance.push(Provenance {
            name: "a".into(),
            pattern: "a.db".into(),
            table: "t".into(),
            points: 2,
            total_weight: 3.0,
            mixture: 1.0,
        });
        let b = grid("b", &[(5.0, 5.0, 0.5)]);

        let m = a.merge(&b).unwrap();
        assert_eq!(m.len(), 3);
        assert!((m.total_weight() - (a.total_weight() + b.total_weight())).abs() < 1e-12);
        assert_eq!(m.provenance.len(), 1);
        assert_eq!(m.name, "a");
    }

    #[test]
    fn test_merge_dimension_mismatch() {
        let a = grid("a", &[(0.0, 0.0, 1.0)]);
        let b = Grid::from_points("b", 1, vec![GridPoint::new(vec![1.0], 1.0)]).unwrap();
        assert!(matches!(
            a.merge(&b),
            Err(GridError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_merge_rejects_different_pipelines() {
        let mut a = grid("a", &[(0.0, 0.0, 1.0), (2.0, 4.0, 1.0)]);
        let b = grid("b", &[(1.0, 1.0, 1.0)]);
        a.apply_transform(&TransformSpec::FixedScale {
            factors: vec![2.0, 2.0],
            replay: true,
        })
        .unwrap();
        assert!(matches!(a.merge(&b), Err(GridError::InvalidConfig(_))));
    }

    #[test]
    fn test_rotate_phi_reduces_ndim() {
        let mut g = grid("g", &[(1.0, 1.0, 1.0), (-2.0, 0.5, 1.0)]);
        g.apply_transform(&TransformSpec::RotatePhi {
            groups: crate::transform::PhiGroups::Pairs(vec![[0, 1]]),
            replay: true,
        })
        .unwrap();
        assert_eq!(g.ndim(), 1);
        assert!((g.points()[0].coords[0] - 2f64.sqrt()).abs() < 1e-12);
        assert!(g.points().iter().all(|p| p.ndim() == 1));
    }

    #[test]
    fn test_frozen_grid_rejects_changes() {
        let mut g = grid("g", &[(0.0, 0.0, 1.0), (1.0, 2.0, 1.0)]);
        g.freeze();
        assert_eq!(
            g.push(GridPoint::new(vec![0.0, 0.0], 1.0)).unwrap_err(),
            GridError::PipelineFrozen
        );
        assert_eq!(
            g.apply_transform(&TransformSpec::GaussianWhiten {
                dims: None,
                replay: true
            })
            .unwrap_err(),
            GridError::PipelineFrozen
        );
    }

    #[test]
    fn test_extents_and_scale() {
        let mut g = grid("g", &[(0.0, -1.0, 1.0), (3.0, 2.0, 3.0)]);
        assert_eq!(g.extents(), vec![(0.0, 3.0), (-1.0, 2.0)]);
        g.scale_weights(0.5);
        assert!((g.total_weight() - 2.0).abs() < 1e-12);
    }
}
