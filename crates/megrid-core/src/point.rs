use serde::{Deserialize, Serialize};

/// A weighted point in a grid's coordinate space.
///
/// Raw points carry `members == 1`; cluster representatives carry the number
/// of raw points they replace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridPoint {
    pub coords: Vec<f64>,
    pub weight: f64,
    pub members: u64,
}

impl GridPoint {
    pub fn new(coords: Vec<f64>, weight: f64) -> Self {
        Self {
            coords,
            weight,
            members: 1,
        }
    }

    pub fn ndim(&self) -> usize {
        self.coords.len()
    }

    pub fn is_cluster(&self) -> bool {
        self.members > 1
    }

    /// Squared Euclidean distance to `other` over all coordinates.
    pub fn distance_sq(&self, other: &[f64]) -> f64 {
        distance_sq(&self.coords, other, None)
    }
}

/// Squared Euclidean distance, optionally restricted to a subset of axes.
pub fn distance_sq(a: &[f64], b: &[f64], axes: Option<&[usize]>) -> f64 {
    match axes {
        Some(axes) => axes
            .iter()
            .map(|&i| {
                let d = a[i] - b[i];
                d * d
            })
            .sum(),
        None => a
            .iter()
            .zip(b)
            .map(|(x, y)| {
                let d = x - y;
                d * d
            })
            .sum(),
    }
}

/// Weighted centroid of a set of points.
///
/// Falls back to the member-count-weighted mean when the total weight is zero.
/// Returns `None` for an empty set.
pub fn weighted_centroid<'a, I>(points: I) -> Option<GridPoint>
where
    I: IntoIterator<Item = &'a GridPoint>,
{
    let mut iter = points.into_iter().peekable();
    let ndim = iter.peek()?.ndim();
    let mut sum_w = vec![0.0; ndim];
    let mut sum_m = vec![0.0; ndim];
    let mut weight = 0.0;
    let mut members = 0u64;

    for p in iter {
        for (d, &x) in p.coords.iter().enumerate() {
            sum_w[d] += p.weight * x;
            sum_m[d] += p.members as f64 * x;
        }
        weight += p.weight;
        members += p.members;
    }

    let coords = if weight.abs() > 0.0 {
        sum_w.into_iter().map(|s| s / weight).collect()
    } else {
        sum_m.into_iter().map(|s| s / members as f64).collect()
    };

    Some(GridPoint {
        coords,
        weight,
        members,
    })
}
