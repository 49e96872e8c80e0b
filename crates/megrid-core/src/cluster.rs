//! Weight-conserving grid compression.
//!
//! Every algorithm here returns a new [`Grid`] whose points are weighted
//! centroids of the points they replace, with summed weights and member
//! counts. The input grid is never mutated.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::constants::KMEANS_MAX_ITER;
use crate::error::{GridError, Result};
use crate::grid::Grid;
use crate::point::{GridPoint, distance_sq, weighted_centroid};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterAlgorithm {
    #[default]
    #[serde(rename = "kmeans", alias = "k_means")]
    KMeans,
    Hierarchical,
}

impl std::str::FromStr for ClusterAlgorithm {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "kmeans" | "k-means" => Ok(ClusterAlgorithm::KMeans),
            "hierarchical" | "tree" => Ok(ClusterAlgorithm::Hierarchical),
            other => Err(GridError::InvalidConfig(format!(
                "unknown clustering algorithm '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for ClusterAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterAlgorithm::KMeans => write!(f, "kmeans"),
            ClusterAlgorithm::Hierarchical => write!(f, "hierarchical"),
        }
    }
}

fn default_max_iter() -> usize {
    KMEANS_MAX_ITER
}

fn default_accelerated() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub algorithm: ClusterAlgorithm,
    pub k: usize,
    /// Axes used for distances; centroids always cover every axis.
    #[serde(default)]
    pub axes: Option<Vec<usize>>,
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    #[serde(default)]
    pub seed: u64,
    /// Use the heap-accelerated hierarchical merge.
    #[serde(default = "default_accelerated")]
    pub accelerated: bool,
}

impl ClusterConfig {
    pub fn new(algorithm: ClusterAlgorithm, k: usize) -> Self {
        Self {
            algorithm,
            k,
            axes: None,
            max_iter: KMEANS_MAX_ITER,
            seed: 0,
            accelerated: true,
        }
    }

    pub fn validate(&self, ndim: usize) -> Result<()> {
        if self.k == 0 {
            return Err(GridError::InvalidConfig(
                "cluster count k must be at least 1".into(),
            ));
        }
        if let Some(axes) = &self.axes {
            if axes.is_empty() {
                return Err(GridError::InvalidConfig("axis subset is empty".into()));
            }
            if let Some(&bad) = axes.iter().find(|&&a| a >= ndim) {
                return Err(GridError::DimensionMismatch {
                    expected: ndim,
                    found: bad + 1,
                });
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClusterReport {
    pub algorithm: ClusterAlgorithm,
    pub input_points: usize,
    pub output_points: usize,
    pub iterations: usize,
    pub converged: bool,
    pub total_weight: f64,
}

/// Compress `grid` to `config.k` weighted centroids.
///
/// `k >= n` returns the grid unchanged.
pub fn cluster(grid: &Grid, config: &ClusterConfig) -> Result<(Grid, ClusterReport)> {
    config.validate(grid.ndim())?;
    if grid.is_empty() {
        return Err(GridError::EmptyGrid);
    }
    let n = grid.len();
    if config.k >= n {
        tracing::info!(n, k = config.k, "cluster count not below grid size; grid unchanged");
        return Ok((
            grid.clone(),
            ClusterReport {
                algorithm: config.algorithm,
                input_points: n,
                output_points: n,
                iterations: 0,
                converged: true,
                total_weight: grid.total_weight(),
            },
        ));
    }

    let axes = config.axes.as_deref();
    let (points, iterations, converged) = match config.algorithm {
        ClusterAlgorithm::KMeans => {
            let mut rng = SmallRng::seed_from_u64(config.seed);
            kmeans(grid.points(), config.k, axes, config.max_iter, &mut rng)
        }
        ClusterAlgorithm::Hierarchical => {
            let merged = if config.accelerated {
                hierarchical_heap(grid.points(), config.k, axes)
            } else {
                hierarchical_naive(grid.points(), config.k, axes)
            };
            (merged, n - config.k, true)
        }
    };

    if !converged {
        tracing::warn!(
            iterations,
            k = config.k,
            "k-means hit the iteration cap; returning current assignment"
        );
    }

    let out = grid.derive(points)?;
    let report = ClusterReport {
        algorithm: config.algorithm,
        input_points: n,
        output_points: out.len(),
        iterations,
        converged,
        total_weight: out.total_weight(),
    };
    Ok((out, report))
}

/// Cluster consecutive bricks of `brick_size` points independently and
/// concatenate the results.
///
/// Each brick gets a share of `k` proportional to its size. This trades
/// precision for tractability on very large grids: the result is not
/// identical to clustering the whole grid at once.
pub fn cluster_in_bricks(
    grid: &Grid,
    config: &ClusterConfig,
    brick_size: usize,
) -> Result<(Grid, ClusterReport)> {
    config.validate(grid.ndim())?;
    if brick_size == 0 {
        return Err(GridError::InvalidConfig("brick size must be at least 1".into()));
    }
    let n = grid.len();
    if n <= brick_size || config.k >= n {
        return cluster(grid, config);
    }
    let nbricks = n.div_ceil(brick_size);
    if config.k < nbricks {
        return Err(GridError::InvalidConfig(format!(
            "{} clusters cannot cover {nbricks} bricks of {brick_size} points",
            config.k
        )));
    }

    let mut points = Vec::with_capacity(config.k);
    let mut iterations = 0;
    let mut converged = true;
    let mut assigned = 0;
    let bricks: Vec<&[GridPoint]> = grid.points().chunks(brick_size).collect();
    let last = bricks.len() - 1;

    for (i, chunk) in bricks.into_iter().enumerate() {
        // every later brick keeps at least one cluster
        let share = if i == last {
            config.k - assigned
        } else {
            let spare = config.k - assigned - (last - i);
            ((config.k as f64 * chunk.len() as f64 / n as f64).round() as usize).clamp(1, spare)
        };
        assigned += share;

        let brick = grid.derive(chunk.to_vec())?;
        let brick_config = ClusterConfig {
            k: share,
            seed: config.seed.wrapping_add(i as u64),
            ..config.clone()
        };
        let (clustered, report) = cluster(&brick, &brick_config)?;
        tracing::debug!(brick = i, points = chunk.len(), k = share, "clustered brick");
        iterations += report.iterations;
        converged &= report.converged;
        points.extend_from_slice(clustered.points());
    }

    let out = grid.derive(points)?;
    let report = ClusterReport {
        algorithm: config.algorithm,
        input_points: n,
        output_points: out.len(),
        iterations,
        converged,
        total_weight: out.total_weight(),
    };
    Ok((out, report))
}

/// Greedy nearest-pair resampling.
///
/// Each pass walks the points in order; a point is merged with its nearest
/// remaining partner when that partner lies within `max_distance` (if
/// given), otherwise it is kept as is. Roughly halves the grid per pass.
pub fn pair_merge(grid: &Grid, passes: usize, max_distance: Option<f64>) -> Result<Grid> {
    if grid.is_empty() {
        return Err(GridError::EmptyGrid);
    }
    let max_sq = max_distance.map(|d| d * d);
    let mut current: Vec<GridPoint> = grid.points().to_vec();

    for pass in 0..passes {
        let mut remaining: Vec<Option<GridPoint>> = current.into_iter().map(Some).collect();
        let mut output = Vec::with_capacity(remaining.len() / 2 + 1);

        for i in 0..remaining.len() {
            let Some(a) = remaining[i].take() else {
                continue;
            };
            let nearest = remaining
                .iter()
                .enumerate()
                .skip(i + 1)
                .filter_map(|(j, p)| p.as_ref().map(|p| (j, a.distance_sq(&p.coords))))
                .min_by(|x, y| x.1.total_cmp(&y.1));

            match nearest {
                Some((j, d)) if d > 0.0 && max_sq.is_none_or(|m| d < m) => {
                    if let Some(b) = remaining[j].take()
                        && let Some(c) = weighted_centroid([&a, &b])
                    {
                        output.push(c);
                    }
                }
                _ => output.push(a),
            }
        }

        tracing::debug!(pass, points = output.len(), "pair merge pass");
        current = output;
    }

    grid.derive(current)
}

// ---------------------------------------------------------------------------
// k-means
// ---------------------------------------------------------------------------

/// Weighted k-means++ seeding: first centroid by weight, the rest by
/// weight times squared distance to the nearest chosen centroid.
fn seed_centroids(
    points: &[GridPoint],
    k: usize,
    axes: Option<&[usize]>,
    rng: &mut SmallRng,
) -> Vec<Vec<f64>> {
    let n = points.len();
    let mut chosen = vec![false; n];
    let mut centroids: Vec<Vec<f64>> = Vec::with_capacity(k);
    let mut nearest = vec![f64::INFINITY; n];

    let mut scores: Vec<f64> = points.iter().map(|p| p.weight.max(0.0)).collect();
    while centroids.len() < k {
        let idx = sample_index(&scores, &chosen, rng);
        chosen[idx] = true;
        let c = points[idx].coords.clone();
        for (i, p) in points.iter().enumerate() {
            let d = distance_sq(&p.coords, &c, axes);
            if d < nearest[i] {
                nearest[i] = d;
            }
            scores[i] = p.weight.max(0.0) * nearest[i];
        }
        centroids.push(c);
    }
    centroids
}

/// Draw an index with probability proportional to `scores`, skipping
/// already chosen indices. Falls back to the first unchosen index when all
/// remaining scores are zero.
fn sample_index(scores: &[f64], chosen: &[bool], rng: &mut SmallRng) -> usize {
    let total: f64 = scores
        .iter()
        .zip(chosen)
        .filter(|&(_, &c)| !c)
        .map(|(s, _)| s)
        .sum();
    if total > 0.0 {
        let mut r = rng.random::<f64>() * total;
        let mut last = None;
        for (i, (&s, &c)) in scores.iter().zip(chosen).enumerate() {
            if c || s <= 0.0 {
                continue;
            }
            last = Some(i);
            if r < s {
                return i;
            }
            r -= s;
        }
        if let Some(i) = last {
            return i;
        }
    }
    chosen.iter().position(|&c| !c).unwrap_or(0)
}

fn nearest_centroid(coords: &[f64], centroids: &[Vec<f64>], axes: Option<&[usize]>) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (c, centroid) in centroids.iter().enumerate() {
        let d = distance_sq(coords, centroid, axes);
        if d < best.1 {
            best = (c, d);
        }
    }
    best
}

/// Reassign the farthest members of multi-member clusters to empty ones so
/// every cluster keeps at least one point.
fn refill_empty(
    points: &[GridPoint],
    assignment: &mut [usize],
    centroids: &mut [Vec<f64>],
    axes: Option<&[usize]>,
) -> bool {
    let k = centroids.len();
    let mut moved = false;
    let mut counts = vec![0usize; k];
    for &a in assignment.iter() {
        counts[a] += 1;
    }
    for empty in 0..k {
        if counts[empty] > 0 {
            continue;
        }
        let donor = assignment
            .iter()
            .enumerate()
            .filter(|&(_, &c)| counts[c] > 1)
            .map(|(i, &c)| (i, distance_sq(&points[i].coords, &centroids[c], axes)))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((i, _)) = donor {
            counts[assignment[i]] -= 1;
            assignment[i] = empty;
            counts[empty] = 1;
            centroids[empty] = points[i].coords.clone();
            moved = true;
        }
    }
    moved
}

fn kmeans(
    points: &[GridPoint],
    k: usize,
    axes: Option<&[usize]>,
    max_iter: usize,
    rng: &mut SmallRng,
) -> (Vec<GridPoint>, usize, bool) {
    let mut centroids = seed_centroids(points, k, axes, rng);
    let mut assignment = vec![usize::MAX; points.len()];
    let mut iterations = 0;
    let mut converged = false;

    while iterations < max_iter {
        iterations += 1;
        let mut changed = false;
        for (i, p) in points.iter().enumerate() {
            let (c, d) = nearest_centroid(&p.coords, &centroids, axes);
            // ties keep the current cluster
            let current = assignment[i];
            if current != c
                && (current == usize::MAX
                    || distance_sq(&p.coords, &centroids[current], axes) > d)
            {
                assignment[i] = c;
                changed = true;
            }
        }
        changed |= refill_empty(points, &mut assignment, &mut centroids, axes);
        if !changed {
            converged = true;
            break;
        }
        centroids = collect_clusters(points, &assignment, k)
            .into_iter()
            .zip(centroids)
            .map(|(c, old)| c.map_or(old, |c| c.coords))
            .collect();
    }

    if !converged && iterations == 0 {
        for (i, p) in points.iter().enumerate() {
            assignment[i] = nearest_centroid(&p.coords, &centroids, axes).0;
        }
        refill_empty(points, &mut assignment, &mut centroids, axes);
    }

    let clusters = collect_clusters(points, &assignment, k)
        .into_iter()
        .flatten()
        .collect();
    (clusters, iterations, converged)
}

fn collect_clusters(points: &[GridPoint], assignment: &[usize], k: usize) -> Vec<Option<GridPoint>> {
    let mut members: Vec<Vec<&GridPoint>> = vec![Vec::new(); k];
    for (p, &a) in points.iter().zip(assignment) {
        members[a].push(p);
    }
    members
        .into_iter()
        .map(|m| weighted_centroid(m.into_iter()))
        .collect()
}

// ---------------------------------------------------------------------------
// Hierarchical (centroid linkage)
// ---------------------------------------------------------------------------

/// Merge cluster `j` into cluster `i`; `i` keeps its slot.
fn merge_into(clusters: &mut [Option<GridPoint>], i: usize, j: usize) {
    if let (Some(a), Some(b)) = (clusters[i].take(), clusters[j].take()) {
        clusters[i] = weighted_centroid([&a, &b]);
    }
}

/// O(n^3) reference: scan every live pair on every merge.
pub fn hierarchical_naive(points: &[GridPoint], k: usize, axes: Option<&[usize]>) -> Vec<GridPoint> {
    let mut clusters: Vec<Option<GridPoint>> = points.iter().cloned().map(Some).collect();
    let mut alive = clusters.len();

    while alive > k {
        let mut best: Option<(f64, usize, usize)> = None;
        for i in 0..clusters.len() {
            let Some(a) = &clusters[i] else { continue };
            for j in (i + 1)..clusters.len() {
                let Some(b) = &clusters[j] else { continue };
                let d = distance_sq(&a.coords, &b.coords, axes);
                if best.is_none_or(|(bd, _, _)| d < bd) {
                    best = Some((d, i, j));
                }
            }
        }
        let Some((_, i, j)) = best else { break };
        merge_into(&mut clusters, i, j);
        alive -= 1;
    }

    clusters.into_iter().flatten().collect()
}

#[derive(Debug)]
struct Candidate {
    dist: f64,
    i: usize,
    j: usize,
    /// Cluster whose nearest-neighbor record produced this entry.
    owner: usize,
    version: u32,
}

impl Candidate {
    fn new(owner: usize, nearest: Option<(f64, usize)>, version: u32) -> Option<Self> {
        nearest.map(|(dist, other)| Self {
            dist,
            i: owner.min(other),
            j: owner.max(other),
            owner,
            version,
        })
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    // Reversed so the max-heap pops the closest pair, lowest indices first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .dist
            .total_cmp(&self.dist)
            .then_with(|| other.i.cmp(&self.i))
            .then_with(|| other.j.cmp(&self.j))
    }
}

/// Closest live cluster to `i`, lowest index on ties.
fn nearest_live(
    clusters: &[Option<GridPoint>],
    i: usize,
    axes: Option<&[usize]>,
) -> Option<(f64, usize)> {
    let a = clusters[i].as_ref()?;
    let mut best: Option<(f64, usize)> = None;
    for (m, other) in clusters.iter().enumerate() {
        let Some(b) = other else { continue };
        if m == i {
            continue;
        }
        let d = distance_sq(&a.coords, &b.coords, axes);
        if best.is_none_or(|(bd, _)| d < bd) {
            best = Some((d, m));
        }
    }
    best
}

fn closer(candidate: (f64, usize), current: Option<(f64, usize)>) -> bool {
    current.is_none_or(|(d, m)| candidate.0 < d || (candidate.0 == d && candidate.1 < m))
}

/// Heap-accelerated centroid linkage.
///
/// Every live cluster keeps one heap entry for its current nearest
/// neighbor, so memory stays O(n) in the number of points. After a merge
/// only the clusters that pointed at either half rescan; the others just
/// compare against the new centroid. Stale entries are skipped on pop and
/// swept once they outnumber live clusters four to one. Time is O(n^2) to
/// seed plus O(n) per merge and per rescan.
///
/// Produces the same merges as [`hierarchical_naive`] when pair distances
/// are distinct.
pub fn hierarchical_heap(points: &[GridPoint], k: usize, axes: Option<&[usize]>) -> Vec<GridPoint> {
    let mut clusters: Vec<Option<GridPoint>> = points.iter().cloned().map(Some).collect();
    let n = clusters.len();
    let mut nearest: Vec<Option<(f64, usize)>> = vec![None; n];
    let mut version = vec![0u32; n];
    let mut alive = n;
    let mut heap = BinaryHeap::with_capacity(n);

    for i in 0..n {
        nearest[i] = nearest_live(&clusters, i, axes);
        heap.extend(Candidate::new(i, nearest[i], 0));
    }

    while alive > k {
        let Some(c) = heap.pop() else { break };
        if clusters[c.owner].is_none() || version[c.owner] != c.version {
            continue;
        }
        let (a, b) = (c.i, c.j);
        merge_into(&mut clusters, a, b);
        alive -= 1;
        nearest[b] = None;
        version[b] += 1;

        let Some(merged) = clusters[a].as_ref().map(|p| p.coords.clone()) else { continue };
        for m in 0..n {
            if m == a {
                continue;
            }
            let Some(other) = &clusters[m] else { continue };
            let updated = match nearest[m] {
                Some((_, nn)) if nn == a || nn == b => nearest_live(&clusters, m, axes),
                current => {
                    let d = distance_sq(&other.coords, &merged, axes);
                    if !closer((d, a), current) {
                        continue;
                    }
                    Some((d, a))
                }
            };
            nearest[m] = updated;
            version[m] += 1;
            heap.extend(Candidate::new(m, updated, version[m]));
        }
        nearest[a] = nearest_live(&clusters, a, axes);
        version[a] += 1;
        heap.extend(Candidate::new(a, nearest[a], version[a]));

        if heap.len() > 4 * alive.max(1) {
            heap.retain(|c| clusters[c.owner].is_some() && version[c.owner] == c.version);
        }
    }

    clusters.into_iter().flatten().collect()
}
