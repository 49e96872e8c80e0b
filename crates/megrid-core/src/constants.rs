/// Default target filter weight for the adaptive Gaussian filter
pub const WC_DEFAULT: f64 = 20.0;

/// Minimum number of neighbors the filter is allowed to use
pub const KMIN: usize = 10;

/// Relative tolerance on the filter weight when solving for the variance
pub const WEIGHTS_TOL: f64 = 0.01;

/// Iteration cap for the variance root finder
pub const WEIGHTS_MAXITER: usize = 5000;

/// Lower bound on the filter variance, relative to the grid's spread about its centroid
pub const MIN_FILTER_VARIANCE: f64 = 1e-3;

/// Upper bound on the filter variance, relative to the grid's spread about its centroid
pub const MAX_FILTER_VARIANCE: f64 = 1e3;

/// Default Lloyd iteration cap for k-means
pub const KMEANS_MAX_ITER: usize = 300;

/// Default number of points per brick when clustering in bricks
pub const BRICK_SIZE: usize = 50_000;

/// Momentum unit divisor (MeV -> GeV)
pub const GEV: f64 = 1000.0;

/// Electron mass in GeV
pub const ELECTRON_MASS: f64 = 0.000_510_998_95;

/// Muon mass in GeV
pub const MUON_MASS: f64 = 0.105_658_375_5;

/// Numerical epsilon for near-zero comparisons
pub const EPSILON: f64 = 1e-10;
