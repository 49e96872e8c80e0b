//! megrid grid engine.
//!
//! Weighted point clouds ("grids") approximating probability densities over
//! event kinematics: transform pipelines that normalize and reduce the
//! coordinate space, weight-conserving clustering, adaptive Gaussian kernel
//! density estimation, and the per-event evaluator that turns table rows into
//! density queries.
//!
//! Zero I/O: sources, sinks and side buffers are traits implemented by the
//! storage layer.

pub mod cluster;
pub mod config;
pub mod constants;
pub mod density;
pub mod error;
pub mod evaluator;
pub mod event;
pub mod expr;
pub mod grid;
pub mod kinematics;
pub mod point;
pub mod recoil;
pub mod row;
pub mod transform;

pub use cluster::{
    ClusterAlgorithm, ClusterConfig, ClusterReport, cluster, cluster_in_bricks, pair_merge,
};
pub use config::{ClusterStep, RecoilConfig, ResampleConfig, SourceConfig, UnitConfig};
pub use density::{Density, DensityEstimator, DensityParams, Diagnostics, Kernel};
pub use error::{GridError, Result};
pub use evaluator::{
    EvaluationUnit, EvaluatorOptions, EventEvaluator, EventSource, ResultRecord, ResultSink,
    RunSummary, SideBuffer, Stage,
};
pub use event::{CoordinateSpec, EventRecord, EventSchema, Topology, resolve_charge};
pub use expr::{CompiledExpr, Row, VarRef};
pub use grid::{Grid, Provenance};
pub use kinematics::FourMomentum;
pub use point::GridPoint;
pub use recoil::{LinearRecoilModel, RecoilEstimator, RecoilInputs, recoil_key};
pub use row::{RowData, Value};
pub use transform::{FixedRotation, PhiGroups, TransformPipeline, TransformSpec, TransformStep};
