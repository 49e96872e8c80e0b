//! SQLite persistence for megrid: grid sources, saved grids, event tables,
//! results and unit configuration files.

pub mod config;
pub mod error;
pub mod grid_store;
pub mod results;
pub mod schema;
pub mod source;

pub use config::{build_grid, build_unit, load_recoil_model, load_unit};
pub use error::{Result, StoreError};
pub use grid_store::{
    LoadReport, LoadRequest, Reservoir, load, load_grid, load_sources, rotate_table, save_grid,
};
pub use results::{JsonSideBuffer, ResultWriter};
pub use source::{EventTable, TableReader, expand_pattern, split_location};
