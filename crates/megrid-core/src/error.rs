use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum GridError {
    DimensionMismatch { expected: usize, found: usize },
    DegenerateDimension(usize),
    PipelineFrozen,
    InvalidConfig(String),
    EmptyGrid,
    Expression(String),
    MissingColumn(String),
    MissingField(String),
    UnsupportedLepton(i32),
}

impl fmt::Display for GridError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GridError::DimensionMismatch { expected, found } => {
                write!(f, "dimension mismatch: expected {expected}, found {found}")
            }
            GridError::DegenerateDimension(dim) => {
                write!(f, "degenerate dimension {dim}: standard deviation is zero")
            }
            GridError::PipelineFrozen => {
                write!(f, "transform pipeline is frozen; no further fitting allowed")
            }
            GridError::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            GridError::EmptyGrid => write!(f, "grid has no points"),
            GridError::Expression(msg) => write!(f, "expression error: {msg}"),
            GridError::MissingColumn(name) => write!(f, "missing column: {name}"),
            GridError::MissingField(name) => write!(f, "missing required event field: {name}"),
            GridError::UnsupportedLepton(id) => {
                write!(f, "lepton id {id} is neither electron nor muon")
            }
        }
    }
}

impl std::error::Error for GridError {}

pub type Result<T> = std::result::Result<T, GridError>;
