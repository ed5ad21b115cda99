use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Schema error: {0}")]
    SchemaError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    TraceAccess(#[from] TraceAccessError),
}

/// Why a trace could not be read.
///
/// Returned from every trace read so callers must handle both outcomes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TraceAccessError {
    #[error("Execution log not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("Execution log is corrupt ({}): {detail}", path.display())]
    Corrupt { path: PathBuf, detail: String },
}

impl TraceAccessError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
