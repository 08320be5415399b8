//! Configuration parsing errors.

use thiserror::Error;
use tradestore_core::topology::TopologyError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("duplicate definition: {0}")]
    Duplicate(String),

    #[error("invalid pipeline topology: {0}")]
    Topology(#[from] TopologyError),

    #[error("unresolved variable {variable} in {context}")]
    UnresolvedVariable { variable: String, context: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
