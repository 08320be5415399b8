//! KDL configuration parsing for the trade-store delivery pipeline.
//!
//! This crate handles parsing of:
//! - Pipeline definitions
//! - Deployment environment configuration
//! - Variable interpolation and deploy parameter resolution

pub mod environment;
pub mod error;
mod nodes;
pub mod pipeline;
pub mod variables;

pub use environment::{load_environments, parse_environments};
pub use error::{ConfigError, ConfigResult};
pub use pipeline::{load_pipeline, parse_pipeline};
pub use variables::{
    PipelineContext, RunContext, StageContext, VariableContext, VariableContextBuilder,
};
