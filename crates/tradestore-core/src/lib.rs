//! Core domain types and traits for the trade-store delivery pipeline.
//!
//! This crate contains:
//! - Resource identifiers, errors and target environments
//! - Pipeline definitions, run records and topology validation
//! - Artifact, secret and source abstractions
//! - Executor trait and build project types
//! - Deployer trait and stack deployment types
//! - The environment stack resource model and deferred image references

pub mod artifact;
pub mod deployer;
pub mod environment;
pub mod error;
pub mod executor;
pub mod id;
pub mod image;
pub mod pipeline;
pub mod secret;
pub mod source;
pub mod stack;
pub mod topology;

pub use environment::{DeploymentTarget, Environment, EnvironmentConfig};
pub use error::{Error, Result};
pub use id::ResourceId;
