//! Stack deployment backends for the trade-store delivery pipeline.
//!
//! Provides deployer implementations:
//! - Local (in-memory stacks with template intrinsic resolution)

pub mod local;
pub mod template;

pub use local::LocalDeployer;
pub use template::BoundTemplate;
pub use tradestore_core::deployer::{
    Deployer, DeploymentHandle, DeploymentState, DeploymentStatus, StackDeploymentSpec,
    ValidationWarning,
};
