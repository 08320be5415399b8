//! Deployer trait and stack deployment types.
//!
//! A deployer applies a synthesized stack template to one environment as a
//! single atomic change: either every resource is updated or the stack stays
//! at its previous state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::environment::Environment;
use crate::{ResourceId, Result};

/// Specification for a stack deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackDeploymentSpec {
    pub id: ResourceId,
    pub stack_name: String,
    pub environment: Environment,
    /// Template as synthesized by [`crate::stack::EnvironmentStack::synthesize`].
    pub template: serde_json::Value,
    /// Template parameter values, fully resolved.
    pub parameters: BTreeMap<String, String>,
    pub admin_permissions: bool,
}

/// Handle to a deployed stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentHandle {
    pub id: ResourceId,
    pub stack_name: String,
    pub environment: Environment,
    pub deployer_name: String,
}

/// Status of a stack after the last deployment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentStatus {
    CreateComplete,
    UpdateComplete,
    /// The last update failed and the previous state was kept.
    RollbackComplete { reason: String },
    /// The first create failed; nothing is deployed.
    Failed { reason: String },
}

impl DeploymentStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::CreateComplete | DeploymentStatus::UpdateComplete
        )
    }
}

/// Current state of a stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentState {
    pub status: DeploymentStatus,
    /// Parameter values of the live stack.
    pub parameters: BTreeMap<String, String>,
    /// Resolved stack outputs.
    pub outputs: BTreeMap<String, String>,
    /// Resource properties with every intrinsic function resolved.
    pub resources: serde_json::Value,
    pub last_updated: DateTime<Utc>,
}

/// Warning from deployment validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
}

/// Trait for stack deployers.
#[async_trait]
pub trait Deployer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Validate a deployment spec before deploying.
    async fn validate(&self, spec: &StackDeploymentSpec) -> Result<Vec<ValidationWarning>>;

    /// Create or update a stack.
    async fn deploy(&self, spec: StackDeploymentSpec) -> Result<DeploymentHandle>;

    /// Get current stack state.
    async fn state(&self, handle: &DeploymentHandle) -> Result<DeploymentState>;

    /// Outputs of a stack by name.
    async fn outputs(
        &self,
        environment: &Environment,
        stack_name: &str,
    ) -> Result<BTreeMap<String, String>>;

    /// Delete a stack.
    async fn destroy(&self, handle: &DeploymentHandle) -> Result<()>;
}
