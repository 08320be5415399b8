//! Trade-store pipeline and environment stack definitions.
//!
//! The concrete side of the workspace: the web service stack, the build
//! projects and the repository they push to, the build and delivery
//! pipelines wired from them, and template synthesis for every deployment
//! target.

pub mod build_stack;
pub mod parameters;
pub mod pipelines;
pub mod projects;
pub mod service;
pub mod synth;

pub use build_stack::build_stack;
pub use parameters::{BuildPipelineParameters, default_environments};
pub use pipelines::{build_pipeline, delivery_pipeline};
pub use projects::{app_build_project, infra_build_project};
pub use service::{TradeStoreStage, ecr_repository, trade_store_stack};
pub use synth::synthesize_all;
