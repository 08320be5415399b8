//! Build execution backends for the trade-store delivery pipeline.
//!
//! This crate provides implementations of the Executor trait for:
//! - Local Docker (development, and builds that need a build image)
//! - Local shell (hosts without Docker)

pub mod artifacts;
pub mod docker;
pub mod shell;

pub use artifacts::{collect_artifacts, write_bundle};
pub use docker::LocalDockerExecutor;
pub use shell::LocalShellExecutor;
