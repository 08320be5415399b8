//! Pipeline run orchestration for the trade-store delivery pipeline.
//!
//! Drives a run through its stages against pluggable backends: build
//! executors, stack deployers, source fetchers, approval gates and
//! reachability probes.

pub mod approval;
pub mod orchestrator;
pub mod probe;
pub mod source;

pub use approval::{
    ApprovalDecision, ApprovalGate, ApprovalInbox, ApprovalRequest, AutoApprove,
    ChannelApprovalGate, StaticDecision,
};
pub use orchestrator::{PipelineEvent, PipelineOrchestrator, Services};
pub use probe::{HttpProbe, ReachabilityProbe, probe_url};
pub use source::{DirectorySourceFetcher, GitSourceFetcher, SourceFetcher};
