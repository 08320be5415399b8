//! Manual approval gates.
//!
//! A run reaching a manual approval action blocks until its gate returns a
//! decision. There is no timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tradestore_core::{Error, ResourceId, Result};

/// An approval a run is waiting on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub run_id: ResourceId,
    pub pipeline: String,
    pub stage: String,
    pub action: String,
    /// Where the request should be announced, if anywhere.
    pub notify: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved { comment: Option<String> },
    Rejected { comment: Option<String> },
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        ApprovalDecision::Approved { comment: None }
    }

    pub fn reject(comment: impl Into<String>) -> Self {
        ApprovalDecision::Rejected {
            comment: Some(comment.into()),
        }
    }
}

#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// Block until someone decides on `request`.
    async fn request(&self, request: &ApprovalRequest) -> Result<ApprovalDecision>;
}

/// Approves every request immediately.
#[derive(Debug, Clone, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn request(&self, _request: &ApprovalRequest) -> Result<ApprovalDecision> {
        Ok(ApprovalDecision::approve())
    }
}

/// Answers every request with the same decision.
#[derive(Debug, Clone)]
pub struct StaticDecision(pub ApprovalDecision);

#[async_trait]
impl ApprovalGate for StaticDecision {
    async fn request(&self, _request: &ApprovalRequest) -> Result<ApprovalDecision> {
        Ok(self.0.clone())
    }
}

/// Publishes requests on a channel and waits for decisions on another.
///
/// Decisions are consumed in arrival order, one per request.
pub struct ChannelApprovalGate {
    requests: mpsc::UnboundedSender<ApprovalRequest>,
    decisions: Mutex<mpsc::UnboundedReceiver<ApprovalDecision>>,
}

/// The operator's end of a [`ChannelApprovalGate`].
pub struct ApprovalInbox {
    pub requests: mpsc::UnboundedReceiver<ApprovalRequest>,
    pub decisions: mpsc::UnboundedSender<ApprovalDecision>,
}

impl ChannelApprovalGate {
    pub fn new() -> (Self, ApprovalInbox) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (decision_tx, decision_rx) = mpsc::unbounded_channel();
        (
            Self {
                requests: request_tx,
                decisions: Mutex::new(decision_rx),
            },
            ApprovalInbox {
                requests: request_rx,
                decisions: decision_tx,
            },
        )
    }
}

#[async_trait]
impl ApprovalGate for ChannelApprovalGate {
    async fn request(&self, request: &ApprovalRequest) -> Result<ApprovalDecision> {
        let mut decisions = self.decisions.lock().await;
        // The operator may only be listening for decisions.
        let _ = self.requests.send(request.clone());
        decisions.recv().await.ok_or(Error::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            run_id: ResourceId::new(),
            pipeline: "TradeStoreBuild".to_string(),
            stage: "approve".to_string(),
            action: "Approve".to_string(),
            notify: None,
        }
    }

    #[tokio::test]
    async fn test_channel_gate_waits_for_decision() {
        let (gate, mut inbox) = ChannelApprovalGate::new();

        let pending = tokio::spawn(async move { gate.request(&request()).await });

        let seen = inbox.requests.recv().await.unwrap();
        assert_eq!(seen.action, "Approve");
        inbox.decisions.send(ApprovalDecision::reject("not today")).unwrap();

        let decision = pending.await.unwrap().unwrap();
        assert_eq!(decision, ApprovalDecision::reject("not today"));
    }

    #[tokio::test]
    async fn test_closed_channel_cancels() {
        let (gate, inbox) = ChannelApprovalGate::new();
        drop(inbox);
        assert!(matches!(
            gate.request(&request()).await,
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn test_decision_serialization() {
        let json = serde_json::to_value(ApprovalDecision::approve()).unwrap();
        assert_eq!(json["decision"], "approved");
    }
}
