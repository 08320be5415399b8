//! Source repositories, triggers and GitHub webhook handling.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// A GitHub repository branch checked out by a source action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubSource {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    /// Name of the secret holding the access token.
    pub token_secret: String,
    /// Whether pushes should trigger the pipeline through a webhook.
    pub webhook: bool,
}

impl GitHubSource {
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        branch: impl Into<String>,
        token_secret: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            branch: branch.into(),
            token_secret: token_secret.into(),
            webhook: true,
        }
    }

    /// `owner/repo`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    pub fn clone_url(&self) -> String {
        format!("https://github.com/{}.git", self.full_name())
    }

    /// The push trigger this source registers when webhooks are enabled.
    pub fn trigger(&self) -> Option<Trigger> {
        self.webhook.then(|| Trigger::Push {
            repository: self.full_name(),
            branches: vec![self.branch.clone()],
        })
    }
}

/// What starts a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    /// Push to one of `branches` of `repository` (`owner/repo`).
    Push {
        repository: String,
        branches: Vec<String>,
    },
    /// Started by an operator.
    Manual,
}

impl Trigger {
    pub fn matches(&self, event: &PushEvent) -> bool {
        match self {
            Trigger::Push {
                repository,
                branches,
            } => {
                if !repository.eq_ignore_ascii_case(&event.repository_full_name) {
                    return false;
                }
                match &event.branch {
                    Some(branch) => matches_branch_pattern(branch, branches),
                    None => false,
                }
            }
            Trigger::Manual => false,
        }
    }
}

/// A GitHub push webhook payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    pub r#ref: String,
    pub after: String,
    pub repository_full_name: String,
    pub branch: Option<String>,
    pub pusher: String,
}

impl PushEvent {
    /// Parse a GitHub push webhook payload.
    pub fn from_github_payload(payload: &serde_json::Value) -> Option<Self> {
        let r#ref = payload.get("ref")?.as_str()?.to_string();
        let after = payload.get("after")?.as_str()?.to_string();
        let repository_full_name = payload
            .get("repository")?
            .get("full_name")?
            .as_str()?
            .to_string();
        let branch = r#ref.strip_prefix("refs/heads/").map(|b| b.to_string());
        let pusher = payload
            .get("pusher")
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or_default()
            .to_string();

        Some(PushEvent {
            r#ref,
            after,
            repository_full_name,
            branch,
            pusher,
        })
    }
}

/// Check if a branch name matches any of the given patterns.
/// Supports a single '*' wildcard per pattern.
pub fn matches_branch_pattern(branch: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| match pattern.split_once('*') {
        Some((prefix, suffix)) if !suffix.contains('*') => {
            branch.len() >= prefix.len() + suffix.len()
                && branch.starts_with(prefix)
                && branch.ends_with(suffix)
        }
        Some(_) => branch == pattern,
        None => branch == pattern,
    })
}

/// Verify a GitHub `X-Hub-Signature-256` header against the raw body.
pub fn verify_github_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };

    // Signature format: "sha256=<hex>"
    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&sig_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn push(repo: &str, r#ref: &str) -> PushEvent {
        PushEvent::from_github_payload(&json!({
            "ref": r#ref,
            "after": "0123456789abcdef",
            "repository": { "full_name": repo },
            "pusher": { "name": "dev" }
        }))
        .unwrap()
    }

    #[test]
    fn test_push_trigger_filters_branch() {
        let source = GitHubSource::new("cvlsrivatsa", "TradeStoreApp", "main", "github-token");
        let trigger = source.trigger().unwrap();

        assert!(trigger.matches(&push("cvlsrivatsa/TradeStoreApp", "refs/heads/main")));
        assert!(!trigger.matches(&push("cvlsrivatsa/TradeStoreApp", "refs/heads/dev")));
        assert!(!trigger.matches(&push("cvlsrivatsa/TradeStoreApp", "refs/tags/v1")));
        assert!(!trigger.matches(&push("cvlsrivatsa/TradeStoreCdk", "refs/heads/main")));
    }

    #[test]
    fn test_webhook_disabled_has_no_trigger() {
        let mut source = GitHubSource::new("o", "r", "main", "s");
        source.webhook = false;
        assert!(source.trigger().is_none());
    }

    #[test]
    fn test_branch_patterns() {
        let patterns = vec!["release/*".to_string()];
        assert!(matches_branch_pattern("release/1.0", &patterns));
        assert!(!matches_branch_pattern("main", &patterns));
        assert!(matches_branch_pattern("main", &["main".to_string()]));
    }

    #[test]
    fn test_signature_verification() {
        let secret = "topsecret";
        let body = br#"{"ref":"refs/heads/main"}"#;

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let header = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(verify_github_signature(secret, body, Some(&header)));
        assert!(!verify_github_signature("wrong", body, Some(&header)));
        assert!(!verify_github_signature(secret, body, None));
        assert!(!verify_github_signature(secret, body, Some("sha1=abc")));
    }
}
