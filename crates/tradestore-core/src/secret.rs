//! Secret storage abstraction.
//!
//! Secrets are looked up by name while a run executes; pipeline definitions
//! only ever carry the secret's name.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{Error, Result};

/// A secret value (can be a single string or key-value pairs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SecretValue {
    String(String),
    Map(HashMap<String, String>),
}

impl SecretValue {
    /// The value as a single string.
    ///
    /// A map only has one when it holds exactly one key; with several keys
    /// there is no defined choice and `None` is returned.
    pub fn as_string(&self) -> Option<&str> {
        match self {
            SecretValue::String(s) => Some(s),
            SecretValue::Map(m) if m.len() == 1 => m.values().next().map(|s| s.as_str()),
            SecretValue::Map(_) => None,
        }
    }
}

/// Trait for secret storage backends.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Get a secret by name.
    async fn get(&self, name: &str) -> Result<SecretValue>;
}

/// Secret store holding a fixed set of values.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    secrets: HashMap<String, SecretValue>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets
            .insert(name.into(), SecretValue::String(value.into()));
        self
    }

    /// Collect `<PREFIX>_<NAME>` variables from the process environment.
    ///
    /// `TRADESTORE_SECRET_GITHUB_TOKEN` becomes the secret `github-token`.
    pub fn from_env(prefix: &str) -> Self {
        Self::from_vars(prefix, std::env::vars())
    }

    fn from_vars(prefix: &str, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let prefix = format!("{}_", prefix);
        let secrets = vars
            .into_iter()
            .filter_map(|(key, value)| {
                let name = key.strip_prefix(&prefix)?;
                Some((
                    name.to_ascii_lowercase().replace('_', "-"),
                    SecretValue::String(value),
                ))
            })
            .collect();
        Self { secrets }
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn get(&self, name: &str) -> Result<SecretValue> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("secret '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_names_are_normalized() {
        let store = StaticSecretStore::from_vars(
            "TRADESTORE_SECRET",
            vec![
                ("TRADESTORE_SECRET_GITHUB_TOKEN".to_string(), "ghp_x".to_string()),
                ("HOME".to_string(), "/root".to_string()),
            ],
        );
        assert_eq!(store.len(), 1);
        assert!(store.secrets.contains_key("github-token"));
    }

    #[tokio::test]
    async fn test_missing_secret_is_not_found() {
        let store = StaticSecretStore::new().with_secret("github-token", "abc");
        assert_eq!(
            store.get("github-token").await.unwrap().as_string(),
            Some("abc")
        );
        assert!(matches!(
            store.get("other").await,
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_map_secret_needs_a_single_key() {
        let single = SecretValue::Map(HashMap::from([("token".to_string(), "abc".to_string())]));
        assert_eq!(single.as_string(), Some("abc"));

        let several = SecretValue::Map(HashMap::from([
            ("user".to_string(), "octocat".to_string()),
            ("token".to_string(), "abc".to_string()),
        ]));
        assert_eq!(several.as_string(), None);
    }
}
