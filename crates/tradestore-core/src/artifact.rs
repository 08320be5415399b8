//! Artifacts passed between pipeline actions.
//!
//! An artifact is declared by name in the pipeline definition, filled exactly
//! once by its producing action during a run, read by any number of later
//! actions, and discarded when the run ends.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::{Error, ResourceId, Result};

/// Name of an artifact within a pipeline.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
pub struct ArtifactName(String);

impl ArtifactName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reference a single file inside this artifact.
    pub fn at_path(&self, path: impl Into<String>) -> ArtifactPath {
        ArtifactPath {
            artifact: self.clone(),
            path: path.into(),
        }
    }
}

impl From<&str> for ArtifactName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ArtifactName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A file inside an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPath {
    pub artifact: ArtifactName,
    pub path: String,
}

impl std::fmt::Display for ArtifactPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.artifact, self.path)
    }
}

/// The files making up an artifact, keyed by relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactBundle {
    files: BTreeMap<String, Bytes>,
}

impl ArtifactBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<Bytes>) -> Self {
        self.insert(path, content);
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<Bytes>) {
        self.files.insert(path.into(), content.into());
    }

    pub fn file(&self, path: &str) -> Option<&Bytes> {
        self.files.get(path.trim_start_matches("./"))
    }

    pub fn files(&self) -> impl Iterator<Item = (&String, &Bytes)> {
        self.files.iter()
    }

    /// Keep only the files whose path satisfies `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.files.retain(|path, _| keep(path));
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn size(&self) -> u64 {
        self.files.values().map(|b| b.len() as u64).sum()
    }

    /// SHA-256 over every path and its content, in path order.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, content) in &self.files {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(content);
        }
        hex::encode(hasher.finalize())
    }
}

/// Reference to a stored artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub run_id: ResourceId,
    pub name: ArtifactName,
    /// Content hash for integrity.
    pub checksum: String,
    pub size: u64,
    pub file_count: usize,
    pub created_at: DateTime<Utc>,
}

/// Trait for artifact storage backends.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store an artifact. Each name can be written once per run.
    async fn put(&self, run_id: ResourceId, name: &ArtifactName, bundle: ArtifactBundle)
    -> Result<ArtifactRef>;

    /// Retrieve an artifact.
    async fn get(&self, run_id: ResourceId, name: &ArtifactName) -> Result<ArtifactBundle>;

    /// List artifacts stored for a run.
    async fn list(&self, run_id: ResourceId) -> Result<Vec<ArtifactRef>>;

    /// Drop every artifact of a run.
    async fn discard(&self, run_id: ResourceId) -> Result<usize>;
}

/// Process-local artifact store.
#[derive(Default)]
pub struct InMemoryArtifactStore {
    entries: RwLock<HashMap<(ResourceId, ArtifactName), (ArtifactRef, ArtifactBundle)>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(
        &self,
        run_id: ResourceId,
        name: &ArtifactName,
        bundle: ArtifactBundle,
    ) -> Result<ArtifactRef> {
        let mut entries = self.entries.write().await;
        let key = (run_id, name.clone());
        if entries.contains_key(&key) {
            return Err(Error::Conflict(format!(
                "artifact '{}' already written in run {}",
                name, run_id
            )));
        }

        let reference = ArtifactRef {
            run_id,
            name: name.clone(),
            checksum: bundle.checksum(),
            size: bundle.size(),
            file_count: bundle.len(),
            created_at: Utc::now(),
        };
        entries.insert(key, (reference.clone(), bundle));
        Ok(reference)
    }

    async fn get(&self, run_id: ResourceId, name: &ArtifactName) -> Result<ArtifactBundle> {
        self.entries
            .read()
            .await
            .get(&(run_id, name.clone()))
            .map(|(_, bundle)| bundle.clone())
            .ok_or_else(|| Error::NotFound(format!("artifact '{}' in run {}", name, run_id)))
    }

    async fn list(&self, run_id: ResourceId) -> Result<Vec<ArtifactRef>> {
        let mut refs: Vec<ArtifactRef> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|((id, _), _)| *id == run_id)
            .map(|(_, (reference, _))| reference.clone())
            .collect();
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(refs)
    }

    async fn discard(&self, run_id: ResourceId) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|(id, _), _| *id != run_id);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_artifact_is_write_once() {
        let store = InMemoryArtifactStore::new();
        let run = ResourceId::new();
        let name = ArtifactName::new("buildOutput");

        store
            .put(run, &name, ArtifactBundle::new().with_file("a.txt", "one"))
            .await
            .unwrap();
        let second = store
            .put(run, &name, ArtifactBundle::new().with_file("a.txt", "two"))
            .await;
        assert!(matches!(second, Err(Error::Conflict(_))));

        let bundle = store.get(run, &name).await.unwrap();
        assert_eq!(bundle.file("a.txt").unwrap().as_ref(), b"one");
    }

    #[tokio::test]
    async fn test_same_name_in_different_runs() {
        let store = InMemoryArtifactStore::new();
        let name = ArtifactName::new("sourceOutput");
        let (run_a, run_b) = (ResourceId::new(), ResourceId::new());

        store.put(run_a, &name, ArtifactBundle::new()).await.unwrap();
        store.put(run_b, &name, ArtifactBundle::new()).await.unwrap();

        assert_eq!(store.discard(run_a).await.unwrap(), 1);
        assert!(store.get(run_a, &name).await.is_err());
        assert!(store.get(run_b, &name).await.is_ok());
    }

    #[test]
    fn test_checksum_depends_on_content() {
        let a = ArtifactBundle::new().with_file("x", "1");
        let b = ArtifactBundle::new().with_file("x", "2");
        assert_ne!(a.checksum(), b.checksum());
        assert_eq!(a.checksum(), a.clone().checksum());
    }

    #[test]
    fn test_file_lookup_ignores_leading_dot_slash() {
        let bundle = ArtifactBundle::new().with_file("imagedefinitions.json", "[]");
        assert!(bundle.file("./imagedefinitions.json").is_some());
    }
}
