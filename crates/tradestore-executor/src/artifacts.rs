//! Moving artifacts between bundles and build workspaces.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::{Component, Path};
use tradestore_core::artifact::ArtifactBundle;
use tradestore_core::executor::ArtifactSelection;
use tradestore_core::{Error, Result};
use walkdir::WalkDir;

/// Collect the workspace files matched by `selection` into a bundle.
///
/// Paths in the bundle are relative to the selection's base directory. The
/// directory walk runs on the blocking thread pool.
pub async fn collect_artifacts(
    workspace: &Path,
    selection: &ArtifactSelection,
) -> Result<ArtifactBundle> {
    let workspace = workspace.to_path_buf();
    let selection = selection.clone();
    tokio::task::spawn_blocking(move || collect_blocking(&workspace, &selection))
        .await
        .map_err(|e| Error::Internal(format!("artifact collection task failed: {}", e)))?
}

fn collect_blocking(workspace: &Path, selection: &ArtifactSelection) -> Result<ArtifactBundle> {
    let base = match &selection.base_directory {
        Some(dir) => workspace.join(checked_relative(dir)?),
        None => workspace.to_path_buf(),
    };
    if !base.is_dir() {
        return Err(Error::ExecutionFailed(format!(
            "artifact base directory {} does not exist",
            base.display()
        )));
    }

    let matcher = build_matcher(&selection.files)?;
    let mut bundle = ArtifactBundle::new();

    for entry in WalkDir::new(&base).follow_links(false) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(&base) else {
            continue;
        };
        if matcher.is_match(relative) {
            let content = std::fs::read(entry.path())?;
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            bundle.insert(key, content);
        }
    }

    Ok(bundle)
}

/// Write every file of a bundle under `dir`.
pub async fn write_bundle(dir: &Path, bundle: &ArtifactBundle) -> Result<()> {
    for (path, content) in bundle.files() {
        let target = dir.join(checked_relative(path)?);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
    }
    Ok(())
}

fn build_matcher(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| {
                Error::InvalidInput(format!("invalid artifact pattern '{}': {}", pattern, e))
            })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::InvalidInput(format!("invalid artifact patterns: {}", e)))
}

// Artifact paths come from build output; keep them inside the workspace.
fn checked_relative(path: &str) -> Result<&Path> {
    let p = Path::new(path);
    let escapes = p
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(Error::InvalidInput(format!(
            "path '{}' leaves the workspace",
            path
        )));
    }
    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selection(base: Option<&str>, files: &[&str]) -> ArtifactSelection {
        ArtifactSelection {
            base_directory: base.map(String::from),
            files: files.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_collect_with_base_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("cdk.out");
        std::fs::create_dir_all(out.join("assets")).unwrap();
        std::fs::write(out.join("stack.template.json"), "{}").unwrap();
        std::fs::write(out.join("assets/a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("outside.txt"), "x").unwrap();

        let bundle = collect_artifacts(dir.path(), &selection(Some("cdk.out"), &["**/*"]))
            .await
            .unwrap();
        assert_eq!(bundle.len(), 2);
        assert!(bundle.file("stack.template.json").is_some());
        assert!(bundle.file("assets/a.txt").is_some());
    }

    #[tokio::test]
    async fn test_collect_single_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("imagedefinitions.json"), "[]").unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/imagedefinitions.json"), "[]").unwrap();

        let bundle = collect_artifacts(dir.path(), &selection(None, &["imagedefinitions.json"]))
            .await
            .unwrap();
        assert_eq!(bundle.len(), 1);
        assert_eq!(&bundle.file("imagedefinitions.json").unwrap()[..], b"[]");
    }

    #[tokio::test]
    async fn test_missing_base_directory() {
        let dir = tempfile::tempdir().unwrap();
        let result = collect_artifacts(dir.path(), &selection(Some("cdk.out"), &["**/*"])).await;
        assert!(matches!(result, Err(Error::ExecutionFailed(_))));
    }

    #[test]
    fn test_escaping_paths_rejected() {
        assert!(checked_relative("../etc/passwd").is_err());
        assert!(checked_relative("/etc/passwd").is_err());
        assert!(checked_relative("./a/b").is_ok());
    }

    #[tokio::test]
    async fn test_write_bundle_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = ArtifactBundle::new()
            .with_file("cdk.out/stack.template.json", "{}")
            .with_file("README", "hi");
        write_bundle(dir.path(), &bundle).await.unwrap();

        let collected = collect_artifacts(dir.path(), &selection(None, &["**/*"]))
            .await
            .unwrap();
        assert_eq!(collected, bundle);
    }
}
