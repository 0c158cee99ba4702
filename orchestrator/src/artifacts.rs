//! Release artifact files: the single-entry image manifest, the
//! plain-text tag file, and the local deployment history.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::warn;

use crate::errors::OrchestratorError;
use crate::fsio::Dir;
use crate::models::artifact::{
    DeploymentRecord, ImageDefinition, RecordAction, HISTORY_FILE, MANIFEST_FILE, TAG_FILE,
};

/// Writes release artifacts into one directory
pub struct ArtifactStore {
    dir: Dir,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: Dir::new(dir) }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write the artifact manifest. It always holds exactly one entry:
    /// the app's container and the image it should run.
    pub async fn write_manifest(
        &self,
        app: &str,
        image_uri: &str,
    ) -> Result<PathBuf, OrchestratorError> {
        let manifest = vec![ImageDefinition {
            name: app.to_string(),
            image_uri: image_uri.to_string(),
        }];
        let file = self.dir.file(MANIFEST_FILE);
        file.write_atomic(serde_json::to_string(&manifest)?.as_bytes()).await?;
        Ok(file.path().to_path_buf())
    }

    /// Write the resolved tag as plain text.
    pub async fn write_tag(&self, tag: &str) -> Result<PathBuf, OrchestratorError> {
        let file = self.dir.file(TAG_FILE);
        file.write_atomic(format!("{}\n", tag).as_bytes()).await?;
        Ok(file.path().to_path_buf())
    }

    /// Append one deployment record to the local history.
    pub async fn record(
        &self,
        action: RecordAction,
        tag: &str,
        image_uri: &str,
        revision: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let mut records = self.history().await?;
        records.push(DeploymentRecord {
            action,
            tag: tag.to_string(),
            image_uri: image_uri.to_string(),
            revision,
            recorded_at: Utc::now(),
        });

        let file = self.dir.file(HISTORY_FILE);
        file.write_atomic(serde_json::to_string_pretty(&records)?.as_bytes()).await
    }

    /// All recorded deployments, oldest first.
    pub async fn history(&self) -> Result<Vec<DeploymentRecord>, OrchestratorError> {
        let file = self.dir.file(HISTORY_FILE);
        if !file.exists().await {
            return Ok(Vec::new());
        }
        match file.read_json().await {
            Ok(records) => Ok(records),
            Err(e) => {
                warn!("discarding unreadable history at {}: {}", file.path().display(), e);
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsio::File;

    #[tokio::test]
    async fn test_manifest_holds_exactly_one_entry() {
        let dir = Dir::create_temp_dir("artifacts-test").await.unwrap();
        let store = ArtifactStore::new(dir.path());

        let path = store
            .write_manifest("rise-app", "registry.local/rise-app:a1b2c3d")
            .await
            .unwrap();
        let written = File::new(&path).read_string().await.unwrap();
        assert_eq!(
            written,
            r#"[{"name":"rise-app","imageUri":"registry.local/rise-app:a1b2c3d"}]"#
        );

        let parsed: Vec<ImageDefinition> = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, "rise-app");

        dir.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_tag_file_content() {
        let dir = Dir::create_temp_dir("artifacts-test").await.unwrap();
        let store = ArtifactStore::new(dir.path());

        let path = store.write_tag("a1b2c3d").await.unwrap();
        let written = File::new(&path).read_string().await.unwrap();
        assert_eq!(written.trim(), "a1b2c3d");

        dir.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_history_appends_in_order() {
        let dir = Dir::create_temp_dir("artifacts-test").await.unwrap();
        let store = ArtifactStore::new(dir.path());

        store
            .record(
                RecordAction::Release,
                "a1b2c3d",
                "registry.local/rise-app:a1b2c3d",
                Some("a1b2c3d4e5".to_string()),
            )
            .await
            .unwrap();
        store
            .record(RecordAction::Deploy, "a1b2c3d", "registry.local/rise-app:a1b2c3d", None)
            .await
            .unwrap();

        let history = store.history().await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, RecordAction::Release);
        assert_eq!(history[1].action, RecordAction::Deploy);
        assert!(history[0].recorded_at <= history[1].recorded_at);

        dir.delete().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreadable_history_starts_fresh() {
        let dir = Dir::create_temp_dir("artifacts-test").await.unwrap();
        dir.file(HISTORY_FILE).write_string("not json").await.unwrap();

        let store = ArtifactStore::new(dir.path());
        assert!(store.history().await.unwrap().is_empty());

        store
            .record(RecordAction::Release, "latest", "registry.local/rise-app:latest", None)
            .await
            .unwrap();
        assert_eq!(store.history().await.unwrap().len(), 1);

        dir.delete().await.unwrap();
    }
}
