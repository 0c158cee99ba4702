//! Release artifact models: the image manifest and deployment records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File name of the artifact manifest consumed by the deploy stage
pub const MANIFEST_FILE: &str = "imagedefinitions.json";

/// File name of the plain-text resolved tag
pub const TAG_FILE: &str = "image_tag.txt";

/// File name of the local deployment record log
pub const HISTORY_FILE: &str = "deploy_history.json";

/// One entry of the artifact manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageDefinition {
    /// Container name, equals the app name
    pub name: String,

    /// Full image reference, `registryUri:resolvedTag`
    #[serde(rename = "imageUri")]
    pub image_uri: String,
}

/// What produced a deployment record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordAction {
    /// Image built and pushed
    Release,

    /// Service pointed at an image
    Deploy,
}

impl std::fmt::Display for RecordAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordAction::Release => write!(f, "release"),
            RecordAction::Deploy => write!(f, "deploy"),
        }
    }
}

/// Commit -> image tag mapping, appended once per release or deploy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// What happened
    pub action: RecordAction,

    /// Resolved image tag
    pub tag: String,

    /// Full image reference
    pub image_uri: String,

    /// Source revision the tag was derived from, if resolved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    /// When the record was written
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_entry_wire_shape() {
        let entry = ImageDefinition {
            name: "rise-app".to_string(),
            image_uri: "registry.local/rise-app:a1b2c3d".to_string(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(
            json,
            r#"{"name":"rise-app","imageUri":"registry.local/rise-app:a1b2c3d"}"#
        );
    }

    #[test]
    fn test_record_omits_unresolved_revision() {
        let record = DeploymentRecord {
            action: RecordAction::Release,
            tag: "latest".to_string(),
            image_uri: "registry.local/rise-app:latest".to_string(),
            revision: None,
            recorded_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("revision"));
        assert!(json.contains(r#""action":"release""#));
    }
}
