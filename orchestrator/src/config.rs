//! Declarative spec file loading and validation

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::OrchestratorError;
use crate::fsio::File;
use crate::models::balancer::{HealthCheck, DEFAULT_CONTAINER_PORT};
use crate::models::cicd::repository_full_id;
use crate::models::network::validate_network;

/// Default spec file name
pub const DEFAULT_CONFIG_FILE: &str = "risectl.json";

/// Declarative environment spec
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application name; prefixes every resource name and tags every
    /// resource. Lowercase alphanumeric plus hyphens.
    pub app: String,

    /// Provider region
    #[serde(default = "default_region")]
    pub region: String,

    /// Port the container listens on
    #[serde(default = "default_container_port")]
    pub container_port: u16,

    /// Desired replica count
    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// CPU units reserved per task
    #[serde(default = "default_cpu")]
    pub cpu: u32,

    /// Memory (MiB) reserved per task
    #[serde(default = "default_memory")]
    pub memory: u32,

    /// Backend provider
    #[serde(default)]
    pub provider: ProviderBackend,

    /// Maximum resources applied in parallel within a graph level
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Network layout
    #[serde(default)]
    pub network: NetworkSettings,

    /// Target health check
    #[serde(default)]
    pub health_check: HealthCheck,

    /// CI/CD wiring
    #[serde(default)]
    pub cicd: CicdSettings,

    /// Call and rollout timeouts
    #[serde(default)]
    pub timeouts: TimeoutSettings,

    /// Directory release artifacts are written to
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_container_port() -> u16 {
    DEFAULT_CONTAINER_PORT
}

fn default_replicas() -> u32 {
    1
}

fn default_cpu() -> u32 {
    256
}

fn default_memory() -> u32 {
    512
}

fn default_concurrency() -> usize {
    4
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

/// Backend provider selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderBackend {
    /// Drive the AWS CLI
    #[default]
    Aws,

    /// In-process provider for tests and rehearsals
    Memory,
}

/// CI/CD wiring settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CicdSettings {
    /// Delivery mode
    #[serde(default)]
    pub provider: CicdProvider,

    /// Source repository URL
    #[serde(default)]
    pub repository: String,

    /// Source branch
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

impl Default for CicdSettings {
    fn default() -> Self {
        Self {
            provider: CicdProvider::default(),
            repository: String::new(),
            branch: default_branch(),
        }
    }
}

/// Delivery mode: a managed pipeline, or an external system driving the
/// registry and service through a scoped credential
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CicdProvider {
    #[default]
    Pipeline,
    External,
}

/// Network layout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// VPC CIDR block
    #[serde(default = "default_vpc_cidr")]
    pub cidr: String,

    /// Subnets; at least two zones for the load balancer
    #[serde(default = "default_subnets")]
    pub subnets: Vec<SubnetSettings>,
}

fn default_vpc_cidr() -> String {
    "10.0.0.0/16".to_string()
}

fn default_subnets() -> Vec<SubnetSettings> {
    vec![
        SubnetSettings { zone: "a".to_string(), cidr: "10.0.0.0/24".to_string(), public: true },
        SubnetSettings { zone: "b".to_string(), cidr: "10.0.1.0/24".to_string(), public: true },
    ]
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self { cidr: default_vpc_cidr(), subnets: default_subnets() }
    }
}

/// One subnet of the layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetSettings {
    /// Availability zone: a bare suffix ("a") is appended to the region,
    /// a full name ("us-east-1a") is used as-is
    pub zone: String,

    /// Subnet CIDR block
    pub cidr: String,

    /// Public subnet
    #[serde(default = "default_true")]
    pub public: bool,
}

fn default_true() -> bool {
    true
}

impl SubnetSettings {
    /// Full availability zone name for the configured region.
    pub fn full_zone(&self, region: &str) -> String {
        if self.zone.starts_with(region) {
            self.zone.clone()
        } else {
            format!("{}{}", region, self.zone)
        }
    }
}

/// Timeout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// Per provider call, seconds
    #[serde(default = "default_provider_call_secs")]
    pub provider_call_secs: u64,

    /// Rollout stabilization, seconds
    #[serde(default = "default_rollout_secs")]
    pub rollout_secs: u64,

    /// Rollout poll interval, seconds
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_provider_call_secs() -> u64 {
    60
}

fn default_rollout_secs() -> u64 {
    600
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            provider_call_secs: default_provider_call_secs(),
            rollout_secs: default_rollout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Settings {
    /// Load and validate the spec file.
    pub async fn load(path: &Path) -> Result<Self, OrchestratorError> {
        let file = File::new(path);
        if !file.exists().await {
            return Err(OrchestratorError::ConfigError(format!(
                "spec file {} not found",
                path.display()
            )));
        }

        let settings: Settings = file.read_json().await.map_err(|e| {
            OrchestratorError::ConfigError(format!("failed to parse {}: {}", path.display(), e))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the spec. Nothing is applied when validation fails.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.app.is_empty() {
            return Err(OrchestratorError::ConfigError("app name is empty".to_string()));
        }
        let valid_name = self.app.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && self.app.starts_with(|c: char| c.is_ascii_lowercase());
        if !valid_name {
            return Err(OrchestratorError::ConfigError(format!(
                "app name '{}' must be lowercase alphanumeric with hyphens",
                self.app
            )));
        }

        if self.container_port == 0 {
            return Err(OrchestratorError::ConfigError("container_port must be non-zero".to_string()));
        }

        if self.concurrency == 0 {
            return Err(OrchestratorError::ConfigError("concurrency must be at least 1".to_string()));
        }

        if self.network.subnets.is_empty() {
            return Err(OrchestratorError::ConfigError("at least one subnet is required".to_string()));
        }

        let subnets: Vec<(String, String)> = self
            .network
            .subnets
            .iter()
            .map(|s| (s.full_zone(&self.region), s.cidr.clone()))
            .collect();
        validate_network(&self.network.cidr, &subnets)?;

        // The pipeline watches a repository; external mode needs none.
        if self.cicd.provider == CicdProvider::Pipeline {
            if self.cicd.repository.is_empty() {
                return Err(OrchestratorError::ConfigError(
                    "cicd.repository is required in pipeline mode".to_string(),
                ));
            }
            repository_full_id(&self.cicd.repository)?;
            if self.cicd.branch.is_empty() {
                return Err(OrchestratorError::ConfigError(
                    "cicd.branch is required in pipeline mode".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(app: &str) -> Settings {
        serde_json::from_str(&format!(
            r#"{{"app": "{}", "cicd": {{"repository": "https://github.com/rise/rise-app"}}}}"#,
            app
        ))
        .unwrap()
    }

    #[test]
    fn test_defaults_from_minimal_spec() {
        let settings = minimal("rise-app");
        assert_eq!(settings.region, "us-east-1");
        assert_eq!(settings.container_port, 3000);
        assert_eq!(settings.replicas, 1);
        assert_eq!(settings.concurrency, 4);
        assert_eq!(settings.provider, ProviderBackend::Aws);
        assert_eq!(settings.cicd.provider, CicdProvider::Pipeline);
        assert_eq!(settings.cicd.branch, "main");
        assert_eq!(settings.network.subnets.len(), 2);
        assert_eq!(settings.health_check.path, "/");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_invalid_app_names_rejected() {
        assert!(minimal("Rise-App").validate().is_err());
        assert!(minimal("1app").validate().is_err());

        let mut empty = minimal("rise-app");
        empty.app = String::new();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_pipeline_mode_requires_repository() {
        let settings: Settings = serde_json::from_str(r#"{"app": "rise-app"}"#).unwrap();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("cicd.repository"));
    }

    #[test]
    fn test_external_mode_needs_no_repository() {
        let settings: Settings = serde_json::from_str(
            r#"{"app": "rise-app", "cicd": {"provider": "external"}}"#,
        )
        .unwrap();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_overlapping_subnets_rejected() {
        let settings: Settings = serde_json::from_str(
            r#"{
                "app": "rise-app",
                "cicd": {"provider": "external"},
                "network": {
                    "cidr": "10.0.0.0/16",
                    "subnets": [
                        {"zone": "a", "cidr": "10.0.0.0/23"},
                        {"zone": "b", "cidr": "10.0.1.0/24"}
                    ]
                }
            }"#,
        )
        .unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_zone_expansion() {
        let subnet = SubnetSettings {
            zone: "a".to_string(),
            cidr: "10.0.0.0/24".to_string(),
            public: true,
        };
        assert_eq!(subnet.full_zone("us-east-1"), "us-east-1a");

        let full = SubnetSettings {
            zone: "eu-west-1c".to_string(),
            cidr: "10.0.0.0/24".to_string(),
            public: true,
        };
        assert_eq!(full.full_zone("eu-west-1"), "eu-west-1c");
    }
}
