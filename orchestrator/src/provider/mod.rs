//! Cloud provider backends
//!
//! The engine talks to infrastructure through the [`CloudProvider`] trait;
//! the AWS CLI backend is the production one and the in-memory backend
//! serves local runs and tests.

pub mod aws;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::config::{ProviderBackend, Settings};
use crate::errors::OrchestratorError;
use crate::models::cicd::CredentialSpec;
use crate::models::compute::ServiceHealth;
use crate::models::resource::{DesiredResource, ResourceRecord, ResourceSpec};

/// An access key pair minted for an external deployer. The secret half
/// exists only in this value and is never written to a record or a log.
#[derive(Debug)]
pub struct CredentialPair {
    pub access_key_id: String,
    pub secret: SecretString,
}

/// Provider trait
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Short backend label for logs
    fn name(&self) -> &'static str;

    /// Look up the live record for a desired resource by logical name.
    /// Returns `None` when nothing with that name exists yet.
    async fn describe(
        &self,
        app: &str,
        desired: &DesiredResource,
    ) -> Result<Option<ResourceRecord>, OrchestratorError>;

    /// Create the resource. `spec` arrives with all references resolved
    /// to provider identifiers.
    async fn create(
        &self,
        app: &str,
        name: &str,
        spec: &ResourceSpec,
    ) -> Result<ResourceRecord, OrchestratorError>;

    /// Create a credential principal and mint its key pair.
    async fn create_credential(
        &self,
        app: &str,
        name: &str,
        spec: &CredentialSpec,
    ) -> Result<(ResourceRecord, CredentialPair), OrchestratorError>;

    /// Apply changed mutable fields in place. `spec` arrives resolved.
    async fn update(
        &self,
        record: &ResourceRecord,
        spec: &ResourceSpec,
        changed: &[String],
    ) -> Result<ResourceRecord, OrchestratorError>;

    /// Tear the resource down.
    async fn delete(&self, record: &ResourceRecord) -> Result<(), OrchestratorError>;

    /// Every live record tagged with the app name.
    async fn list_app_resources(
        &self,
        app: &str,
    ) -> Result<Vec<ResourceRecord>, OrchestratorError>;

    /// Current task counts and image for a service.
    async fn service_health(
        &self,
        cluster: &str,
        service: &str,
    ) -> Result<ServiceHealth, OrchestratorError>;

    /// Point the service at a new image and start a rollout.
    async fn set_service_image(
        &self,
        cluster: &str,
        service: &str,
        image: &str,
    ) -> Result<(), OrchestratorError>;
}

/// Build the provider backend the spec selects.
pub fn create_provider(settings: &Settings) -> Arc<dyn CloudProvider> {
    match settings.provider {
        ProviderBackend::Aws => Arc::new(aws::AwsCliProvider::new(settings.region.clone())),
        ProviderBackend::Memory => Arc::new(memory::MemoryProvider::new()),
    }
}
