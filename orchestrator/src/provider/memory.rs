//! In-memory provider backend
//!
//! Backs local runs and the integration tests. Keeps records in a map,
//! counts mutations, and can inject faults and delayed rollouts.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine;
use secrecy::SecretString;
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::OrchestratorError;
use crate::models::cicd::CredentialSpec;
use crate::models::compute::ServiceHealth;
use crate::models::resource::{DesiredResource, ResourceKind, ResourceRecord, ResourceSpec};
use crate::provider::{CloudProvider, CredentialPair};
use crate::utils::{generate_uuid, sha256_digest};

#[derive(Debug, Clone)]
struct ServiceStatus {
    desired: u32,
    image: String,
    /// Health polls left before the current rollout reports stable
    pending_polls: u32,
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<String, ResourceRecord>,
    services: HashMap<String, ServiceStatus>,
    mutations: u64,
    faults_left: u32,
    fault_transient: bool,
    stabilize_after: u32,
}

/// In-memory provider
pub struct MemoryProvider {
    state: RwLock<MemoryState>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self { state: RwLock::new(MemoryState::default()) }
    }

    /// Number of mutating calls that have succeeded
    pub async fn mutation_count(&self) -> u64 {
        self.state.read().await.mutations
    }

    /// Fail the next `calls` mutating calls with a provider error
    pub async fn fail_next(&self, calls: u32, transient: bool) {
        let mut state = self.state.write().await;
        state.faults_left = calls;
        state.fault_transient = transient;
    }

    /// Make fresh rollouts report unstable for `polls` health checks
    pub async fn set_stabilize_after(&self, polls: u32) {
        self.state.write().await.stabilize_after = polls;
    }

    /// Fetch a record by logical name
    pub async fn record(&self, name: &str) -> Option<ResourceRecord> {
        self.state.read().await.records.get(name).cloned()
    }

    fn take_fault(state: &mut MemoryState, resource: &str) -> Result<(), OrchestratorError> {
        if state.faults_left > 0 {
            state.faults_left -= 1;
            return Err(OrchestratorError::ProviderError {
                resource: resource.to_string(),
                message: "injected fault".to_string(),
                transient: state.fault_transient,
            });
        }
        Ok(())
    }

    fn build_record(
        app: &str,
        name: &str,
        spec: &ResourceSpec,
    ) -> Result<ResourceRecord, OrchestratorError> {
        let kind = spec.kind();
        let mut attributes = spec.attributes()?;

        // Identifiers the real backend computes at creation time.
        if let Some(map) = attributes.as_object_mut() {
            match spec {
                ResourceSpec::Repository(repo) => {
                    map.insert(
                        "uri".to_string(),
                        format!("registry.local/{}", repo.name).into(),
                    );
                }
                ResourceSpec::LoadBalancer(lb) => {
                    map.insert("dns_name".to_string(), format!("{}.lb.local", lb.name).into());
                }
                _ => {}
            }
        }

        Ok(ResourceRecord {
            name: name.to_string(),
            kind,
            provider_id: format!("mem-{}-{}", kind, &generate_uuid()[..8]),
            app: app.to_string(),
            attributes,
        })
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudProvider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn describe(
        &self,
        app: &str,
        desired: &DesiredResource,
    ) -> Result<Option<ResourceRecord>, OrchestratorError> {
        let state = self.state.read().await;
        Ok(state.records.get(&desired.name).filter(|r| r.app == app).cloned())
    }

    async fn create(
        &self,
        app: &str,
        name: &str,
        spec: &ResourceSpec,
    ) -> Result<ResourceRecord, OrchestratorError> {
        let mut state = self.state.write().await;
        Self::take_fault(&mut state, name)?;

        if state.records.contains_key(name) {
            return Err(OrchestratorError::ConflictError {
                resource: name.to_string(),
                detail: "already exists".to_string(),
            });
        }

        let record = Self::build_record(app, name, spec)?;
        if let ResourceSpec::Service(service) = spec {
            let stabilize = state.stabilize_after;
            state.services.insert(
                name.to_string(),
                ServiceStatus {
                    desired: service.replicas,
                    image: format!("{}:{}", service.repository, service.image_tag),
                    pending_polls: stabilize,
                },
            );
        }

        debug!("memory: created {} ({})", name, record.provider_id);
        state.records.insert(name.to_string(), record.clone());
        state.mutations += 1;
        Ok(record)
    }

    async fn create_credential(
        &self,
        app: &str,
        name: &str,
        spec: &CredentialSpec,
    ) -> Result<(ResourceRecord, CredentialPair), OrchestratorError> {
        let record = self
            .create(app, name, &ResourceSpec::Credential(spec.clone()))
            .await?;

        let key_material = sha256_digest(generate_uuid().as_bytes());
        let secret_material =
            sha256_digest(format!("{}{}", generate_uuid(), generate_uuid()).as_bytes());
        let pair = CredentialPair {
            access_key_id: format!(
                "RISE{}",
                crate::utils::sha256_hash(&key_material)[..16].to_uppercase()
            ),
            secret: SecretString::from(
                base64::engine::general_purpose::STANDARD.encode(secret_material),
            ),
        };
        Ok((record, pair))
    }

    async fn update(
        &self,
        record: &ResourceRecord,
        spec: &ResourceSpec,
        changed: &[String],
    ) -> Result<ResourceRecord, OrchestratorError> {
        let mut state = self.state.write().await;
        Self::take_fault(&mut state, &record.name)?;

        let existing = state.records.get(&record.name).cloned().ok_or_else(|| {
            OrchestratorError::NotFound(format!("resource {} not found", record.name))
        })?;

        let mut updated = Self::build_record(&existing.app, &existing.name, spec)?;
        updated.provider_id = existing.provider_id.clone();

        if let ResourceSpec::Service(service) = spec {
            let stabilize = state.stabilize_after;
            if let Some(status) = state.services.get_mut(&existing.name) {
                status.desired = service.replicas;
                status.pending_polls = stabilize;
            }
        }

        debug!("memory: updated {} ({:?})", record.name, changed);
        state.records.insert(existing.name.clone(), updated.clone());
        state.mutations += 1;
        Ok(updated)
    }

    async fn delete(&self, record: &ResourceRecord) -> Result<(), OrchestratorError> {
        let mut state = self.state.write().await;
        Self::take_fault(&mut state, &record.name)?;

        state.records.remove(&record.name).ok_or_else(|| {
            OrchestratorError::NotFound(format!("resource {} not found", record.name))
        })?;
        if record.kind == ResourceKind::Service {
            state.services.remove(&record.name);
        }

        debug!("memory: deleted {}", record.name);
        state.mutations += 1;
        Ok(())
    }

    async fn list_app_resources(
        &self,
        app: &str,
    ) -> Result<Vec<ResourceRecord>, OrchestratorError> {
        let state = self.state.read().await;
        let mut records: Vec<ResourceRecord> =
            state.records.values().filter(|r| r.app == app).cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn service_health(
        &self,
        _cluster: &str,
        service: &str,
    ) -> Result<ServiceHealth, OrchestratorError> {
        let mut state = self.state.write().await;
        let status = state.services.get_mut(service).ok_or_else(|| {
            OrchestratorError::NotFound(format!("service {} not found", service))
        })?;

        if status.pending_polls > 0 {
            status.pending_polls -= 1;
            return Ok(ServiceHealth {
                desired: status.desired,
                running: status.desired,
                healthy: status.desired.saturating_sub(1),
                image: status.image.clone(),
            });
        }

        Ok(ServiceHealth {
            desired: status.desired,
            running: status.desired,
            healthy: status.desired,
            image: status.image.clone(),
        })
    }

    async fn set_service_image(
        &self,
        _cluster: &str,
        service: &str,
        image: &str,
    ) -> Result<(), OrchestratorError> {
        let mut state = self.state.write().await;
        Self::take_fault(&mut state, service)?;

        let stabilize = state.stabilize_after;
        let status = state.services.get_mut(service).ok_or_else(|| {
            OrchestratorError::NotFound(format!("service {} not found", service))
        })?;
        status.image = image.to_string();
        status.pending_polls = stabilize;

        let tag = image.rsplit(':').next().unwrap_or("latest").to_string();
        if let Some(record) = state.records.get_mut(service) {
            if let Some(map) = record.attributes.as_object_mut() {
                map.insert("image_tag".to_string(), tag.into());
            }
        }

        debug!("memory: service {} now runs {}", service, image);
        state.mutations += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::compute::ClusterSpec;

    fn cluster_resource(name: &str) -> DesiredResource {
        DesiredResource::new(
            name,
            ResourceSpec::Cluster(ClusterSpec { name: name.to_string() }),
        )
    }

    #[tokio::test]
    async fn test_create_describe_delete_cycle() {
        let provider = MemoryProvider::new();
        let desired = cluster_resource("app-cluster");

        assert!(provider.describe("app", &desired).await.unwrap().is_none());

        let record = provider
            .create("app", "app-cluster", &desired.spec)
            .await
            .unwrap();
        assert_eq!(record.kind, ResourceKind::Cluster);
        assert!(record.provider_id.starts_with("mem-cluster-"));

        let found = provider.describe("app", &desired).await.unwrap().unwrap();
        assert_eq!(found.provider_id, record.provider_id);

        provider.delete(&record).await.unwrap();
        assert!(provider.describe("app", &desired).await.unwrap().is_none());
        assert_eq!(provider.mutation_count().await, 2);
    }

    #[tokio::test]
    async fn test_duplicate_create_is_a_conflict() {
        let provider = MemoryProvider::new();
        let desired = cluster_resource("app-cluster");

        provider.create("app", "app-cluster", &desired.spec).await.unwrap();
        let err = provider
            .create("app", "app-cluster", &desired.spec)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ConflictError { .. }));
    }

    #[tokio::test]
    async fn test_injected_faults_then_recovery() {
        let provider = MemoryProvider::new();
        let desired = cluster_resource("app-cluster");

        provider.fail_next(1, true).await;
        let err = provider
            .create("app", "app-cluster", &desired.spec)
            .await
            .unwrap_err();
        assert!(err.is_transient());

        provider.create("app", "app-cluster", &desired.spec).await.unwrap();
        assert_eq!(provider.mutation_count().await, 1);
    }

    #[tokio::test]
    async fn test_rollout_stabilizes_after_configured_polls() {
        let provider = MemoryProvider::new();
        provider.set_stabilize_after(2).await;

        let spec = ResourceSpec::Service(crate::models::compute::ServiceSpec {
            cluster: "mem-cluster-1".to_string(),
            repository: "registry.local/app".to_string(),
            image_tag: "latest".to_string(),
            container_port: 3000,
            replicas: 1,
            cpu: 256,
            memory: 512,
            execution_role: "mem-role-1".to_string(),
            log_group: "mem-logs-1".to_string(),
            subnets: vec!["mem-subnet-1".to_string()],
            security_group: "mem-sg-1".to_string(),
            target_group: "mem-tg-1".to_string(),
            assign_public_ip: true,
        });
        provider.create("app", "app-service", &spec).await.unwrap();

        let first = provider.service_health("app-cluster", "app-service").await.unwrap();
        assert!(!first.is_stable());
        let second = provider.service_health("app-cluster", "app-service").await.unwrap();
        assert!(!second.is_stable());
        let third = provider.service_health("app-cluster", "app-service").await.unwrap();
        assert!(third.is_stable());

        provider
            .set_service_image("app-cluster", "app-service", "registry.local/app:a1b2c3d")
            .await
            .unwrap();
        let rolling = provider.service_health("app-cluster", "app-service").await.unwrap();
        assert_eq!(rolling.image, "registry.local/app:a1b2c3d");
        assert!(!rolling.is_stable());
    }
}
