//! Convergence engine
//!
//! Walks the desired resource graph level by level, reading live state
//! before every write. Resources inside a level are applied in parallel
//! up to the configured concurrency; transient provider failures retry
//! with exponential backoff; every call is bounded by a timeout.
//!
//! Interrupting an apply stops between resources and rolls nothing
//! back. Whatever converged stays converged, and the next run picks up
//! where this one stopped.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::errors::OrchestratorError;
use crate::graph::ResourceGraph;
use crate::models::resource::{
    resolve_references, DesiredResource, ResourceRecord, ResourceSpec, PENDING_ID,
};
use crate::planner::{diff_resource, kind_rank, Plan, PlannedAction, PlannedChange};
use crate::provider::{CloudProvider, CredentialPair};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Future that resolves when the operator asks to stop.
pub type Shutdown = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Retry policy for transient provider failures
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub cooldown: CooldownOptions,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            cooldown: CooldownOptions {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
            },
        }
    }
}

/// What one converged apply run did
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Live records by logical name after convergence
    pub records: HashMap<String, ResourceRecord>,

    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,

    /// Orphans removed after convergence
    pub removed: Vec<String>,

    /// Key pair minted for a credential principal created this run.
    /// Present exactly once, at creation; it cannot be read back later.
    pub credentials: Option<CredentialPair>,
}

/// What one destroy run did
#[derive(Debug, Default)]
pub struct DestroyOutcome {
    pub removed: Vec<String>,

    /// Resources the spec names that were already gone
    pub skipped: Vec<String>,
}

enum AppliedAction {
    Created,
    Updated { fields: Vec<String> },
    Unchanged,
}

struct Applied {
    name: String,
    record: ResourceRecord,
    action: AppliedAction,
    credentials: Option<CredentialPair>,
}

/// The convergence engine
pub struct Engine {
    provider: Arc<dyn CloudProvider>,
    settings: Settings,
    retry: RetryOptions,
}

impl Engine {
    pub fn new(provider: Arc<dyn CloudProvider>, settings: Settings) -> Self {
        Self { provider, settings, retry: RetryOptions::default() }
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn provider(&self) -> &Arc<dyn CloudProvider> {
        &self.provider
    }

    /// Point the service at a new image, with the usual retry bounds.
    pub async fn set_service_image(
        &self,
        cluster: &str,
        service: &str,
        image: &str,
    ) -> Result<(), OrchestratorError> {
        self.call(service, || self.provider.set_service_image(cluster, service, image)).await
    }

    /// Read current rollout state of the service.
    pub async fn service_health(
        &self,
        cluster: &str,
        service: &str,
    ) -> Result<crate::models::compute::ServiceHealth, OrchestratorError> {
        self.call(service, || self.provider.service_health(cluster, service)).await
    }

    /// Run one provider call with a timeout, retrying transient failures
    /// with exponential backoff. A timed-out call counts as transient.
    async fn call<T, F, Fut>(&self, resource: &str, mut op: F) -> Result<T, OrchestratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>>,
    {
        let limit = Duration::from_secs(self.settings.timeouts.provider_call_secs);
        let mut attempt = 0;

        loop {
            let result = match timeout(limit, op()).await {
                Ok(result) => result,
                Err(_) => Err(OrchestratorError::transient(
                    resource,
                    format!("call exceeded {}s", limit.as_secs()),
                )),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    let delay = calc_exp_backoff(&self.retry.cooldown, attempt);
                    attempt += 1;
                    warn!(
                        "transient failure on {} (attempt {}/{}), retrying in {:?}: {}",
                        resource, attempt, self.retry.max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resolve every reference in a node's spec against applied records
    /// and re-type the result.
    fn resolve_spec(
        &self,
        node: &DesiredResource,
        records: &HashMap<String, ResourceRecord>,
    ) -> Result<(ResourceSpec, Value), OrchestratorError> {
        let mut attributes = node.spec.attributes()?;
        resolve_references(&mut attributes, records)?;
        let spec: ResourceSpec = serde_json::from_value(attributes.clone())?;
        Ok((spec, attributes))
    }

    /// Converge one resource: read live state, then create, update, or
    /// leave it alone.
    async fn apply_one(
        &self,
        node: &DesiredResource,
        records: &HashMap<String, ResourceRecord>,
    ) -> Result<Applied, OrchestratorError> {
        let app = &self.settings.app;
        let name = &node.name;

        let live = self.call(name, || self.provider.describe(app, node)).await?;
        let (resolved, desired_attrs) = self.resolve_spec(node, records)?;

        let Some(live) = live else {
            if let ResourceSpec::Credential(spec) = &resolved {
                let (record, pair) =
                    self.call(name, || self.provider.create_credential(app, name, spec)).await?;
                info!("created {} '{}'", record.kind, name);
                return Ok(Applied {
                    name: name.clone(),
                    record,
                    action: AppliedAction::Created,
                    credentials: Some(pair),
                });
            }

            let record = self.call(name, || self.provider.create(app, name, &resolved)).await?;
            info!("created {} '{}'", record.kind, name);
            return Ok(Applied {
                name: name.clone(),
                record,
                action: AppliedAction::Created,
                credentials: None,
            });
        };

        if live.kind != node.kind() {
            return Err(OrchestratorError::ConflictError {
                resource: name.clone(),
                detail: format!(
                    "live resource is a {} but a {} is desired",
                    live.kind,
                    node.kind()
                ),
            });
        }

        match diff_resource(node.kind(), &desired_attrs, &live.attributes) {
            PlannedAction::Noop => {
                debug!("{} '{}' unchanged", live.kind, name);
                Ok(Applied {
                    name: name.clone(),
                    record: live,
                    action: AppliedAction::Unchanged,
                    credentials: None,
                })
            }
            PlannedAction::Update { fields } => {
                let record = self
                    .call(name, || self.provider.update(&live, &resolved, &fields))
                    .await?;
                info!("updated {} '{}' ({})", record.kind, name, fields.join(", "));
                Ok(Applied {
                    name: name.clone(),
                    record,
                    action: AppliedAction::Updated { fields },
                    credentials: None,
                })
            }
            PlannedAction::Conflict { fields } => Err(OrchestratorError::ConflictError {
                resource: name.clone(),
                detail: format!("immutable fields diverged: {}", fields.join(", ")),
            }),
            // diff_resource never returns Create
            PlannedAction::Create => Err(OrchestratorError::Internal(format!(
                "unexpected create decision for existing '{}'",
                name
            ))),
        }
    }

    /// Apply one level's resources, bounded by the configured concurrency.
    async fn apply_level(
        &self,
        graph: &ResourceGraph,
        level: &[String],
        records: &HashMap<String, ResourceRecord>,
    ) -> Result<Vec<Applied>, OrchestratorError> {
        let mut jobs = Vec::with_capacity(level.len());
        for name in level {
            let node = graph.get(name).ok_or_else(|| {
                OrchestratorError::Internal(format!("level names unknown resource '{}'", name))
            })?;
            jobs.push(self.apply_one(node, records));
        }

        stream::iter(jobs)
            .buffer_unordered(self.settings.concurrency)
            .try_collect()
            .await
    }

    /// Converge live state onto the desired graph, then remove orphans.
    pub async fn apply(
        &self,
        graph: &ResourceGraph,
        mut shutdown: Option<Shutdown>,
    ) -> Result<ApplyOutcome, OrchestratorError> {
        let levels = graph.levels()?;
        let mut outcome = ApplyOutcome::default();

        info!(
            "applying {} resources across {} levels (concurrency {})",
            graph.len(),
            levels.len(),
            self.settings.concurrency
        );

        for level in &levels {
            let work = self.apply_level(graph, level, &outcome.records);
            // Biased so a delivered signal always wins over starting
            // the next level.
            let applied = match shutdown.as_mut() {
                Some(stop) => tokio::select! {
                    biased;
                    _ = stop.as_mut() => {
                        return Err(OrchestratorError::Cancelled(
                            "apply interrupted; converged resources were kept".to_string(),
                        ));
                    }
                    result = work => result?,
                },
                None => work.await?,
            };

            let mut by_name: HashMap<String, Applied> =
                applied.into_iter().map(|a| (a.name.clone(), a)).collect();
            for name in level {
                let Some(applied) = by_name.remove(name) else {
                    continue;
                };
                match applied.action {
                    AppliedAction::Created => outcome.created.push(name.clone()),
                    AppliedAction::Updated { .. } => outcome.updated.push(name.clone()),
                    AppliedAction::Unchanged => outcome.unchanged.push(name.clone()),
                }
                if applied.credentials.is_some() {
                    outcome.credentials = applied.credentials;
                }
                outcome.records.insert(name.clone(), applied.record);
            }
        }

        outcome.removed = self.remove_orphans(graph).await?;

        info!(
            "apply converged: {} created, {} updated, {} unchanged, {} removed",
            outcome.created.len(),
            outcome.updated.len(),
            outcome.unchanged.len(),
            outcome.removed.len()
        );
        Ok(outcome)
    }

    /// Delete live app-tagged resources the graph no longer names,
    /// dependents before their dependencies.
    async fn remove_orphans(
        &self,
        graph: &ResourceGraph,
    ) -> Result<Vec<String>, OrchestratorError> {
        let app = &self.settings.app;
        let mut orphans: Vec<ResourceRecord> = self
            .call("tagging", || self.provider.list_app_resources(app))
            .await?
            .into_iter()
            .filter(|record| graph.get(&record.name).is_none())
            .collect();
        orphans.sort_by(|a, b| {
            kind_rank(b.kind).cmp(&kind_rank(a.kind)).then_with(|| a.name.cmp(&b.name))
        });

        let mut removed = Vec::new();
        for orphan in &orphans {
            self.call(&orphan.name, || self.provider.delete(orphan)).await?;
            info!("removed {} '{}' (no longer in spec)", orphan.kind, orphan.name);
            removed.push(orphan.name.clone());
        }
        Ok(removed)
    }

    /// Diff live state against the desired graph without writing anything.
    pub async fn plan(&self, graph: &ResourceGraph) -> Result<Plan, OrchestratorError> {
        let app = &self.settings.app;
        let mut plan = Plan::default();
        let mut records: HashMap<String, ResourceRecord> = HashMap::new();

        for level in graph.levels()? {
            for name in &level {
                let node = graph.get(name).ok_or_else(|| {
                    OrchestratorError::Internal(format!("level names unknown resource '{}'", name))
                })?;

                let live = self.call(name, || self.provider.describe(app, node)).await?;
                let action = match live {
                    None => {
                        // Dependents resolve against this placeholder and
                        // stay pending themselves.
                        records.insert(
                            name.clone(),
                            ResourceRecord {
                                name: name.clone(),
                                kind: node.kind(),
                                provider_id: PENDING_ID.to_string(),
                                app: app.clone(),
                                attributes: Value::Null,
                            },
                        );
                        PlannedAction::Create
                    }
                    Some(live) if live.kind != node.kind() => {
                        records.insert(name.clone(), live);
                        PlannedAction::Conflict { fields: vec!["kind".to_string()] }
                    }
                    Some(live) => {
                        let (_, desired_attrs) = self.resolve_spec(node, &records)?;
                        let action = diff_resource(node.kind(), &desired_attrs, &live.attributes);
                        records.insert(name.clone(), live);
                        action
                    }
                };

                plan.changes.push(PlannedChange { name: name.clone(), kind: node.kind(), action });
            }
        }

        plan.orphans = self
            .call("tagging", || self.provider.list_app_resources(app))
            .await?
            .into_iter()
            .filter(|record| graph.get(&record.name).is_none())
            .collect();
        plan.orphans.sort_by(|a, b| {
            kind_rank(b.kind).cmp(&kind_rank(a.kind)).then_with(|| a.name.cmp(&b.name))
        });

        Ok(plan)
    }

    /// Tear down everything the graph names, in reverse dependency order,
    /// then sweep any app-tagged stragglers.
    pub async fn destroy(
        &self,
        graph: &ResourceGraph,
        mut shutdown: Option<Shutdown>,
    ) -> Result<DestroyOutcome, OrchestratorError> {
        let app = &self.settings.app;
        let mut outcome = DestroyOutcome::default();

        for level in graph.reverse_levels()? {
            for name in &level {
                if let Some(stop) = shutdown.as_mut() {
                    if futures::poll!(stop.as_mut()).is_ready() {
                        return Err(OrchestratorError::Cancelled(
                            "destroy interrupted; remaining resources were kept".to_string(),
                        ));
                    }
                }

                let node = graph.get(name).ok_or_else(|| {
                    OrchestratorError::Internal(format!("level names unknown resource '{}'", name))
                })?;

                match self.call(name, || self.provider.describe(app, node)).await? {
                    Some(live) => {
                        self.call(name, || self.provider.delete(&live)).await?;
                        info!("destroyed {} '{}'", live.kind, name);
                        outcome.removed.push(name.clone());
                    }
                    None => {
                        debug!("{} '{}' already gone", node.kind(), name);
                        outcome.skipped.push(name.clone());
                    }
                }
            }
        }

        // Anything still tagged with the app was renamed out of the spec
        // at some point; sweep it too.
        let mut stragglers =
            self.call("tagging", || self.provider.list_app_resources(app)).await?;
        stragglers.sort_by(|a, b| {
            kind_rank(b.kind).cmp(&kind_rank(a.kind)).then_with(|| a.name.cmp(&b.name))
        });
        for record in &stragglers {
            self.call(&record.name, || self.provider.delete(record)).await?;
            info!("destroyed {} '{}' (straggler)", record.kind, record.name);
            outcome.removed.push(record.name.clone());
        }

        info!("destroy complete: {} removed, {} already gone", outcome.removed.len(), outcome.skipped.len());
        Ok(outcome)
    }
}
