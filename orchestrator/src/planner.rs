//! Desired-state planner: expands the spec into a resource graph and
//! diffs desired attributes against live provider records.
//!
//! Pure logic; the engine drives provider I/O.

use std::collections::BTreeMap;

use colored::Colorize;
use serde_json::Value;

use crate::config::{CicdProvider, Settings};
use crate::errors::OrchestratorError;
use crate::graph::ResourceGraph;
use crate::models::balancer::{ListenerSpec, LoadBalancerSpec, TargetGroupSpec, LISTENER_PORT};
use crate::models::cicd::{
    default_build_commands, repository_full_id, BuildProjectSpec, CredentialSpec,
    PermissionSetSpec, PipelineSpec, SourceConnectionSpec,
};
use crate::models::compute::{ClusterSpec, LogGroupSpec, RepositorySpec, RoleSpec, ServiceSpec};
use crate::models::network::{
    GatewaySpec, IngressRule, RouteTableSpec, RuleSource, SecurityGroupSpec, SubnetSpec, VpcSpec,
};
use crate::models::resource::{
    reference, reference_attr, DesiredResource, ResourceKind, ResourceRecord, ResourceSpec,
};

/// Logical (and physical) name of the app's service
pub fn service_name(app: &str) -> String {
    format!("{}-service", app)
}

/// Logical (and physical) name of the app's cluster
pub fn cluster_name(app: &str) -> String {
    format!("{}-cluster", app)
}

/// Logical name of the app's image repository
pub fn repository_name(app: &str) -> String {
    format!("{}-repository", app)
}

/// Expand the spec into the desired resource graph.
pub fn desired_graph(settings: &Settings) -> Result<ResourceGraph, OrchestratorError> {
    let app = &settings.app;
    let mut resources = Vec::new();

    // Network layer
    let vpc = format!("{}-vpc", app);
    resources.push(DesiredResource::new(
        &vpc,
        ResourceSpec::Vpc(VpcSpec { cidr: settings.network.cidr.clone(), dns_hostnames: true }),
    ));

    let mut subnets = Vec::new();
    for subnet in &settings.network.subnets {
        let zone = subnet.full_zone(&settings.region);
        let key = zone.strip_prefix(settings.region.as_str()).unwrap_or(zone.as_str());
        let name = format!("{}-subnet-{}", app, key);
        resources.push(DesiredResource::new(
            &name,
            ResourceSpec::Subnet(SubnetSpec {
                vpc: reference(&vpc),
                zone: zone.clone(),
                cidr: subnet.cidr.clone(),
                public: subnet.public,
            }),
        ));
        subnets.push(name);
    }

    let gateway = format!("{}-gateway", app);
    resources.push(DesiredResource::new(
        &gateway,
        ResourceSpec::InternetGateway(GatewaySpec { vpc: reference(&vpc) }),
    ));

    resources.push(DesiredResource::new(
        format!("{}-routes", app),
        ResourceSpec::RouteTable(RouteTableSpec {
            vpc: reference(&vpc),
            gateway: reference(&gateway),
            subnets: subnets.iter().map(|s| reference(s)).collect(),
        }),
    ));

    let lb_sg = format!("{}-lb-sg", app);
    resources.push(DesiredResource::new(
        &lb_sg,
        ResourceSpec::SecurityGroup(SecurityGroupSpec {
            vpc: reference(&vpc),
            description: "Load balancer ingress".to_string(),
            ingress: vec![IngressRule {
                protocol: "tcp".to_string(),
                port: LISTENER_PORT,
                source: RuleSource::Cidr("0.0.0.0/0".to_string()),
            }],
        }),
    ));

    let service_sg = format!("{}-service-sg", app);
    resources.push(DesiredResource::new(
        &service_sg,
        ResourceSpec::SecurityGroup(SecurityGroupSpec {
            vpc: reference(&vpc),
            description: "Service ingress from the load balancer".to_string(),
            ingress: vec![IngressRule {
                protocol: "tcp".to_string(),
                port: settings.container_port,
                source: RuleSource::Group(reference(&lb_sg)),
            }],
        }),
    ));

    // Registry, logs, execution role, cluster
    let repository = repository_name(app);
    resources.push(DesiredResource::new(
        &repository,
        ResourceSpec::Repository(RepositorySpec { name: app.clone(), scan_on_push: true }),
    ));

    let logs = format!("{}-logs", app);
    resources.push(DesiredResource::new(
        &logs,
        ResourceSpec::LogGroup(LogGroupSpec { name: format!("/ecs/{}", app), retention_days: 30 }),
    ));

    let role = format!("{}-execution-role", app);
    resources.push(DesiredResource::new(
        &role,
        ResourceSpec::Role(RoleSpec {
            name: role.clone(),
            assume_service: "ecs-tasks".to_string(),
            policies: vec!["service-role/AmazonECSTaskExecutionRolePolicy".to_string()],
        }),
    ));

    let cluster = cluster_name(app);
    resources.push(DesiredResource::new(
        &cluster,
        ResourceSpec::Cluster(ClusterSpec { name: cluster.clone() }),
    ));

    // Load-balancing layer
    let target_group = format!("{}-tg", app);
    resources.push(DesiredResource::new(
        &target_group,
        ResourceSpec::TargetGroup(TargetGroupSpec {
            name: target_group.clone(),
            vpc: reference(&vpc),
            port: settings.container_port,
            health_check: settings.health_check.clone(),
        }),
    ));

    let lb = format!("{}-lb", app);
    resources.push(DesiredResource::new(
        &lb,
        ResourceSpec::LoadBalancer(LoadBalancerSpec {
            name: lb.clone(),
            subnets: subnets.iter().map(|s| reference(s)).collect(),
            security_group: reference(&lb_sg),
        }),
    ));

    let listener = format!("{}-listener", app);
    resources.push(DesiredResource::new(
        &listener,
        ResourceSpec::Listener(ListenerSpec {
            load_balancer: reference(&lb),
            port: LISTENER_PORT,
            target_group: reference(&target_group),
        }),
    ));

    // Service. The listener must exist before tasks can register, which the
    // spec references alone do not capture.
    let service = service_name(app);
    resources.push(
        DesiredResource::new(
            &service,
            ResourceSpec::Service(ServiceSpec {
                cluster: reference(&cluster),
                repository: reference_attr(&repository, "uri"),
                image_tag: "latest".to_string(),
                container_port: settings.container_port,
                replicas: settings.replicas,
                cpu: settings.cpu,
                memory: settings.memory,
                execution_role: reference(&role),
                log_group: reference(&logs),
                subnets: subnets.iter().map(|s| reference(s)).collect(),
                security_group: reference(&service_sg),
                target_group: reference(&target_group),
                assign_public_ip: true,
            }),
        )
        .with_dependency(&listener),
    );

    // CI/CD wiring
    match settings.cicd.provider {
        CicdProvider::Pipeline => {
            let connection = format!("{}-connection", app);
            resources.push(DesiredResource::new(
                &connection,
                ResourceSpec::SourceConnection(SourceConnectionSpec {
                    name: connection.clone(),
                    provider_type: "github".to_string(),
                }),
            ));

            let build = format!("{}-build", app);
            resources.push(DesiredResource::new(
                &build,
                ResourceSpec::BuildProject(BuildProjectSpec {
                    name: build.clone(),
                    build_commands: default_build_commands(),
                    privileged: true,
                    environment: BTreeMap::from([
                        ("RISECTL_APP".to_string(), app.clone()),
                        ("RISECTL_REGION".to_string(), settings.region.clone()),
                        ("RISECTL_REPOSITORY".to_string(), app.clone()),
                        (
                            "RISECTL_REGISTRY_URI".to_string(),
                            reference_attr(&repository, "uri"),
                        ),
                    ]),
                }),
            ));

            resources.push(
                DesiredResource::new(
                    format!("{}-pipeline", app),
                    ResourceSpec::Pipeline(PipelineSpec {
                        name: format!("{}-pipeline", app),
                        connection: reference(&connection),
                        repository_id: repository_full_id(&settings.cicd.repository)?,
                        branch: settings.cicd.branch.clone(),
                        build_project: reference(&build),
                        cluster: cluster.clone(),
                        service: service.clone(),
                        manifest_file: crate::models::artifact::MANIFEST_FILE.to_string(),
                    }),
                )
                .with_dependency(&service),
            );
        }
        CicdProvider::External => {
            resources.push(DesiredResource::new(
                format!("{}-deployer", app),
                ResourceSpec::Credential(CredentialSpec {
                    principal: format!("{}-deployer", app),
                    permission_sets: vec![
                        PermissionSetSpec::registry_push_pull(&reference(&repository)),
                        PermissionSetSpec::service_update_describe(&reference(&service)),
                        PermissionSetSpec::execution_role_assumption(&reference(&role)),
                    ],
                }),
            ));
        }
    }

    ResourceGraph::new(resources)
}

/// Per-resource action the diff decided
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedAction {
    /// Missing, will be created
    Create,

    /// Mutable fields diverged, updated in place
    Update { fields: Vec<String> },

    /// Immutable fields diverged, requires manual reconciliation
    Conflict { fields: Vec<String> },

    /// Live state matches
    Noop,
}

/// One resource's planned change
#[derive(Debug, Clone)]
pub struct PlannedChange {
    pub name: String,
    pub kind: ResourceKind,
    pub action: PlannedAction,
}

/// The full diff for a spec
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Desired resources, in level order
    pub changes: Vec<PlannedChange>,

    /// Live app-tagged resources no longer in the spec, removed on apply
    pub orphans: Vec<ResourceRecord>,
}

impl Plan {
    pub fn creates(&self) -> usize {
        self.count(|a| matches!(a, PlannedAction::Create))
    }

    pub fn updates(&self) -> usize {
        self.count(|a| matches!(a, PlannedAction::Update { .. }))
    }

    pub fn conflicts(&self) -> usize {
        self.count(|a| matches!(a, PlannedAction::Conflict { .. }))
    }

    pub fn unchanged(&self) -> usize {
        self.count(|a| matches!(a, PlannedAction::Noop))
    }

    fn count(&self, pred: impl Fn(&PlannedAction) -> bool) -> usize {
        self.changes.iter().filter(|c| pred(&c.action)).count()
    }

    pub fn has_changes(&self) -> bool {
        self.creates() + self.updates() + self.conflicts() + self.orphans.len() > 0
    }

    /// Render the diff for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();

        for change in &self.changes {
            let line = match &change.action {
                PlannedAction::Create => {
                    format!("{} {}/{}", "+ create".green(), change.kind, change.name)
                }
                PlannedAction::Update { fields } => format!(
                    "{} {}/{} ({})",
                    "~ update".yellow(),
                    change.kind,
                    change.name,
                    fields.join(", ")
                ),
                PlannedAction::Conflict { fields } => format!(
                    "{} {}/{} ({})",
                    "! conflict".red(),
                    change.kind,
                    change.name,
                    fields.join(", ")
                ),
                PlannedAction::Noop => continue,
            };
            out.push_str(&line);
            out.push('\n');
        }

        for orphan in &self.orphans {
            out.push_str(&format!(
                "{} {}/{} (no longer in spec)\n",
                "- remove".red(),
                orphan.kind,
                orphan.name
            ));
        }

        out.push_str(&format!(
            "\nPlan: {} to create, {} to update, {} to remove, {} conflicts, {} unchanged.\n",
            self.creates(),
            self.updates(),
            self.orphans.len(),
            self.conflicts(),
            self.unchanged()
        ));
        out
    }
}

/// Diff resolved desired attributes against a live record's attributes.
pub fn diff_resource(kind: ResourceKind, desired: &Value, live: &Value) -> PlannedAction {
    let empty = serde_json::Map::new();
    let desired_map = desired.as_object().unwrap_or(&empty);
    let live_map = live.as_object().unwrap_or(&empty);

    let mut changed = Vec::new();
    let mut keys: Vec<&String> = desired_map.keys().chain(live_map.keys()).collect();
    keys.sort();
    keys.dedup();

    for key in keys {
        if kind.ignored_fields().contains(&key.as_str()) {
            continue;
        }
        if desired_map.get(key) != live_map.get(key) {
            changed.push(key.clone());
        }
    }

    if changed.is_empty() {
        return PlannedAction::Noop;
    }

    // The kind tag never changes in place either.
    let conflicting: Vec<String> = changed
        .iter()
        .filter(|f| kind.immutable_fields().contains(&f.as_str()) || f.as_str() == "kind")
        .cloned()
        .collect();

    if !conflicting.is_empty() {
        PlannedAction::Conflict { fields: conflicting }
    } else {
        PlannedAction::Update { fields: changed }
    }
}

/// Teardown ordering rank; orphans are deleted in descending rank so
/// dependents go before their dependencies.
pub fn kind_rank(kind: ResourceKind) -> u8 {
    match kind {
        ResourceKind::Vpc
        | ResourceKind::Repository
        | ResourceKind::LogGroup
        | ResourceKind::Role
        | ResourceKind::Cluster
        | ResourceKind::SourceConnection => 0,
        ResourceKind::Subnet
        | ResourceKind::InternetGateway
        | ResourceKind::SecurityGroup
        | ResourceKind::TargetGroup
        | ResourceKind::BuildProject => 1,
        ResourceKind::RouteTable | ResourceKind::LoadBalancer => 2,
        ResourceKind::Listener => 3,
        ResourceKind::Service => 4,
        ResourceKind::Pipeline | ResourceKind::Credential => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(cicd: CicdProvider) -> Settings {
        let provider = match cicd {
            CicdProvider::Pipeline => "pipeline",
            CicdProvider::External => "external",
        };
        let raw = format!(
            r#"{{
                "app": "rise-app",
                "cicd": {{
                    "provider": "{}",
                    "repository": "https://github.com/rise/rise-app"
                }}
            }}"#,
            provider
        );
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn test_pipeline_graph_contents() {
        let graph = desired_graph(&settings(CicdProvider::Pipeline)).unwrap();

        for name in [
            "rise-app-vpc",
            "rise-app-subnet-a",
            "rise-app-subnet-b",
            "rise-app-gateway",
            "rise-app-routes",
            "rise-app-lb-sg",
            "rise-app-service-sg",
            "rise-app-repository",
            "rise-app-logs",
            "rise-app-execution-role",
            "rise-app-cluster",
            "rise-app-tg",
            "rise-app-lb",
            "rise-app-listener",
            "rise-app-service",
            "rise-app-connection",
            "rise-app-build",
            "rise-app-pipeline",
        ] {
            assert!(graph.get(name).is_some(), "missing resource {}", name);
        }
        assert_eq!(graph.len(), 18);
        assert!(graph.get("rise-app-deployer").is_none());
    }

    #[test]
    fn test_external_graph_has_credential_and_no_pipeline_resources() {
        let graph = desired_graph(&settings(CicdProvider::External)).unwrap();

        let credential = graph.get("rise-app-deployer").unwrap();
        let ResourceSpec::Credential(spec) = &credential.spec else {
            panic!("expected credential spec");
        };
        assert_eq!(spec.permission_sets.len(), 3);
        let names: Vec<&str> = spec.permission_sets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["registry-push-pull", "service-update-describe", "execution-role-assumption"]
        );

        assert!(graph.get("rise-app-pipeline").is_none());
        assert!(graph.get("rise-app-build").is_none());
        assert!(graph.get("rise-app-connection").is_none());
    }

    #[test]
    fn test_levels_put_network_before_service() {
        let graph = desired_graph(&settings(CicdProvider::Pipeline)).unwrap();
        let levels = graph.levels().unwrap();

        let level_of = |name: &str| {
            levels
                .iter()
                .position(|level| level.iter().any(|n| n == name))
                .unwrap_or_else(|| panic!("{} not in any level", name))
        };

        assert!(level_of("rise-app-vpc") < level_of("rise-app-subnet-a"));
        assert!(level_of("rise-app-subnet-a") < level_of("rise-app-lb"));
        assert!(level_of("rise-app-lb") < level_of("rise-app-listener"));
        assert!(level_of("rise-app-listener") < level_of("rise-app-service"));
        assert!(level_of("rise-app-service") < level_of("rise-app-pipeline"));
    }

    #[test]
    fn test_diff_noop_for_equal_attributes() {
        let value = json!({"kind": "cluster", "name": "rise-app-cluster"});
        assert_eq!(diff_resource(ResourceKind::Cluster, &value, &value), PlannedAction::Noop);
    }

    #[test]
    fn test_diff_update_for_mutable_field() {
        let desired = json!({"kind": "service", "cluster": "c1", "replicas": 3});
        let live = json!({"kind": "service", "cluster": "c1", "replicas": 1});
        assert_eq!(
            diff_resource(ResourceKind::Service, &desired, &live),
            PlannedAction::Update { fields: vec!["replicas".to_string()] }
        );
    }

    #[test]
    fn test_diff_conflict_for_immutable_field() {
        let desired = json!({"kind": "vpc", "cidr": "10.1.0.0/16", "dns_hostnames": true});
        let live = json!({"kind": "vpc", "cidr": "10.0.0.0/16", "dns_hostnames": true});
        assert_eq!(
            diff_resource(ResourceKind::Vpc, &desired, &live),
            PlannedAction::Conflict { fields: vec!["cidr".to_string()] }
        );
    }

    #[test]
    fn test_diff_ignores_deployment_managed_tag() {
        let desired = json!({"kind": "service", "cluster": "c1", "image_tag": "latest"});
        let live = json!({"kind": "service", "cluster": "c1", "image_tag": "a1b2c3d"});
        assert_eq!(diff_resource(ResourceKind::Service, &desired, &live), PlannedAction::Noop);
    }

    #[test]
    fn test_plan_render_and_counts() {
        colored::control::set_override(false);

        let plan = Plan {
            changes: vec![
                PlannedChange {
                    name: "rise-app-vpc".to_string(),
                    kind: ResourceKind::Vpc,
                    action: PlannedAction::Create,
                },
                PlannedChange {
                    name: "rise-app-service".to_string(),
                    kind: ResourceKind::Service,
                    action: PlannedAction::Update { fields: vec!["replicas".to_string()] },
                },
                PlannedChange {
                    name: "rise-app-cluster".to_string(),
                    kind: ResourceKind::Cluster,
                    action: PlannedAction::Noop,
                },
            ],
            orphans: Vec::new(),
        };

        assert_eq!(plan.creates(), 1);
        assert_eq!(plan.updates(), 1);
        assert_eq!(plan.unchanged(), 1);
        assert!(plan.has_changes());

        let rendered = plan.render();
        assert!(rendered.contains("+ create vpc/rise-app-vpc"));
        assert!(rendered.contains("~ update service/rise-app-service (replicas)"));
        assert!(rendered.contains("1 to create, 1 to update, 0 to remove, 0 conflicts, 1 unchanged"));
        assert!(!rendered.contains("rise-app-cluster"));
    }
}
