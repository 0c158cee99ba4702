//! Resource descriptors: typed specs, graph nodes, live records, and
//! cross-resource references

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::OrchestratorError;
use crate::models::balancer::{ListenerSpec, LoadBalancerSpec, TargetGroupSpec};
use crate::models::cicd::{BuildProjectSpec, CredentialSpec, PipelineSpec, SourceConnectionSpec};
use crate::models::compute::{ClusterSpec, LogGroupSpec, RepositorySpec, RoleSpec, ServiceSpec};
use crate::models::network::{GatewaySpec, RouteTableSpec, SecurityGroupSpec, SubnetSpec, VpcSpec};

/// Kinds of managed resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Vpc,
    Subnet,
    InternetGateway,
    RouteTable,
    SecurityGroup,
    Repository,
    LogGroup,
    Role,
    Cluster,
    Service,
    LoadBalancer,
    TargetGroup,
    Listener,
    SourceConnection,
    BuildProject,
    Pipeline,
    Credential,
}

impl ResourceKind {
    /// Attribute names that cannot change in place. A divergence on one of
    /// these is a conflict requiring manual reconciliation, not an update.
    pub fn immutable_fields(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::Vpc => &["cidr"],
            ResourceKind::Subnet => &["vpc", "zone", "cidr"],
            ResourceKind::InternetGateway => &["vpc"],
            ResourceKind::RouteTable => &["vpc"],
            ResourceKind::SecurityGroup => &["vpc", "description"],
            ResourceKind::Repository => &["name"],
            ResourceKind::LogGroup => &["name"],
            ResourceKind::Role => &["name", "assume_service"],
            ResourceKind::Cluster => &["name"],
            ResourceKind::Service => &["cluster"],
            ResourceKind::LoadBalancer => &["name"],
            ResourceKind::TargetGroup => &["name", "vpc", "port"],
            ResourceKind::Listener => &["load_balancer"],
            ResourceKind::SourceConnection => &["name", "provider_type"],
            ResourceKind::BuildProject => &["name"],
            ResourceKind::Pipeline => &["name"],
            ResourceKind::Credential => &["principal"],
        }
    }

    /// Attribute names excluded from drift comparison.
    ///
    /// The service image tag is deployment-managed: external systems update
    /// it out-of-band and apply must not revert it. Registry URIs and
    /// balancer DNS names only exist on live records.
    pub fn ignored_fields(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::Service => &["image_tag"],
            ResourceKind::Repository => &["uri"],
            ResourceKind::LoadBalancer => &["dns_name"],
            _ => &[],
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Vpc => "vpc",
            ResourceKind::Subnet => "subnet",
            ResourceKind::InternetGateway => "internet_gateway",
            ResourceKind::RouteTable => "route_table",
            ResourceKind::SecurityGroup => "security_group",
            ResourceKind::Repository => "repository",
            ResourceKind::LogGroup => "log_group",
            ResourceKind::Role => "role",
            ResourceKind::Cluster => "cluster",
            ResourceKind::Service => "service",
            ResourceKind::LoadBalancer => "load_balancer",
            ResourceKind::TargetGroup => "target_group",
            ResourceKind::Listener => "listener",
            ResourceKind::SourceConnection => "source_connection",
            ResourceKind::BuildProject => "build_project",
            ResourceKind::Pipeline => "pipeline",
            ResourceKind::Credential => "credential",
        };
        write!(f, "{}", name)
    }
}

/// Typed resource descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceSpec {
    Vpc(VpcSpec),
    Subnet(SubnetSpec),
    InternetGateway(GatewaySpec),
    RouteTable(RouteTableSpec),
    SecurityGroup(SecurityGroupSpec),
    Repository(RepositorySpec),
    LogGroup(LogGroupSpec),
    Role(RoleSpec),
    Cluster(ClusterSpec),
    Service(ServiceSpec),
    LoadBalancer(LoadBalancerSpec),
    TargetGroup(TargetGroupSpec),
    Listener(ListenerSpec),
    SourceConnection(SourceConnectionSpec),
    BuildProject(BuildProjectSpec),
    Pipeline(PipelineSpec),
    Credential(CredentialSpec),
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::Vpc(_) => ResourceKind::Vpc,
            ResourceSpec::Subnet(_) => ResourceKind::Subnet,
            ResourceSpec::InternetGateway(_) => ResourceKind::InternetGateway,
            ResourceSpec::RouteTable(_) => ResourceKind::RouteTable,
            ResourceSpec::SecurityGroup(_) => ResourceKind::SecurityGroup,
            ResourceSpec::Repository(_) => ResourceKind::Repository,
            ResourceSpec::LogGroup(_) => ResourceKind::LogGroup,
            ResourceSpec::Role(_) => ResourceKind::Role,
            ResourceSpec::Cluster(_) => ResourceKind::Cluster,
            ResourceSpec::Service(_) => ResourceKind::Service,
            ResourceSpec::LoadBalancer(_) => ResourceKind::LoadBalancer,
            ResourceSpec::TargetGroup(_) => ResourceKind::TargetGroup,
            ResourceSpec::Listener(_) => ResourceKind::Listener,
            ResourceSpec::SourceConnection(_) => ResourceKind::SourceConnection,
            ResourceSpec::BuildProject(_) => ResourceKind::BuildProject,
            ResourceSpec::Pipeline(_) => ResourceKind::Pipeline,
            ResourceSpec::Credential(_) => ResourceKind::Credential,
        }
    }

    /// Flat attribute object for drift comparison. The tag field is kept:
    /// a kind change under the same logical name is a conflict.
    pub fn attributes(&self) -> Result<Value, OrchestratorError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// A node of the desired resource graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredResource {
    /// Logical name, unique within the graph
    pub name: String,

    /// Typed descriptor
    pub spec: ResourceSpec,

    /// Ordering dependencies beyond those referenced in the spec
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl DesiredResource {
    pub fn new(name: impl Into<String>, spec: ResourceSpec) -> Self {
        Self { name: name.into(), spec, depends_on: Vec::new() }
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.spec.kind()
    }

    /// All dependencies: explicit ones plus every reference in the spec.
    pub fn dependencies(&self) -> Result<Vec<String>, OrchestratorError> {
        let mut deps = self.depends_on.clone();
        deps.extend(extract_references(&self.spec.attributes()?));
        deps.sort();
        deps.dedup();
        Ok(deps)
    }
}

/// A live resource as recorded by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Logical name
    pub name: String,

    /// Resource kind
    pub kind: ResourceKind,

    /// Provider identifier (ARN-equivalent)
    pub provider_id: String,

    /// App the resource is tagged with
    pub app: String,

    /// Live attributes, shaped like [`ResourceSpec::attributes`]
    pub attributes: Value,
}

/// Prefix marking a string value for resolution against applied resources
pub const REF_PREFIX: &str = "ref:";

/// Placeholder identifier for resources a plan has not created yet
pub const PENDING_ID: &str = "(known after apply)";

/// Reference to another resource's provider identifier
pub fn reference(name: &str) -> String {
    format!("{}{}", REF_PREFIX, name)
}

/// Reference to one recorded attribute of another resource
pub fn reference_attr(name: &str, attr: &str) -> String {
    format!("{}{}#{}", REF_PREFIX, name, attr)
}

/// Split a reference string into its logical name and optional attribute.
pub fn parse_reference(value: &str) -> Option<(&str, Option<&str>)> {
    let rest = value.strip_prefix(REF_PREFIX)?;
    match rest.split_once('#') {
        Some((name, attr)) => Some((name, Some(attr))),
        None => Some((rest, None)),
    }
}

/// Collect the logical names referenced anywhere in a JSON value.
pub fn extract_references(value: &Value) -> Vec<String> {
    let mut names = Vec::new();
    collect_references(value, &mut names);
    names.sort();
    names.dedup();
    names
}

fn collect_references(value: &Value, names: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if let Some((name, _)) = parse_reference(s) {
                names.push(name.to_string());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, names);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_references(item, names);
            }
        }
        _ => {}
    }
}

/// Replace every reference in `value` with the provider identifier (or the
/// named attribute) of the corresponding applied resource.
pub fn resolve_references(
    value: &mut Value,
    records: &HashMap<String, ResourceRecord>,
) -> Result<(), OrchestratorError> {
    match value {
        Value::String(s) => {
            let original = s.clone();
            if let Some((name, attr)) = parse_reference(&original) {
                let record = records.get(name).ok_or_else(|| {
                    OrchestratorError::Internal(format!("unresolved reference '{}'", original))
                })?;
                let replacement = match attr {
                    None => record.provider_id.clone(),
                    // Attribute refs into a pending record stay pending;
                    // a real record missing the attribute is a bug.
                    Some(_) if record.provider_id == PENDING_ID => PENDING_ID.to_string(),
                    Some(attr) => record
                        .attributes
                        .get(attr)
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .ok_or_else(|| {
                            OrchestratorError::Internal(format!(
                                "reference '{}' names a missing attribute",
                                original
                            ))
                        })?,
                };
                *s = replacement;
            }
        }
        Value::Array(items) => {
            for item in items {
                resolve_references(item, records)?;
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                resolve_references(item, records)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, provider_id: &str) -> ResourceRecord {
        ResourceRecord {
            name: name.to_string(),
            kind: ResourceKind::Vpc,
            provider_id: provider_id.to_string(),
            app: "rise-app".to_string(),
            attributes: serde_json::json!({"uri": "registry.local/rise-app"}),
        }
    }

    #[test]
    fn test_spec_serializes_with_kind_tag() {
        let spec = ResourceSpec::Vpc(VpcSpec {
            cidr: "10.0.0.0/16".to_string(),
            dns_hostnames: true,
        });
        let value = spec.attributes().unwrap();
        assert_eq!(value["kind"], "vpc");
        assert_eq!(value["cidr"], "10.0.0.0/16");
    }

    #[test]
    fn test_dependencies_include_spec_references() {
        let spec = ResourceSpec::Subnet(SubnetSpec {
            vpc: reference("rise-app-vpc"),
            zone: "us-east-1a".to_string(),
            cidr: "10.0.0.0/24".to_string(),
            public: true,
        });
        let desired = DesiredResource::new("rise-app-subnet-a", spec)
            .with_dependency("rise-app-gateway");

        let deps = desired.dependencies().unwrap();
        assert_eq!(deps, vec!["rise-app-gateway", "rise-app-vpc"]);
    }

    #[test]
    fn test_resolve_provider_id_and_attribute() {
        let mut records = HashMap::new();
        records.insert("rise-app-vpc".to_string(), record("rise-app-vpc", "vpc-0abc"));

        let mut value = serde_json::json!({
            "vpc": reference("rise-app-vpc"),
            "env": {"REGISTRY": reference_attr("rise-app-vpc", "uri")},
            "plain": "untouched",
        });
        resolve_references(&mut value, &records).unwrap();

        assert_eq!(value["vpc"], "vpc-0abc");
        assert_eq!(value["env"]["REGISTRY"], "registry.local/rise-app");
        assert_eq!(value["plain"], "untouched");
    }

    #[test]
    fn test_resolve_missing_record_fails() {
        let mut value = serde_json::json!({"vpc": reference("rise-app-vpc")});
        let err = resolve_references(&mut value, &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("unresolved reference"));
    }
}
