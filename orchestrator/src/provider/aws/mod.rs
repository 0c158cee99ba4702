//! AWS provider backend
//!
//! Drives the `aws` CLI with `--output json` and maps responses onto
//! resource records. Split by layer the way the resource model is:
//! network, compute, balancer, delivery.

mod balancer;
mod compute;
mod delivery;
mod network;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::errors::OrchestratorError;
use crate::models::cicd::CredentialSpec;
use crate::models::compute::ServiceHealth;
use crate::models::resource::{DesiredResource, ResourceKind, ResourceRecord, ResourceSpec};
use crate::provider::{CloudProvider, CredentialPair};

/// Substrings marking a retryable CLI failure
const TRANSIENT_MARKERS: &[&str] = &[
    "Throttling",
    "RequestLimitExceeded",
    "TooManyRequests",
    "ServiceUnavailable",
    "RequestTimeout",
    "Connect timeout",
    "Could not connect to the endpoint",
];

/// Substrings marking a lookup for something that does not exist
const NOT_FOUND_MARKERS: &[&str] = &[
    "NotFoundException",
    "NotFound",
    "Not Found",
    "NoSuchEntity",
    "NoSuchBucket",
    "does not exist",
];

/// Thin wrapper around the `aws` CLI
pub(crate) struct AwsCli {
    region: String,
    account: OnceCell<String>,
}

impl AwsCli {
    fn new(region: String) -> Self {
        Self { region, account: OnceCell::new() }
    }

    pub(crate) fn region(&self) -> &str {
        &self.region
    }

    /// Run one aws subcommand and parse its JSON output.
    pub(crate) async fn run<S: AsRef<str>>(
        &self,
        resource: &str,
        args: &[S],
    ) -> Result<Value, OrchestratorError> {
        if args.len() >= 2 {
            debug!("aws {} {}", args[0].as_ref(), args[1].as_ref());
        }

        let output = Command::new("aws")
            .args(args.iter().map(|a| a.as_ref()))
            .args(["--region", &self.region, "--output", "json"])
            .output()
            .await
            .map_err(|e| OrchestratorError::ProviderError {
                resource: resource.to_string(),
                message: format!("failed to run aws: {}", e),
                transient: false,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_cli_error(resource, stderr.trim()));
        }

        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&output.stdout).map_err(|e| OrchestratorError::ProviderError {
            resource: resource.to_string(),
            message: format!("unparseable aws response: {}", e),
            transient: false,
        })
    }

    /// Like [`run`](Self::run), but a missing resource becomes `Ok(None)`.
    pub(crate) async fn try_run<S: AsRef<str>>(
        &self,
        resource: &str,
        args: &[S],
    ) -> Result<Option<Value>, OrchestratorError> {
        match self.run(resource, args).await {
            Ok(value) => Ok(Some(value)),
            Err(OrchestratorError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Account id of the active credentials, fetched once.
    pub(crate) async fn account_id(&self) -> Result<String, OrchestratorError> {
        self.account
            .get_or_try_init(|| async {
                let identity = self.run("sts", &["sts", "get-caller-identity"]).await?;
                required_str(&identity, "/Account", "sts")
            })
            .await
            .cloned()
    }
}

fn classify_cli_error(resource: &str, stderr: &str) -> OrchestratorError {
    if NOT_FOUND_MARKERS.iter().any(|m| stderr.contains(m)) {
        return OrchestratorError::NotFound(format!("{}: {}", resource, stderr));
    }
    let transient = TRANSIENT_MARKERS.iter().any(|m| stderr.contains(m));
    OrchestratorError::ProviderError {
        resource: resource.to_string(),
        message: stderr.to_string(),
        transient,
    }
}

/// Pull a required string field out of a CLI response.
pub(crate) fn required_str(
    value: &Value,
    pointer: &str,
    resource: &str,
) -> Result<String, OrchestratorError> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| OrchestratorError::ProviderError {
            resource: resource.to_string(),
            message: format!("response is missing {}", pointer),
            transient: false,
        })
}

pub(crate) fn record(
    app: &str,
    name: &str,
    kind: ResourceKind,
    provider_id: String,
    attributes: Value,
) -> ResourceRecord {
    ResourceRecord {
        name: name.to_string(),
        kind,
        provider_id,
        app: app.to_string(),
        attributes,
    }
}

/// Tag specification for `ec2 create-*` calls.
pub(crate) fn ec2_tag_spec(resource_type: &str, app: &str, name: &str) -> String {
    format!(
        "ResourceType={},Tags=[{{Key=App,Value={}}},{{Key=Name,Value={}}}]",
        resource_type, app, name
    )
}

/// Tag filters for `ec2 describe-*` calls.
pub(crate) fn ec2_tag_filters(app: &str, name: &str) -> [String; 2] {
    [
        format!("Name=tag:App,Values={}", app),
        format!("Name=tag:Name,Values={}", name),
    ]
}

/// Map a tagged ARN back to the resource kind it identifies.
fn kind_from_arn(arn: &str) -> Option<ResourceKind> {
    let service = arn.split(':').nth(2)?;
    let tail = arn.splitn(6, ':').nth(5)?;
    match service {
        "ec2" => match tail.split('/').next()? {
            "vpc" => Some(ResourceKind::Vpc),
            "subnet" => Some(ResourceKind::Subnet),
            "internet-gateway" => Some(ResourceKind::InternetGateway),
            "route-table" => Some(ResourceKind::RouteTable),
            "security-group" => Some(ResourceKind::SecurityGroup),
            _ => None,
        },
        "ecr" => tail.starts_with("repository/").then_some(ResourceKind::Repository),
        "logs" => Some(ResourceKind::LogGroup),
        "iam" => match tail.split('/').next()? {
            "role" => Some(ResourceKind::Role),
            "user" => Some(ResourceKind::Credential),
            _ => None,
        },
        "ecs" => match tail.split('/').next()? {
            "cluster" => Some(ResourceKind::Cluster),
            "service" => Some(ResourceKind::Service),
            _ => None,
        },
        "elasticloadbalancing" => match tail.split('/').next()? {
            "loadbalancer" => Some(ResourceKind::LoadBalancer),
            "targetgroup" => Some(ResourceKind::TargetGroup),
            "listener" => Some(ResourceKind::Listener),
            _ => None,
        },
        "codestar-connections" => Some(ResourceKind::SourceConnection),
        "codebuild" => tail.starts_with("project/").then_some(ResourceKind::BuildProject),
        "codepipeline" => Some(ResourceKind::Pipeline),
        _ => None,
    }
}

fn tag_value(tags: &Value, key: &str) -> Option<String> {
    tags.as_array()?
        .iter()
        .find(|t| t.pointer("/Key").and_then(Value::as_str) == Some(key))
        .and_then(|t| t.pointer("/Value").and_then(Value::as_str))
        .map(str::to_string)
}

/// AWS CLI provider
pub struct AwsCliProvider {
    cli: AwsCli,
}

impl AwsCliProvider {
    pub fn new(region: String) -> Self {
        Self { cli: AwsCli::new(region) }
    }
}

#[async_trait]
impl CloudProvider for AwsCliProvider {
    fn name(&self) -> &'static str {
        "aws"
    }

    async fn describe(
        &self,
        app: &str,
        desired: &DesiredResource,
    ) -> Result<Option<ResourceRecord>, OrchestratorError> {
        let cli = &self.cli;
        let name = &desired.name;
        match &desired.spec {
            ResourceSpec::Vpc(_) => network::describe_vpc(cli, app, name).await,
            ResourceSpec::Subnet(_) => network::describe_subnet(cli, app, name).await,
            ResourceSpec::InternetGateway(_) => network::describe_gateway(cli, app, name).await,
            ResourceSpec::RouteTable(_) => network::describe_route_table(cli, app, name).await,
            ResourceSpec::SecurityGroup(_) => network::describe_security_group(cli, app, name).await,
            ResourceSpec::Repository(spec) => compute::describe_repository(cli, app, name, &spec.name).await,
            ResourceSpec::LogGroup(spec) => compute::describe_log_group(cli, app, name, &spec.name).await,
            ResourceSpec::Role(spec) => compute::describe_role(cli, app, name, &spec.name).await,
            ResourceSpec::Cluster(spec) => compute::describe_cluster(cli, app, name, &spec.name).await,
            ResourceSpec::Service(spec) => compute::describe_service(cli, app, name, spec).await,
            ResourceSpec::LoadBalancer(spec) => balancer::describe_load_balancer(cli, app, name, &spec.name).await,
            ResourceSpec::TargetGroup(spec) => balancer::describe_target_group(cli, app, name, &spec.name).await,
            ResourceSpec::Listener(spec) => balancer::describe_listener(cli, app, name, spec).await,
            ResourceSpec::SourceConnection(spec) => delivery::describe_connection(cli, app, name, &spec.name).await,
            ResourceSpec::BuildProject(spec) => delivery::describe_build_project(cli, app, name, &spec.name).await,
            ResourceSpec::Pipeline(spec) => delivery::describe_pipeline(cli, app, name, &spec.name).await,
            ResourceSpec::Credential(spec) => delivery::describe_credential(cli, app, name, &spec.principal).await,
        }
    }

    async fn create(
        &self,
        app: &str,
        name: &str,
        spec: &ResourceSpec,
    ) -> Result<ResourceRecord, OrchestratorError> {
        let cli = &self.cli;
        match spec {
            ResourceSpec::Vpc(s) => network::create_vpc(cli, app, name, s).await,
            ResourceSpec::Subnet(s) => network::create_subnet(cli, app, name, s).await,
            ResourceSpec::InternetGateway(s) => network::create_gateway(cli, app, name, s).await,
            ResourceSpec::RouteTable(s) => network::create_route_table(cli, app, name, s).await,
            ResourceSpec::SecurityGroup(s) => network::create_security_group(cli, app, name, s).await,
            ResourceSpec::Repository(s) => compute::create_repository(cli, app, name, s).await,
            ResourceSpec::LogGroup(s) => compute::create_log_group(cli, app, name, s).await,
            ResourceSpec::Role(s) => compute::create_role(cli, app, name, s).await,
            ResourceSpec::Cluster(s) => compute::create_cluster(cli, app, name, s).await,
            ResourceSpec::Service(s) => compute::create_service(cli, app, name, s).await,
            ResourceSpec::LoadBalancer(s) => balancer::create_load_balancer(cli, app, name, s).await,
            ResourceSpec::TargetGroup(s) => balancer::create_target_group(cli, app, name, s).await,
            ResourceSpec::Listener(s) => balancer::create_listener(cli, app, name, s).await,
            ResourceSpec::SourceConnection(s) => delivery::create_connection(cli, app, name, s).await,
            ResourceSpec::BuildProject(s) => delivery::create_build_project(cli, app, name, s).await,
            ResourceSpec::Pipeline(s) => delivery::create_pipeline(cli, app, name, s).await,
            ResourceSpec::Credential(_) => Err(OrchestratorError::Internal(
                "credential principals are created through create_credential".to_string(),
            )),
        }
    }

    async fn create_credential(
        &self,
        app: &str,
        name: &str,
        spec: &CredentialSpec,
    ) -> Result<(ResourceRecord, CredentialPair), OrchestratorError> {
        delivery::create_credential(&self.cli, app, name, spec).await
    }

    async fn update(
        &self,
        current: &ResourceRecord,
        spec: &ResourceSpec,
        changed: &[String],
    ) -> Result<ResourceRecord, OrchestratorError> {
        let cli = &self.cli;
        match spec {
            ResourceSpec::Vpc(s) => network::update_vpc(cli, current, s).await,
            ResourceSpec::Subnet(s) => network::update_subnet(cli, current, s).await,
            ResourceSpec::RouteTable(s) => network::update_route_table(cli, current, s).await,
            ResourceSpec::SecurityGroup(s) => network::update_security_group(cli, current, s).await,
            ResourceSpec::Repository(s) => compute::update_repository(cli, current, s).await,
            ResourceSpec::LogGroup(s) => compute::update_log_group(cli, current, s).await,
            ResourceSpec::Role(s) => compute::update_role(cli, current, s).await,
            ResourceSpec::Service(s) => compute::update_service(cli, current, s, changed).await,
            ResourceSpec::LoadBalancer(s) => balancer::update_load_balancer(cli, current, s, changed).await,
            ResourceSpec::TargetGroup(s) => balancer::update_target_group(cli, current, s).await,
            ResourceSpec::Listener(s) => balancer::update_listener(cli, current, s).await,
            ResourceSpec::BuildProject(s) => delivery::update_build_project(cli, current, s).await,
            ResourceSpec::Pipeline(s) => delivery::update_pipeline(cli, current, s).await,
            ResourceSpec::Credential(s) => delivery::update_credential(cli, current, s).await,
            ResourceSpec::InternetGateway(_)
            | ResourceSpec::Cluster(_)
            | ResourceSpec::SourceConnection(_) => Err(OrchestratorError::Internal(format!(
                "{} has no fields that update in place",
                current.kind
            ))),
        }
    }

    async fn delete(&self, target: &ResourceRecord) -> Result<(), OrchestratorError> {
        let cli = &self.cli;
        match target.kind {
            ResourceKind::Vpc => network::delete_vpc(cli, target).await,
            ResourceKind::Subnet => network::delete_subnet(cli, target).await,
            ResourceKind::InternetGateway => network::delete_gateway(cli, target).await,
            ResourceKind::RouteTable => network::delete_route_table(cli, target).await,
            ResourceKind::SecurityGroup => network::delete_security_group(cli, target).await,
            ResourceKind::Repository => compute::delete_repository(cli, target).await,
            ResourceKind::LogGroup => compute::delete_log_group(cli, target).await,
            ResourceKind::Role => compute::delete_role(cli, target).await,
            ResourceKind::Cluster => compute::delete_cluster(cli, target).await,
            ResourceKind::Service => compute::delete_service(cli, target).await,
            ResourceKind::LoadBalancer => balancer::delete_load_balancer(cli, target).await,
            ResourceKind::TargetGroup => balancer::delete_target_group(cli, target).await,
            ResourceKind::Listener => balancer::delete_listener(cli, target).await,
            ResourceKind::SourceConnection => delivery::delete_connection(cli, target).await,
            ResourceKind::BuildProject => delivery::delete_build_project(cli, target).await,
            ResourceKind::Pipeline => delivery::delete_pipeline(cli, target).await,
            ResourceKind::Credential => delivery::delete_credential(cli, target).await,
        }
    }

    async fn list_app_resources(
        &self,
        app: &str,
    ) -> Result<Vec<ResourceRecord>, OrchestratorError> {
        let mut records = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut args = vec![
                "resourcegroupstaggingapi".to_string(),
                "get-resources".to_string(),
                "--tag-filters".to_string(),
                format!("Key=App,Values={}", app),
            ];
            if let Some(t) = &token {
                args.push("--pagination-token".to_string());
                args.push(t.clone());
            }
            let page = self.cli.run("tagging", &args).await?;

            for item in page
                .pointer("/ResourceTagMappingList")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default()
            {
                let Some(arn) = item.pointer("/ResourceARN").and_then(Value::as_str) else {
                    continue;
                };
                let Some(kind) = kind_from_arn(arn) else {
                    continue;
                };
                let Some(name) = tag_value(&item["Tags"], "Name") else {
                    continue;
                };
                records.push(record(app, &name, kind, arn.to_string(), Value::Null));
            }

            token = page
                .pointer("/PaginationToken")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            if token.is_none() {
                break;
            }
        }

        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn service_health(
        &self,
        cluster: &str,
        service: &str,
    ) -> Result<ServiceHealth, OrchestratorError> {
        compute::service_health(&self.cli, cluster, service).await
    }

    async fn set_service_image(
        &self,
        cluster: &str,
        service: &str,
        image: &str,
    ) -> Result<(), OrchestratorError> {
        compute::set_service_image(&self.cli, cluster, service, image).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_arn() {
        let cases = [
            ("arn:aws:ec2:us-east-1:123:vpc/vpc-0a1b", ResourceKind::Vpc),
            ("arn:aws:ec2:us-east-1:123:subnet/subnet-0a1b", ResourceKind::Subnet),
            ("arn:aws:ec2:us-east-1:123:security-group/sg-0a1b", ResourceKind::SecurityGroup),
            ("arn:aws:ecr:us-east-1:123:repository/rise-app", ResourceKind::Repository),
            ("arn:aws:logs:us-east-1:123:log-group:/ecs/rise-app", ResourceKind::LogGroup),
            ("arn:aws:iam::123:role/rise-app-execution-role", ResourceKind::Role),
            ("arn:aws:iam::123:user/rise-app-deployer", ResourceKind::Credential),
            ("arn:aws:ecs:us-east-1:123:cluster/rise-app-cluster", ResourceKind::Cluster),
            (
                "arn:aws:ecs:us-east-1:123:service/rise-app-cluster/rise-app-service",
                ResourceKind::Service,
            ),
            (
                "arn:aws:elasticloadbalancing:us-east-1:123:loadbalancer/app/rise-app-lb/50d",
                ResourceKind::LoadBalancer,
            ),
            (
                "arn:aws:elasticloadbalancing:us-east-1:123:targetgroup/rise-app-tg/943",
                ResourceKind::TargetGroup,
            ),
            ("arn:aws:codebuild:us-east-1:123:project/rise-app-build", ResourceKind::BuildProject),
            ("arn:aws:codepipeline:us-east-1:123:rise-app-pipeline", ResourceKind::Pipeline),
        ];
        for (arn, kind) in cases {
            assert_eq!(kind_from_arn(arn), Some(kind), "{}", arn);
        }
        assert_eq!(kind_from_arn("arn:aws:s3:::some-bucket"), None);
    }

    #[test]
    fn test_error_classification() {
        let throttled = classify_cli_error("vpc", "An error occurred (Throttling) when calling");
        assert!(throttled.is_transient());

        let missing =
            classify_cli_error("repo", "An error occurred (RepositoryNotFoundException)");
        assert!(matches!(missing, OrchestratorError::NotFound(_)));

        let denied = classify_cli_error("vpc", "An error occurred (UnauthorizedOperation)");
        assert!(!denied.is_transient());
    }

    #[test]
    fn test_ec2_tag_spec_shape() {
        assert_eq!(
            ec2_tag_spec("vpc", "rise-app", "rise-app-vpc"),
            "ResourceType=vpc,Tags=[{Key=App,Value=rise-app},{Key=Name,Value=rise-app-vpc}]"
        );
    }
}
