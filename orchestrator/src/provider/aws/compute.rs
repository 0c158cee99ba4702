//! Registry, logging, IAM and ECS resources, plus the service rollout
//! primitives the deployment path uses.

use serde_json::{json, Value};

use crate::errors::OrchestratorError;
use crate::models::compute::{ClusterSpec, LogGroupSpec, RepositorySpec, RoleSpec, ServiceHealth, ServiceSpec};
use crate::models::resource::{parse_reference, ResourceKind, ResourceRecord, ResourceSpec};

use super::{record, required_str, AwsCli};

const MANAGED_POLICY_PREFIX: &str = "arn:aws:iam::aws:policy/";

/// Part of an ARN after the first occurrence of `marker`.
fn arn_tail<'a>(arn: &'a str, marker: &str) -> Option<&'a str> {
    arn.split_once(marker).map(|(_, tail)| tail)
}

pub(super) async fn describe_repository(
    cli: &AwsCli,
    app: &str,
    name: &str,
    physical: &str,
) -> Result<Option<ResourceRecord>, OrchestratorError> {
    let Some(described) = cli
        .try_run(name, &["ecr", "describe-repositories", "--repository-names", physical])
        .await?
    else {
        return Ok(None);
    };
    let Some(repo) = described.pointer("/repositories/0") else {
        return Ok(None);
    };

    let arn = required_str(repo, "/repositoryArn", name)?;
    let attributes = json!({
        "kind": "repository",
        "name": repo.pointer("/repositoryName").and_then(Value::as_str).unwrap_or(physical),
        "scan_on_push": repo
            .pointer("/imageScanningConfiguration/scanOnPush")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        "uri": repo.pointer("/repositoryUri").and_then(Value::as_str).unwrap_or_default(),
    });
    Ok(Some(record(app, name, ResourceKind::Repository, arn, attributes)))
}

pub(super) async fn create_repository(
    cli: &AwsCli,
    app: &str,
    name: &str,
    spec: &RepositorySpec,
) -> Result<ResourceRecord, OrchestratorError> {
    let created = cli
        .run(
            name,
            &[
                "ecr",
                "create-repository",
                "--repository-name",
                &spec.name,
                "--image-scanning-configuration",
                &format!("scanOnPush={}", spec.scan_on_push),
                "--tags",
                &format!("Key=App,Value={}", app),
                &format!("Key=Name,Value={}", name),
            ],
        )
        .await?;

    let arn = required_str(&created, "/repository/repositoryArn", name)?;
    let uri = required_str(&created, "/repository/repositoryUri", name)?;

    let mut attributes = ResourceSpec::Repository(spec.clone()).attributes()?;
    if let Some(map) = attributes.as_object_mut() {
        map.insert("uri".to_string(), uri.into());
    }
    Ok(record(app, name, ResourceKind::Repository, arn, attributes))
}

pub(super) async fn update_repository(
    cli: &AwsCli,
    current: &ResourceRecord,
    spec: &RepositorySpec,
) -> Result<ResourceRecord, OrchestratorError> {
    cli.run(
        &current.name,
        &[
            "ecr",
            "put-image-scanning-configuration",
            "--repository-name",
            &spec.name,
            "--image-scanning-configuration",
            &format!("scanOnPush={}", spec.scan_on_push),
        ],
    )
    .await?;

    let uri = current.attributes.pointer("/uri").and_then(Value::as_str).unwrap_or_default().to_string();
    let mut updated = current.clone();
    updated.attributes = ResourceSpec::Repository(spec.clone()).attributes()?;
    if let Some(map) = updated.attributes.as_object_mut() {
        map.insert("uri".to_string(), uri.into());
    }
    Ok(updated)
}

pub(super) async fn delete_repository(
    cli: &AwsCli,
    target: &ResourceRecord,
) -> Result<(), OrchestratorError> {
    let physical = arn_tail(&target.provider_id, "repository/")
        .or_else(|| target.attributes.pointer("/name").and_then(Value::as_str))
        .unwrap_or(&target.name)
        .to_string();
    cli.run(
        &target.name,
        &["ecr", "delete-repository", "--repository-name", &physical, "--force"],
    )
    .await?;
    Ok(())
}

pub(super) async fn describe_log_group(
    cli: &AwsCli,
    app: &str,
    name: &str,
    physical: &str,
) -> Result<Option<ResourceRecord>, OrchestratorError> {
    let described = cli
        .run(name, &["logs", "describe-log-groups", "--log-group-name-prefix", physical])
        .await?;

    let Some(group) = described
        .pointer("/logGroups")
        .and_then(Value::as_array)
        .and_then(|groups| {
            groups.iter().find(|g| {
                g.pointer("/logGroupName").and_then(Value::as_str) == Some(physical)
            })
        })
    else {
        return Ok(None);
    };

    let attributes = json!({
        "kind": "log_group",
        "name": physical,
        "retention_days": group.pointer("/retentionInDays").and_then(Value::as_u64).unwrap_or(0),
    });
    // Log groups are addressed by name everywhere, so the name is the id.
    Ok(Some(record(app, name, ResourceKind::LogGroup, physical.to_string(), attributes)))
}

pub(super) async fn create_log_group(
    cli: &AwsCli,
    app: &str,
    name: &str,
    spec: &LogGroupSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    cli.run(
        name,
        &[
            "logs",
            "create-log-group",
            "--log-group-name",
            &spec.name,
            "--tags",
            &format!("App={},Name={}", app, name),
        ],
    )
    .await?;

    if spec.retention_days > 0 {
        cli.run(
            name,
            &[
                "logs",
                "put-retention-policy",
                "--log-group-name",
                &spec.name,
                "--retention-in-days",
                &spec.retention_days.to_string(),
            ],
        )
        .await?;
    }

    let attributes = ResourceSpec::LogGroup(spec.clone()).attributes()?;
    Ok(record(app, name, ResourceKind::LogGroup, spec.name.clone(), attributes))
}

pub(super) async fn update_log_group(
    cli: &AwsCli,
    current: &ResourceRecord,
    spec: &LogGroupSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    if spec.retention_days > 0 {
        cli.run(
            &current.name,
            &[
                "logs",
                "put-retention-policy",
                "--log-group-name",
                &spec.name,
                "--retention-in-days",
                &spec.retention_days.to_string(),
            ],
        )
        .await?;
    } else {
        cli.run(
            &current.name,
            &["logs", "delete-retention-policy", "--log-group-name", &spec.name],
        )
        .await?;
    }

    let mut updated = current.clone();
    updated.attributes = ResourceSpec::LogGroup(spec.clone()).attributes()?;
    Ok(updated)
}

pub(super) async fn delete_log_group(
    cli: &AwsCli,
    target: &ResourceRecord,
) -> Result<(), OrchestratorError> {
    let physical = if target.provider_id.starts_with("arn:") {
        arn_tail(&target.provider_id, "log-group:")
            .unwrap_or(&target.provider_id)
            .trim_end_matches(":*")
            .to_string()
    } else {
        target.provider_id.clone()
    };
    cli.run(&target.name, &["logs", "delete-log-group", "--log-group-name", &physical])
        .await?;
    Ok(())
}

pub(super) async fn describe_role(
    cli: &AwsCli,
    app: &str,
    name: &str,
    physical: &str,
) -> Result<Option<ResourceRecord>, OrchestratorError> {
    let Some(described) =
        cli.try_run(name, &["iam", "get-role", "--role-name", physical]).await?
    else {
        return Ok(None);
    };
    let arn = required_str(&described, "/Role/Arn", name)?;

    let assume_service = described
        .pointer("/Role/AssumeRolePolicyDocument/Statement/0/Principal/Service")
        .and_then(Value::as_str)
        .map(|s| s.trim_end_matches(".amazonaws.com").to_string())
        .unwrap_or_default();

    let attached = cli
        .run(name, &["iam", "list-attached-role-policies", "--role-name", physical])
        .await?;
    let mut policies: Vec<String> = attached
        .pointer("/AttachedPolicies")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(|p| p.pointer("/PolicyArn").and_then(Value::as_str))
        .map(|arn| arn.trim_start_matches(MANAGED_POLICY_PREFIX).to_string())
        .collect();
    policies.sort();

    let attributes = json!({
        "kind": "role",
        "name": physical,
        "assume_service": assume_service,
        "policies": policies,
    });
    Ok(Some(record(app, name, ResourceKind::Role, arn, attributes)))
}

pub(super) async fn create_role(
    cli: &AwsCli,
    app: &str,
    name: &str,
    spec: &RoleSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    let assume_document = json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": {"Service": format!("{}.amazonaws.com", spec.assume_service)},
            "Action": "sts:AssumeRole",
        }],
    })
    .to_string();

    let created = cli
        .run(
            name,
            &[
                "iam",
                "create-role",
                "--role-name",
                &spec.name,
                "--assume-role-policy-document",
                &assume_document,
                "--tags",
                &format!("Key=App,Value={}", app),
                &format!("Key=Name,Value={}", name),
            ],
        )
        .await?;
    let arn = required_str(&created, "/Role/Arn", name)?;

    for policy in &spec.policies {
        cli.run(
            name,
            &[
                "iam",
                "attach-role-policy",
                "--role-name",
                &spec.name,
                "--policy-arn",
                &format!("{}{}", MANAGED_POLICY_PREFIX, policy),
            ],
        )
        .await?;
    }

    let attributes = ResourceSpec::Role(spec.clone()).attributes()?;
    Ok(record(app, name, ResourceKind::Role, arn, attributes))
}

pub(super) async fn update_role(
    cli: &AwsCli,
    current: &ResourceRecord,
    spec: &RoleSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    let attached = cli
        .run(&current.name, &["iam", "list-attached-role-policies", "--role-name", &spec.name])
        .await?;
    let live: Vec<String> = attached
        .pointer("/AttachedPolicies")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(|p| p.pointer("/PolicyArn").and_then(Value::as_str))
        .map(str::to_string)
        .collect();

    for policy_arn in &live {
        let suffix = policy_arn.trim_start_matches(MANAGED_POLICY_PREFIX);
        if !spec.policies.iter().any(|p| p == suffix) {
            cli.run(
                &current.name,
                &["iam", "detach-role-policy", "--role-name", &spec.name, "--policy-arn", policy_arn],
            )
            .await?;
        }
    }
    for policy in &spec.policies {
        let arn = format!("{}{}", MANAGED_POLICY_PREFIX, policy);
        if !live.iter().any(|p| p == &arn) {
            cli.run(
                &current.name,
                &["iam", "attach-role-policy", "--role-name", &spec.name, "--policy-arn", &arn],
            )
            .await?;
        }
    }

    let mut updated = current.clone();
    updated.attributes = ResourceSpec::Role(spec.clone()).attributes()?;
    Ok(updated)
}

pub(super) async fn delete_role(
    cli: &AwsCli,
    target: &ResourceRecord,
) -> Result<(), OrchestratorError> {
    let physical = arn_tail(&target.provider_id, "role/")
        .or_else(|| target.attributes.pointer("/name").and_then(Value::as_str))
        .unwrap_or(&target.name)
        .to_string();

    let attached = cli
        .run(&target.name, &["iam", "list-attached-role-policies", "--role-name", &physical])
        .await?;
    for policy in attached
        .pointer("/AttachedPolicies")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        if let Some(arn) = policy.pointer("/PolicyArn").and_then(Value::as_str) {
            cli.run(
                &target.name,
                &["iam", "detach-role-policy", "--role-name", &physical, "--policy-arn", arn],
            )
            .await?;
        }
    }

    cli.run(&target.name, &["iam", "delete-role", "--role-name", &physical]).await?;
    Ok(())
}

pub(super) async fn describe_cluster(
    cli: &AwsCli,
    app: &str,
    name: &str,
    physical: &str,
) -> Result<Option<ResourceRecord>, OrchestratorError> {
    let described = cli
        .run(name, &["ecs", "describe-clusters", "--clusters", physical])
        .await?;

    let Some(cluster) = described
        .pointer("/clusters")
        .and_then(Value::as_array)
        .and_then(|clusters| {
            clusters
                .iter()
                .find(|c| c.pointer("/status").and_then(Value::as_str) == Some("ACTIVE"))
        })
    else {
        return Ok(None);
    };
    let arn = required_str(cluster, "/clusterArn", name)?;

    let attributes = json!({"kind": "cluster", "name": physical});
    Ok(Some(record(app, name, ResourceKind::Cluster, arn, attributes)))
}

pub(super) async fn create_cluster(
    cli: &AwsCli,
    app: &str,
    name: &str,
    spec: &ClusterSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    let created = cli
        .run(
            name,
            &[
                "ecs",
                "create-cluster",
                "--cluster-name",
                &spec.name,
                "--tags",
                &format!("key=App,value={}", app),
                &format!("key=Name,value={}", name),
            ],
        )
        .await?;
    let arn = required_str(&created, "/cluster/clusterArn", name)?;

    let attributes = ResourceSpec::Cluster(spec.clone()).attributes()?;
    Ok(record(app, name, ResourceKind::Cluster, arn, attributes))
}

pub(super) async fn delete_cluster(
    cli: &AwsCli,
    target: &ResourceRecord,
) -> Result<(), OrchestratorError> {
    let physical = arn_tail(&target.provider_id, "cluster/").unwrap_or(&target.provider_id).to_string();
    cli.run(&target.name, &["ecs", "delete-cluster", "--cluster", &physical]).await?;
    Ok(())
}

/// ECS accepts cluster names and ARNs interchangeably; an unresolved
/// reference points at the cluster whose physical name equals its logical
/// name.
fn cluster_handle(cluster: &str) -> &str {
    match parse_reference(cluster) {
        Some((name, _)) => name,
        None => cluster,
    }
}

fn split_image(image: &str) -> (String, String) {
    match image.rsplit_once(':') {
        Some((repository, tag)) if !tag.contains('/') => (repository.to_string(), tag.to_string()),
        _ => (image.to_string(), "latest".to_string()),
    }
}

fn task_definition_input(app: &str, name: &str, spec: &ServiceSpec, region: &str) -> Value {
    json!({
        "family": name,
        "networkMode": "awsvpc",
        "requiresCompatibilities": ["FARGATE"],
        "cpu": spec.cpu.to_string(),
        "memory": spec.memory.to_string(),
        "executionRoleArn": spec.execution_role,
        "containerDefinitions": [{
            "name": app,
            "image": format!("{}:{}", spec.repository, spec.image_tag),
            "essential": true,
            "portMappings": [{"containerPort": spec.container_port, "protocol": "tcp"}],
            "logConfiguration": {
                "logDriver": "awslogs",
                "options": {
                    "awslogs-group": spec.log_group,
                    "awslogs-region": region,
                    "awslogs-stream-prefix": "ecs",
                },
            },
        }],
    })
}

async fn register_task_definition(
    cli: &AwsCli,
    name: &str,
    input: &Value,
) -> Result<String, OrchestratorError> {
    let input_json = serde_json::to_string(input)?;
    let registered = cli
        .run(name, &["ecs", "register-task-definition", "--cli-input-json", &input_json])
        .await?;
    required_str(&registered, "/taskDefinition/taskDefinitionArn", name)
}

pub(super) async fn describe_service(
    cli: &AwsCli,
    app: &str,
    name: &str,
    spec: &ServiceSpec,
) -> Result<Option<ResourceRecord>, OrchestratorError> {
    let cluster = cluster_handle(&spec.cluster);
    let Some(described) = cli
        .try_run(name, &["ecs", "describe-services", "--cluster", cluster, "--services", name])
        .await?
    else {
        return Ok(None);
    };

    let Some(service) = described
        .pointer("/services")
        .and_then(Value::as_array)
        .and_then(|services| {
            services
                .iter()
                .find(|s| s.pointer("/status").and_then(Value::as_str) != Some("INACTIVE"))
        })
    else {
        return Ok(None);
    };
    let arn = required_str(service, "/serviceArn", name)?;

    let task_definition_arn = required_str(service, "/taskDefinition", name)?;
    let task = cli
        .run(
            name,
            &["ecs", "describe-task-definition", "--task-definition", &task_definition_arn],
        )
        .await?;
    let definition = &task["taskDefinition"];
    let container = &definition["containerDefinitions"][0];

    let (repository, image_tag) =
        split_image(container.pointer("/image").and_then(Value::as_str).unwrap_or_default());

    let mut subnets: Vec<String> = service
        .pointer("/networkConfiguration/awsvpcConfiguration/subnets")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    subnets.sort();

    let attributes = json!({
        "kind": "service",
        "cluster": service.pointer("/clusterArn").and_then(Value::as_str).unwrap_or_default(),
        "repository": repository,
        "image_tag": image_tag,
        "container_port": service
            .pointer("/loadBalancers/0/containerPort")
            .and_then(Value::as_u64)
            .unwrap_or_default(),
        "replicas": service.pointer("/desiredCount").and_then(Value::as_u64).unwrap_or_default(),
        "cpu": definition
            .pointer("/cpu")
            .and_then(Value::as_str)
            .and_then(|c| c.parse::<u64>().ok())
            .unwrap_or_default(),
        "memory": definition
            .pointer("/memory")
            .and_then(Value::as_str)
            .and_then(|m| m.parse::<u64>().ok())
            .unwrap_or_default(),
        "execution_role": definition.pointer("/executionRoleArn").and_then(Value::as_str).unwrap_or_default(),
        "log_group": container
            .pointer("/logConfiguration/options/awslogs-group")
            .and_then(Value::as_str)
            .unwrap_or_default(),
        "subnets": subnets,
        "security_group": service
            .pointer("/networkConfiguration/awsvpcConfiguration/securityGroups/0")
            .and_then(Value::as_str)
            .unwrap_or_default(),
        "target_group": service
            .pointer("/loadBalancers/0/targetGroupArn")
            .and_then(Value::as_str)
            .unwrap_or_default(),
        "assign_public_ip": service
            .pointer("/networkConfiguration/awsvpcConfiguration/assignPublicIp")
            .and_then(Value::as_str)
            == Some("ENABLED"),
    });
    Ok(Some(record(app, name, ResourceKind::Service, arn, attributes)))
}

pub(super) async fn create_service(
    cli: &AwsCli,
    app: &str,
    name: &str,
    spec: &ServiceSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    let task_input = task_definition_input(app, name, spec, cli.region());
    let task_definition_arn = register_task_definition(cli, name, &task_input).await?;

    let assign = if spec.assign_public_ip { "ENABLED" } else { "DISABLED" };
    let service_input = json!({
        "cluster": spec.cluster,
        "serviceName": name,
        "taskDefinition": task_definition_arn,
        "desiredCount": spec.replicas,
        "launchType": "FARGATE",
        "networkConfiguration": {
            "awsvpcConfiguration": {
                "subnets": spec.subnets,
                "securityGroups": [spec.security_group],
                "assignPublicIp": assign,
            },
        },
        "loadBalancers": [{
            "targetGroupArn": spec.target_group,
            "containerName": app,
            "containerPort": spec.container_port,
        }],
        "tags": [
            {"key": "App", "value": app},
            {"key": "Name", "value": name},
        ],
        "propagateTags": "SERVICE",
    });
    let service_json = serde_json::to_string(&service_input)?;
    let created = cli
        .run(name, &["ecs", "create-service", "--cli-input-json", &service_json])
        .await?;
    let arn = required_str(&created, "/service/serviceArn", name)?;

    let attributes = ResourceSpec::Service(spec.clone()).attributes()?;
    Ok(record(app, name, ResourceKind::Service, arn, attributes))
}

pub(super) async fn update_service(
    cli: &AwsCli,
    current: &ResourceRecord,
    spec: &ServiceSpec,
    changed: &[String],
) -> Result<ResourceRecord, OrchestratorError> {
    let cluster = current
        .attributes
        .pointer("/cluster")
        .and_then(Value::as_str)
        .unwrap_or_else(|| cluster_handle(&spec.cluster))
        .to_string();

    let task_fields =
        ["repository", "cpu", "memory", "execution_role", "log_group", "container_port"];
    let network_fields = ["subnets", "security_group", "assign_public_ip"];

    let mut args: Vec<String> = vec![
        "ecs".into(),
        "update-service".into(),
        "--cluster".into(),
        cluster,
        "--service".into(),
        current.name.clone(),
    ];

    if changed.iter().any(|c| task_fields.contains(&c.as_str())) {
        let task_input = task_definition_input(&current.app, &current.name, spec, cli.region());
        let arn = register_task_definition(cli, &current.name, &task_input).await?;
        args.push("--task-definition".into());
        args.push(arn);
    }
    if changed.iter().any(|c| c == "replicas") {
        args.push("--desired-count".into());
        args.push(spec.replicas.to_string());
    }
    if changed.iter().any(|c| network_fields.contains(&c.as_str())) {
        let assign = if spec.assign_public_ip { "ENABLED" } else { "DISABLED" };
        args.push("--network-configuration".into());
        args.push(format!(
            "awsvpcConfiguration={{subnets=[{}],securityGroups=[{}],assignPublicIp={}}}",
            spec.subnets.join(","),
            spec.security_group,
            assign
        ));
    }
    if changed.iter().any(|c| c == "target_group") {
        args.push("--load-balancers".into());
        args.push(format!(
            "targetGroupArn={},containerName={},containerPort={}",
            spec.target_group, current.app, spec.container_port
        ));
    }

    cli.run(&current.name, &args).await?;

    let mut updated = current.clone();
    updated.attributes = ResourceSpec::Service(spec.clone()).attributes()?;
    Ok(updated)
}

pub(super) async fn delete_service(
    cli: &AwsCli,
    target: &ResourceRecord,
) -> Result<(), OrchestratorError> {
    // New-style service ARNs end in cluster-name/service-name.
    let (cluster, service) = match arn_tail(&target.provider_id, "service/") {
        Some(tail) => match tail.split_once('/') {
            Some((cluster, service)) => (cluster.to_string(), service.to_string()),
            None => (
                target
                    .attributes
                    .pointer("/cluster")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                tail.to_string(),
            ),
        },
        None => return Err(OrchestratorError::Internal(format!(
            "cannot derive cluster and service from {}",
            target.provider_id
        ))),
    };

    cli.run(
        &target.name,
        &["ecs", "update-service", "--cluster", &cluster, "--service", &service, "--desired-count", "0"],
    )
    .await?;
    cli.run(
        &target.name,
        &["ecs", "delete-service", "--cluster", &cluster, "--service", &service, "--force"],
    )
    .await?;
    Ok(())
}

pub(super) async fn service_health(
    cli: &AwsCli,
    cluster: &str,
    service: &str,
) -> Result<ServiceHealth, OrchestratorError> {
    let described = cli
        .run(service, &["ecs", "describe-services", "--cluster", cluster, "--services", service])
        .await?;
    let Some(svc) = described.pointer("/services/0") else {
        return Err(OrchestratorError::NotFound(format!("service {} not found", service)));
    };

    let desired = svc.pointer("/desiredCount").and_then(Value::as_u64).unwrap_or_default() as u32;
    let running = svc.pointer("/runningCount").and_then(Value::as_u64).unwrap_or_default() as u32;

    let primary = svc
        .pointer("/deployments")
        .and_then(Value::as_array)
        .and_then(|deployments| {
            deployments
                .iter()
                .find(|d| d.pointer("/status").and_then(Value::as_str) == Some("PRIMARY"))
        });

    let image = match primary.and_then(|d| d.pointer("/taskDefinition")).and_then(Value::as_str) {
        Some(task_arn) => {
            let task = cli
                .run(service, &["ecs", "describe-task-definition", "--task-definition", task_arn])
                .await?;
            task.pointer("/taskDefinition/containerDefinitions/0/image")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        }
        None => String::new(),
    };

    // Healthy means registered and passing behind the target group. A
    // service without one falls back to its running count.
    let healthy = match svc.pointer("/loadBalancers/0/targetGroupArn").and_then(Value::as_str) {
        Some(target_group) => {
            let health = cli
                .run(
                    service,
                    &["elbv2", "describe-target-health", "--target-group-arn", target_group],
                )
                .await?;
            health
                .pointer("/TargetHealthDescriptions")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .filter(|t| {
                    t.pointer("/TargetHealth/State").and_then(Value::as_str) == Some("healthy")
                })
                .count() as u32
        }
        None => running,
    };

    Ok(ServiceHealth { desired, running, healthy, image })
}

/// Fields `describe-task-definition` reports that `register-task-definition`
/// rejects as input.
const TASK_DEFINITION_READ_ONLY: &[&str] = &[
    "taskDefinitionArn",
    "revision",
    "status",
    "requiresAttributes",
    "compatibilities",
    "registeredAt",
    "registeredBy",
    "deregisteredAt",
];

pub(super) async fn set_service_image(
    cli: &AwsCli,
    cluster: &str,
    service: &str,
    image: &str,
) -> Result<(), OrchestratorError> {
    let described = cli
        .run(service, &["ecs", "describe-services", "--cluster", cluster, "--services", service])
        .await?;
    let Some(task_arn) =
        described.pointer("/services/0/taskDefinition").and_then(Value::as_str)
    else {
        return Err(OrchestratorError::NotFound(format!("service {} not found", service)));
    };

    let task = cli
        .run(service, &["ecs", "describe-task-definition", "--task-definition", task_arn])
        .await?;
    let mut definition = task
        .pointer("/taskDefinition")
        .cloned()
        .ok_or_else(|| OrchestratorError::ProviderError {
            resource: service.to_string(),
            message: "task definition response is malformed".to_string(),
            transient: false,
        })?;

    if let Some(map) = definition.as_object_mut() {
        for field in TASK_DEFINITION_READ_ONLY {
            map.remove(*field);
        }
    }
    if let Some(container) = definition.pointer_mut("/containerDefinitions/0/image") {
        *container = Value::String(image.to_string());
    }

    let new_arn = register_task_definition(cli, service, &definition).await?;
    cli.run(
        service,
        &[
            "ecs",
            "update-service",
            "--cluster",
            cluster,
            "--service",
            service,
            "--task-definition",
            &new_arn,
        ],
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_image() {
        assert_eq!(
            split_image("123.dkr.ecr.us-east-1.amazonaws.com/rise-app:a1b2c3d"),
            ("123.dkr.ecr.us-east-1.amazonaws.com/rise-app".to_string(), "a1b2c3d".to_string())
        );
        assert_eq!(
            split_image("registry.local/rise-app"),
            ("registry.local/rise-app".to_string(), "latest".to_string())
        );
    }

    #[test]
    fn test_cluster_handle_unwraps_references() {
        assert_eq!(cluster_handle("ref:rise-app-cluster"), "rise-app-cluster");
        assert_eq!(
            cluster_handle("arn:aws:ecs:us-east-1:123:cluster/rise-app-cluster"),
            "arn:aws:ecs:us-east-1:123:cluster/rise-app-cluster"
        );
    }

    #[test]
    fn test_task_definition_shape() {
        let spec = ServiceSpec {
            cluster: "arn:aws:ecs:us-east-1:123:cluster/rise-app-cluster".to_string(),
            repository: "123.dkr.ecr.us-east-1.amazonaws.com/rise-app".to_string(),
            image_tag: "a1b2c3d".to_string(),
            container_port: 3000,
            replicas: 1,
            cpu: 256,
            memory: 512,
            execution_role: "arn:aws:iam::123:role/rise-app-execution-role".to_string(),
            log_group: "/ecs/rise-app".to_string(),
            subnets: vec!["subnet-1".to_string()],
            security_group: "sg-1".to_string(),
            target_group: "arn:aws:elasticloadbalancing:us-east-1:123:targetgroup/tg/1".to_string(),
            assign_public_ip: true,
        };
        let input = task_definition_input("rise-app", "rise-app-service", &spec, "us-east-1");

        assert_eq!(input.pointer("/cpu").and_then(Value::as_str), Some("256"));
        assert_eq!(
            input.pointer("/containerDefinitions/0/name").and_then(Value::as_str),
            Some("rise-app")
        );
        assert_eq!(
            input.pointer("/containerDefinitions/0/image").and_then(Value::as_str),
            Some("123.dkr.ecr.us-east-1.amazonaws.com/rise-app:a1b2c3d")
        );
        assert_eq!(
            input
                .pointer("/containerDefinitions/0/logConfiguration/options/awslogs-group")
                .and_then(Value::as_str),
            Some("/ecs/rise-app")
        );
    }
}
