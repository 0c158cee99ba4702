//! Load balancer, target group and listener resources.

use serde_json::{json, Value};

use crate::errors::OrchestratorError;
use crate::models::balancer::{ListenerSpec, LoadBalancerSpec, TargetGroupSpec};
use crate::models::resource::{parse_reference, ResourceKind, ResourceRecord, ResourceSpec};

use super::{record, required_str, AwsCli};

pub(super) async fn describe_load_balancer(
    cli: &AwsCli,
    app: &str,
    name: &str,
    physical: &str,
) -> Result<Option<ResourceRecord>, OrchestratorError> {
    let Some(described) = cli
        .try_run(name, &["elbv2", "describe-load-balancers", "--names", physical])
        .await?
    else {
        return Ok(None);
    };
    let Some(balancer) = described.pointer("/LoadBalancers/0") else {
        return Ok(None);
    };
    let arn = required_str(balancer, "/LoadBalancerArn", name)?;

    let mut subnets: Vec<String> = balancer
        .pointer("/AvailabilityZones")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(|z| z.pointer("/SubnetId").and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    subnets.sort();

    let attributes = json!({
        "kind": "load_balancer",
        "name": physical,
        "subnets": subnets,
        "security_group": balancer
            .pointer("/SecurityGroups/0")
            .and_then(Value::as_str)
            .unwrap_or_default(),
        "dns_name": balancer.pointer("/DNSName").and_then(Value::as_str).unwrap_or_default(),
    });
    Ok(Some(record(app, name, ResourceKind::LoadBalancer, arn, attributes)))
}

pub(super) async fn create_load_balancer(
    cli: &AwsCli,
    app: &str,
    name: &str,
    spec: &LoadBalancerSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    let mut args: Vec<String> = vec![
        "elbv2".into(),
        "create-load-balancer".into(),
        "--name".into(),
        spec.name.clone(),
        "--type".into(),
        "application".into(),
        "--subnets".into(),
    ];
    args.extend(spec.subnets.iter().cloned());
    args.push("--security-groups".into());
    args.push(spec.security_group.clone());
    args.push("--tags".into());
    args.push(format!("Key=App,Value={}", app));
    args.push(format!("Key=Name,Value={}", name));

    let created = cli.run(name, &args).await?;
    let arn = required_str(&created, "/LoadBalancers/0/LoadBalancerArn", name)?;
    let dns_name = required_str(&created, "/LoadBalancers/0/DNSName", name)?;

    let mut attributes = ResourceSpec::LoadBalancer(spec.clone()).attributes()?;
    if let Some(map) = attributes.as_object_mut() {
        map.insert("dns_name".to_string(), dns_name.into());
    }
    Ok(record(app, name, ResourceKind::LoadBalancer, arn, attributes))
}

pub(super) async fn update_load_balancer(
    cli: &AwsCli,
    current: &ResourceRecord,
    spec: &LoadBalancerSpec,
    changed: &[String],
) -> Result<ResourceRecord, OrchestratorError> {
    if changed.iter().any(|c| c == "subnets") {
        let mut args: Vec<String> = vec![
            "elbv2".into(),
            "set-subnets".into(),
            "--load-balancer-arn".into(),
            current.provider_id.clone(),
            "--subnets".into(),
        ];
        args.extend(spec.subnets.iter().cloned());
        cli.run(&current.name, &args).await?;
    }
    if changed.iter().any(|c| c == "security_group") {
        cli.run(
            &current.name,
            &[
                "elbv2",
                "set-security-groups",
                "--load-balancer-arn",
                &current.provider_id,
                "--security-groups",
                &spec.security_group,
            ],
        )
        .await?;
    }

    let dns_name = current
        .attributes
        .pointer("/dns_name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let mut updated = current.clone();
    updated.attributes = ResourceSpec::LoadBalancer(spec.clone()).attributes()?;
    if let Some(map) = updated.attributes.as_object_mut() {
        map.insert("dns_name".to_string(), dns_name.into());
    }
    Ok(updated)
}

pub(super) async fn delete_load_balancer(
    cli: &AwsCli,
    target: &ResourceRecord,
) -> Result<(), OrchestratorError> {
    cli.run(
        &target.name,
        &["elbv2", "delete-load-balancer", "--load-balancer-arn", &target.provider_id],
    )
    .await?;
    Ok(())
}

pub(super) async fn describe_target_group(
    cli: &AwsCli,
    app: &str,
    name: &str,
    physical: &str,
) -> Result<Option<ResourceRecord>, OrchestratorError> {
    let Some(described) = cli
        .try_run(name, &["elbv2", "describe-target-groups", "--names", physical])
        .await?
    else {
        return Ok(None);
    };
    let Some(group) = described.pointer("/TargetGroups/0") else {
        return Ok(None);
    };
    let arn = required_str(group, "/TargetGroupArn", name)?;

    let attributes = json!({
        "kind": "target_group",
        "name": physical,
        "vpc": group.pointer("/VpcId").and_then(Value::as_str).unwrap_or_default(),
        "port": group.pointer("/Port").and_then(Value::as_u64).unwrap_or_default(),
        "health_check": {
            "path": group.pointer("/HealthCheckPath").and_then(Value::as_str).unwrap_or("/"),
            "healthy_threshold": group
                .pointer("/HealthyThresholdCount")
                .and_then(Value::as_u64)
                .unwrap_or_default(),
            "unhealthy_threshold": group
                .pointer("/UnhealthyThresholdCount")
                .and_then(Value::as_u64)
                .unwrap_or_default(),
            "interval_secs": group
                .pointer("/HealthCheckIntervalSeconds")
                .and_then(Value::as_u64)
                .unwrap_or_default(),
            "timeout_secs": group
                .pointer("/HealthCheckTimeoutSeconds")
                .and_then(Value::as_u64)
                .unwrap_or_default(),
        },
    });
    Ok(Some(record(app, name, ResourceKind::TargetGroup, arn, attributes)))
}

pub(super) async fn create_target_group(
    cli: &AwsCli,
    app: &str,
    name: &str,
    spec: &TargetGroupSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    let created = cli
        .run(
            name,
            &[
                "elbv2",
                "create-target-group",
                "--name",
                &spec.name,
                "--protocol",
                "HTTP",
                "--port",
                &spec.port.to_string(),
                "--vpc-id",
                &spec.vpc,
                "--target-type",
                "ip",
                "--health-check-path",
                &spec.health_check.path,
                "--health-check-interval-seconds",
                &spec.health_check.interval_secs.to_string(),
                "--health-check-timeout-seconds",
                &spec.health_check.timeout_secs.to_string(),
                "--healthy-threshold-count",
                &spec.health_check.healthy_threshold.to_string(),
                "--unhealthy-threshold-count",
                &spec.health_check.unhealthy_threshold.to_string(),
                "--tags",
                &format!("Key=App,Value={}", app),
                &format!("Key=Name,Value={}", name),
            ],
        )
        .await?;
    let arn = required_str(&created, "/TargetGroups/0/TargetGroupArn", name)?;

    let attributes = ResourceSpec::TargetGroup(spec.clone()).attributes()?;
    Ok(record(app, name, ResourceKind::TargetGroup, arn, attributes))
}

pub(super) async fn update_target_group(
    cli: &AwsCli,
    current: &ResourceRecord,
    spec: &TargetGroupSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    cli.run(
        &current.name,
        &[
            "elbv2",
            "modify-target-group",
            "--target-group-arn",
            &current.provider_id,
            "--health-check-path",
            &spec.health_check.path,
            "--health-check-interval-seconds",
            &spec.health_check.interval_secs.to_string(),
            "--health-check-timeout-seconds",
            &spec.health_check.timeout_secs.to_string(),
            "--healthy-threshold-count",
            &spec.health_check.healthy_threshold.to_string(),
            "--unhealthy-threshold-count",
            &spec.health_check.unhealthy_threshold.to_string(),
        ],
    )
    .await?;

    let mut updated = current.clone();
    updated.attributes = ResourceSpec::TargetGroup(spec.clone()).attributes()?;
    Ok(updated)
}

pub(super) async fn delete_target_group(
    cli: &AwsCli,
    target: &ResourceRecord,
) -> Result<(), OrchestratorError> {
    cli.run(
        &target.name,
        &["elbv2", "delete-target-group", "--target-group-arn", &target.provider_id],
    )
    .await?;
    Ok(())
}

/// Resolve the spec's load balancer field to an ARN. An unresolved
/// reference goes through a name lookup; balancer physical names equal
/// their logical names.
async fn load_balancer_arn(
    cli: &AwsCli,
    resource: &str,
    load_balancer: &str,
) -> Result<Option<String>, OrchestratorError> {
    let name = match parse_reference(load_balancer) {
        Some((name, _)) => name,
        None => return Ok(Some(load_balancer.to_string())),
    };

    let Some(described) = cli
        .try_run(resource, &["elbv2", "describe-load-balancers", "--names", name])
        .await?
    else {
        return Ok(None);
    };
    Ok(described
        .pointer("/LoadBalancers/0/LoadBalancerArn")
        .and_then(Value::as_str)
        .map(str::to_string))
}

pub(super) async fn describe_listener(
    cli: &AwsCli,
    app: &str,
    name: &str,
    spec: &ListenerSpec,
) -> Result<Option<ResourceRecord>, OrchestratorError> {
    let Some(balancer_arn) = load_balancer_arn(cli, name, &spec.load_balancer).await? else {
        return Ok(None);
    };

    let Some(described) = cli
        .try_run(name, &["elbv2", "describe-listeners", "--load-balancer-arn", &balancer_arn])
        .await?
    else {
        return Ok(None);
    };
    // The balancer carries a single listener.
    let Some(listener) = described.pointer("/Listeners/0") else {
        return Ok(None);
    };
    let arn = required_str(listener, "/ListenerArn", name)?;

    let attributes = json!({
        "kind": "listener",
        "load_balancer": balancer_arn,
        "port": listener.pointer("/Port").and_then(Value::as_u64).unwrap_or_default(),
        "target_group": listener
            .pointer("/DefaultActions/0/TargetGroupArn")
            .and_then(Value::as_str)
            .unwrap_or_default(),
    });
    Ok(Some(record(app, name, ResourceKind::Listener, arn, attributes)))
}

pub(super) async fn create_listener(
    cli: &AwsCli,
    app: &str,
    name: &str,
    spec: &ListenerSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    let created = cli
        .run(
            name,
            &[
                "elbv2",
                "create-listener",
                "--load-balancer-arn",
                &spec.load_balancer,
                "--protocol",
                "HTTP",
                "--port",
                &spec.port.to_string(),
                "--default-actions",
                &format!("Type=forward,TargetGroupArn={}", spec.target_group),
                "--tags",
                &format!("Key=App,Value={}", app),
                &format!("Key=Name,Value={}", name),
            ],
        )
        .await?;
    let arn = required_str(&created, "/Listeners/0/ListenerArn", name)?;

    let attributes = ResourceSpec::Listener(spec.clone()).attributes()?;
    Ok(record(app, name, ResourceKind::Listener, arn, attributes))
}

pub(super) async fn update_listener(
    cli: &AwsCli,
    current: &ResourceRecord,
    spec: &ListenerSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    cli.run(
        &current.name,
        &[
            "elbv2",
            "modify-listener",
            "--listener-arn",
            &current.provider_id,
            "--port",
            &spec.port.to_string(),
            "--default-actions",
            &format!("Type=forward,TargetGroupArn={}", spec.target_group),
        ],
    )
    .await?;

    let mut updated = current.clone();
    updated.attributes = ResourceSpec::Listener(spec.clone()).attributes()?;
    Ok(updated)
}

pub(super) async fn delete_listener(
    cli: &AwsCli,
    target: &ResourceRecord,
) -> Result<(), OrchestratorError> {
    cli.run(&target.name, &["elbv2", "delete-listener", "--listener-arn", &target.provider_id])
        .await?;
    Ok(())
}
