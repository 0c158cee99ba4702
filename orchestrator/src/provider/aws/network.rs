//! EC2 network resources: VPC, subnets, internet gateway, route table,
//! security groups. Lookup goes through the App/Name tag pair.

use serde_json::{json, Value};

use crate::errors::OrchestratorError;
use crate::models::network::{
    GatewaySpec, IngressRule, RouteTableSpec, RuleSource, SecurityGroupSpec, SubnetSpec, VpcSpec,
};
use crate::models::resource::{ResourceKind, ResourceRecord, ResourceSpec};

use super::{ec2_tag_filters, ec2_tag_spec, record, required_str, AwsCli};

/// First tagged resource matching the App/Name pair, if any.
async fn find_tagged(
    cli: &AwsCli,
    resource: &str,
    command: &str,
    root: &str,
    app: &str,
    name: &str,
) -> Result<Option<Value>, OrchestratorError> {
    let filters = ec2_tag_filters(app, name);
    let response = cli
        .run(resource, &["ec2", command, "--filters", &filters[0], &filters[1]])
        .await?;
    Ok(response
        .pointer(root)
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .cloned())
}

pub(super) async fn describe_vpc(
    cli: &AwsCli,
    app: &str,
    name: &str,
) -> Result<Option<ResourceRecord>, OrchestratorError> {
    let Some(vpc) = find_tagged(cli, name, "describe-vpcs", "/Vpcs", app, name).await? else {
        return Ok(None);
    };
    let vpc_id = required_str(&vpc, "/VpcId", name)?;

    let dns = cli
        .run(
            name,
            &["ec2", "describe-vpc-attribute", "--vpc-id", &vpc_id, "--attribute", "enableDnsHostnames"],
        )
        .await?;
    let dns_hostnames = dns
        .pointer("/EnableDnsHostnames/Value")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let attributes = json!({
        "kind": "vpc",
        "cidr": vpc.pointer("/CidrBlock").and_then(Value::as_str).unwrap_or_default(),
        "dns_hostnames": dns_hostnames,
    });
    Ok(Some(record(app, name, ResourceKind::Vpc, vpc_id, attributes)))
}

pub(super) async fn create_vpc(
    cli: &AwsCli,
    app: &str,
    name: &str,
    spec: &VpcSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    let created = cli
        .run(
            name,
            &[
                "ec2",
                "create-vpc",
                "--cidr-block",
                &spec.cidr,
                "--tag-specifications",
                &ec2_tag_spec("vpc", app, name),
            ],
        )
        .await?;
    let vpc_id = required_str(&created, "/Vpc/VpcId", name)?;

    if spec.dns_hostnames {
        cli.run(
            name,
            &["ec2", "modify-vpc-attribute", "--vpc-id", &vpc_id, "--enable-dns-hostnames", "Value=true"],
        )
        .await?;
    }

    let attributes = ResourceSpec::Vpc(spec.clone()).attributes()?;
    Ok(record(app, name, ResourceKind::Vpc, vpc_id, attributes))
}

pub(super) async fn update_vpc(
    cli: &AwsCli,
    current: &ResourceRecord,
    spec: &VpcSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    let value = if spec.dns_hostnames { "Value=true" } else { "Value=false" };
    cli.run(
        &current.name,
        &["ec2", "modify-vpc-attribute", "--vpc-id", &current.provider_id, "--enable-dns-hostnames", value],
    )
    .await?;

    let mut updated = current.clone();
    updated.attributes = ResourceSpec::Vpc(spec.clone()).attributes()?;
    Ok(updated)
}

pub(super) async fn delete_vpc(
    cli: &AwsCli,
    target: &ResourceRecord,
) -> Result<(), OrchestratorError> {
    cli.run(&target.name, &["ec2", "delete-vpc", "--vpc-id", &target.provider_id])
        .await?;
    Ok(())
}

pub(super) async fn describe_subnet(
    cli: &AwsCli,
    app: &str,
    name: &str,
) -> Result<Option<ResourceRecord>, OrchestratorError> {
    let Some(subnet) = find_tagged(cli, name, "describe-subnets", "/Subnets", app, name).await?
    else {
        return Ok(None);
    };
    let subnet_id = required_str(&subnet, "/SubnetId", name)?;

    let attributes = json!({
        "kind": "subnet",
        "vpc": subnet.pointer("/VpcId").and_then(Value::as_str).unwrap_or_default(),
        "zone": subnet.pointer("/AvailabilityZone").and_then(Value::as_str).unwrap_or_default(),
        "cidr": subnet.pointer("/CidrBlock").and_then(Value::as_str).unwrap_or_default(),
        "public": subnet.pointer("/MapPublicIpOnLaunch").and_then(Value::as_bool).unwrap_or(false),
    });
    Ok(Some(record(app, name, ResourceKind::Subnet, subnet_id, attributes)))
}

pub(super) async fn create_subnet(
    cli: &AwsCli,
    app: &str,
    name: &str,
    spec: &SubnetSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    let created = cli
        .run(
            name,
            &[
                "ec2",
                "create-subnet",
                "--vpc-id",
                &spec.vpc,
                "--cidr-block",
                &spec.cidr,
                "--availability-zone",
                &spec.zone,
                "--tag-specifications",
                &ec2_tag_spec("subnet", app, name),
            ],
        )
        .await?;
    let subnet_id = required_str(&created, "/Subnet/SubnetId", name)?;

    if spec.public {
        cli.run(
            name,
            &["ec2", "modify-subnet-attribute", "--subnet-id", &subnet_id, "--map-public-ip-on-launch"],
        )
        .await?;
    }

    let attributes = ResourceSpec::Subnet(spec.clone()).attributes()?;
    Ok(record(app, name, ResourceKind::Subnet, subnet_id, attributes))
}

pub(super) async fn update_subnet(
    cli: &AwsCli,
    current: &ResourceRecord,
    spec: &SubnetSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    let flag = if spec.public {
        "--map-public-ip-on-launch"
    } else {
        "--no-map-public-ip-on-launch"
    };
    cli.run(
        &current.name,
        &["ec2", "modify-subnet-attribute", "--subnet-id", &current.provider_id, flag],
    )
    .await?;

    let mut updated = current.clone();
    updated.attributes = ResourceSpec::Subnet(spec.clone()).attributes()?;
    Ok(updated)
}

pub(super) async fn delete_subnet(
    cli: &AwsCli,
    target: &ResourceRecord,
) -> Result<(), OrchestratorError> {
    cli.run(&target.name, &["ec2", "delete-subnet", "--subnet-id", &target.provider_id])
        .await?;
    Ok(())
}

pub(super) async fn describe_gateway(
    cli: &AwsCli,
    app: &str,
    name: &str,
) -> Result<Option<ResourceRecord>, OrchestratorError> {
    let Some(gateway) =
        find_tagged(cli, name, "describe-internet-gateways", "/InternetGateways", app, name).await?
    else {
        return Ok(None);
    };
    let gateway_id = required_str(&gateway, "/InternetGatewayId", name)?;

    let attributes = json!({
        "kind": "internet_gateway",
        "vpc": gateway.pointer("/Attachments/0/VpcId").and_then(Value::as_str).unwrap_or_default(),
    });
    Ok(Some(record(app, name, ResourceKind::InternetGateway, gateway_id, attributes)))
}

pub(super) async fn create_gateway(
    cli: &AwsCli,
    app: &str,
    name: &str,
    spec: &GatewaySpec,
) -> Result<ResourceRecord, OrchestratorError> {
    let created = cli
        .run(
            name,
            &[
                "ec2",
                "create-internet-gateway",
                "--tag-specifications",
                &ec2_tag_spec("internet-gateway", app, name),
            ],
        )
        .await?;
    let gateway_id = required_str(&created, "/InternetGateway/InternetGatewayId", name)?;

    cli.run(
        name,
        &["ec2", "attach-internet-gateway", "--internet-gateway-id", &gateway_id, "--vpc-id", &spec.vpc],
    )
    .await?;

    let attributes = ResourceSpec::InternetGateway(spec.clone()).attributes()?;
    Ok(record(app, name, ResourceKind::InternetGateway, gateway_id, attributes))
}

pub(super) async fn delete_gateway(
    cli: &AwsCli,
    target: &ResourceRecord,
) -> Result<(), OrchestratorError> {
    // Attachments come from a live lookup; orphan records carry no attributes.
    let described = cli
        .try_run(
            &target.name,
            &["ec2", "describe-internet-gateways", "--internet-gateway-ids", &target.provider_id],
        )
        .await?;
    let Some(described) = described else {
        return Ok(());
    };

    let attachments = described
        .pointer("/InternetGateways/0/Attachments")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for attachment in attachments {
        if let Some(vpc_id) = attachment.pointer("/VpcId").and_then(Value::as_str) {
            cli.run(
                &target.name,
                &[
                    "ec2",
                    "detach-internet-gateway",
                    "--internet-gateway-id",
                    &target.provider_id,
                    "--vpc-id",
                    vpc_id,
                ],
            )
            .await?;
        }
    }

    cli.run(
        &target.name,
        &["ec2", "delete-internet-gateway", "--internet-gateway-id", &target.provider_id],
    )
    .await?;
    Ok(())
}

pub(super) async fn describe_route_table(
    cli: &AwsCli,
    app: &str,
    name: &str,
) -> Result<Option<ResourceRecord>, OrchestratorError> {
    let Some(table) =
        find_tagged(cli, name, "describe-route-tables", "/RouteTables", app, name).await?
    else {
        return Ok(None);
    };
    let table_id = required_str(&table, "/RouteTableId", name)?;

    let gateway = table
        .pointer("/Routes")
        .and_then(Value::as_array)
        .and_then(|routes| {
            routes.iter().find(|r| {
                r.pointer("/DestinationCidrBlock").and_then(Value::as_str) == Some("0.0.0.0/0")
            })
        })
        .and_then(|r| r.pointer("/GatewayId"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    let mut subnets: Vec<String> = table
        .pointer("/Associations")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(|a| a.pointer("/SubnetId").and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    subnets.sort();

    let attributes = json!({
        "kind": "route_table",
        "vpc": table.pointer("/VpcId").and_then(Value::as_str).unwrap_or_default(),
        "gateway": gateway,
        "subnets": subnets,
    });
    Ok(Some(record(app, name, ResourceKind::RouteTable, table_id, attributes)))
}

pub(super) async fn create_route_table(
    cli: &AwsCli,
    app: &str,
    name: &str,
    spec: &RouteTableSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    let created = cli
        .run(
            name,
            &[
                "ec2",
                "create-route-table",
                "--vpc-id",
                &spec.vpc,
                "--tag-specifications",
                &ec2_tag_spec("route-table", app, name),
            ],
        )
        .await?;
    let table_id = required_str(&created, "/RouteTable/RouteTableId", name)?;

    cli.run(
        name,
        &[
            "ec2",
            "create-route",
            "--route-table-id",
            &table_id,
            "--destination-cidr-block",
            "0.0.0.0/0",
            "--gateway-id",
            &spec.gateway,
        ],
    )
    .await?;

    for subnet in &spec.subnets {
        cli.run(
            name,
            &["ec2", "associate-route-table", "--route-table-id", &table_id, "--subnet-id", subnet],
        )
        .await?;
    }

    let attributes = ResourceSpec::RouteTable(spec.clone()).attributes()?;
    Ok(record(app, name, ResourceKind::RouteTable, table_id, attributes))
}

pub(super) async fn update_route_table(
    cli: &AwsCli,
    current: &ResourceRecord,
    spec: &RouteTableSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    cli.run(
        &current.name,
        &[
            "ec2",
            "replace-route",
            "--route-table-id",
            &current.provider_id,
            "--destination-cidr-block",
            "0.0.0.0/0",
            "--gateway-id",
            &spec.gateway,
        ],
    )
    .await?;

    let described = cli
        .run(
            &current.name,
            &["ec2", "describe-route-tables", "--route-table-ids", &current.provider_id],
        )
        .await?;
    let associations = described
        .pointer("/RouteTables/0/Associations")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for association in &associations {
        let subnet = association.pointer("/SubnetId").and_then(Value::as_str);
        let association_id = association.pointer("/RouteTableAssociationId").and_then(Value::as_str);
        if let (Some(subnet), Some(id)) = (subnet, association_id) {
            if !spec.subnets.iter().any(|s| s == subnet) {
                cli.run(&current.name, &["ec2", "disassociate-route-table", "--association-id", id])
                    .await?;
            }
        }
    }

    for subnet in &spec.subnets {
        let associated = associations
            .iter()
            .any(|a| a.pointer("/SubnetId").and_then(Value::as_str) == Some(subnet.as_str()));
        if !associated {
            cli.run(
                &current.name,
                &[
                    "ec2",
                    "associate-route-table",
                    "--route-table-id",
                    &current.provider_id,
                    "--subnet-id",
                    subnet,
                ],
            )
            .await?;
        }
    }

    let mut updated = current.clone();
    updated.attributes = ResourceSpec::RouteTable(spec.clone()).attributes()?;
    Ok(updated)
}

pub(super) async fn delete_route_table(
    cli: &AwsCli,
    target: &ResourceRecord,
) -> Result<(), OrchestratorError> {
    let described = cli
        .try_run(
            &target.name,
            &["ec2", "describe-route-tables", "--route-table-ids", &target.provider_id],
        )
        .await?;
    let Some(described) = described else {
        return Ok(());
    };

    let associations = described
        .pointer("/RouteTables/0/Associations")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for association in associations {
        if association.pointer("/Main").and_then(Value::as_bool) == Some(true) {
            continue;
        }
        if let Some(id) = association.pointer("/RouteTableAssociationId").and_then(Value::as_str) {
            cli.run(&target.name, &["ec2", "disassociate-route-table", "--association-id", id])
                .await?;
        }
    }

    cli.run(
        &target.name,
        &["ec2", "delete-route-table", "--route-table-id", &target.provider_id],
    )
    .await?;
    Ok(())
}

/// Flatten EC2 `IpPermissions` into ingress rules, sorted for stable diffs.
fn ingress_from_permissions(permissions: &Value) -> Vec<IngressRule> {
    let mut rules = Vec::new();
    for permission in permissions.as_array().map(Vec::as_slice).unwrap_or_default() {
        let protocol = permission
            .pointer("/IpProtocol")
            .and_then(Value::as_str)
            .unwrap_or("tcp")
            .to_string();
        let port = permission
            .pointer("/FromPort")
            .and_then(Value::as_u64)
            .unwrap_or_default() as u16;

        for range in permission
            .pointer("/IpRanges")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            if let Some(cidr) = range.pointer("/CidrIp").and_then(Value::as_str) {
                rules.push(IngressRule {
                    protocol: protocol.clone(),
                    port,
                    source: RuleSource::Cidr(cidr.to_string()),
                });
            }
        }
        for pair in permission
            .pointer("/UserIdGroupPairs")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            if let Some(group) = pair.pointer("/GroupId").and_then(Value::as_str) {
                rules.push(IngressRule {
                    protocol: protocol.clone(),
                    port,
                    source: RuleSource::Group(group.to_string()),
                });
            }
        }
    }
    rules.sort_by_key(|r| (r.port, format!("{:?}", r.source)));
    rules
}

pub(super) async fn describe_security_group(
    cli: &AwsCli,
    app: &str,
    name: &str,
) -> Result<Option<ResourceRecord>, OrchestratorError> {
    let Some(group) =
        find_tagged(cli, name, "describe-security-groups", "/SecurityGroups", app, name).await?
    else {
        return Ok(None);
    };
    let group_id = required_str(&group, "/GroupId", name)?;
    let ingress = ingress_from_permissions(&group["IpPermissions"]);

    let attributes = json!({
        "kind": "security_group",
        "vpc": group.pointer("/VpcId").and_then(Value::as_str).unwrap_or_default(),
        "description": group.pointer("/Description").and_then(Value::as_str).unwrap_or_default(),
        "ingress": serde_json::to_value(ingress)?,
    });
    Ok(Some(record(app, name, ResourceKind::SecurityGroup, group_id, attributes)))
}

async fn authorize_ingress(
    cli: &AwsCli,
    name: &str,
    group_id: &str,
    rule: &IngressRule,
) -> Result<(), OrchestratorError> {
    let port = rule.port.to_string();
    let mut args = vec![
        "ec2",
        "authorize-security-group-ingress",
        "--group-id",
        group_id,
        "--protocol",
        &rule.protocol,
        "--port",
        &port,
    ];
    match &rule.source {
        RuleSource::Cidr(cidr) => {
            args.push("--cidr");
            args.push(cidr);
        }
        RuleSource::Group(group) => {
            args.push("--source-group");
            args.push(group);
        }
    }
    cli.run(name, &args).await?;
    Ok(())
}

pub(super) async fn create_security_group(
    cli: &AwsCli,
    app: &str,
    name: &str,
    spec: &SecurityGroupSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    let created = cli
        .run(
            name,
            &[
                "ec2",
                "create-security-group",
                "--group-name",
                name,
                "--description",
                &spec.description,
                "--vpc-id",
                &spec.vpc,
                "--tag-specifications",
                &ec2_tag_spec("security-group", app, name),
            ],
        )
        .await?;
    let group_id = required_str(&created, "/GroupId", name)?;

    for rule in &spec.ingress {
        authorize_ingress(cli, name, &group_id, rule).await?;
    }

    let attributes = ResourceSpec::SecurityGroup(spec.clone()).attributes()?;
    Ok(record(app, name, ResourceKind::SecurityGroup, group_id, attributes))
}

pub(super) async fn update_security_group(
    cli: &AwsCli,
    current: &ResourceRecord,
    spec: &SecurityGroupSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    let described = cli
        .run(
            &current.name,
            &["ec2", "describe-security-groups", "--group-ids", &current.provider_id],
        )
        .await?;
    let permissions = described
        .pointer("/SecurityGroups/0/IpPermissions")
        .cloned()
        .unwrap_or(Value::Null);

    if permissions.as_array().map(|p| !p.is_empty()).unwrap_or(false) {
        let permissions_json = serde_json::to_string(&permissions)?;
        cli.run(
            &current.name,
            &[
                "ec2",
                "revoke-security-group-ingress",
                "--group-id",
                &current.provider_id,
                "--ip-permissions",
                &permissions_json,
            ],
        )
        .await?;
    }

    for rule in &spec.ingress {
        authorize_ingress(cli, &current.name, &current.provider_id, rule).await?;
    }

    let mut updated = current.clone();
    updated.attributes = ResourceSpec::SecurityGroup(spec.clone()).attributes()?;
    Ok(updated)
}

pub(super) async fn delete_security_group(
    cli: &AwsCli,
    target: &ResourceRecord,
) -> Result<(), OrchestratorError> {
    cli.run(
        &target.name,
        &["ec2", "delete-security-group", "--group-id", &target.provider_id],
    )
    .await?;
    Ok(())
}
