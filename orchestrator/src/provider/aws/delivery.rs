//! CI/CD wiring and deployer credentials: source connection, build
//! project, pipeline and the scoped IAM principal for external mode.
//!
//! The pipeline and build project need a service role, and the
//! pipeline an artifact bucket. Those are provider plumbing rather
//! than spec resources, so they stay untagged and are cleaned up when
//! their owner is deleted.

use std::collections::BTreeMap;

use secrecy::SecretString;
use serde_json::{json, Value};
use tracing::warn;

use crate::errors::OrchestratorError;
use crate::models::cicd::{
    BuildProjectSpec, CredentialSpec, PermissionSetSpec, PipelineSpec, SourceConnectionSpec,
};
use crate::models::resource::{ResourceKind, ResourceRecord, ResourceSpec};
use crate::provider::CredentialPair;

use super::{record, required_str, AwsCli};

pub(super) async fn describe_connection(
    cli: &AwsCli,
    app: &str,
    name: &str,
    physical: &str,
) -> Result<Option<ResourceRecord>, OrchestratorError> {
    let listed = cli.run(name, &["codestar-connections", "list-connections"]).await?;
    let Some(connection) = listed
        .pointer("/Connections")
        .and_then(Value::as_array)
        .and_then(|connections| {
            connections.iter().find(|c| {
                c.pointer("/ConnectionName").and_then(Value::as_str) == Some(physical)
            })
        })
    else {
        return Ok(None);
    };
    let arn = required_str(connection, "/ConnectionArn", name)?;

    let attributes = json!({
        "kind": "source_connection",
        "name": physical,
        "provider_type": connection
            .pointer("/ProviderType")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase(),
    });
    Ok(Some(record(app, name, ResourceKind::SourceConnection, arn, attributes)))
}

pub(super) async fn create_connection(
    cli: &AwsCli,
    app: &str,
    name: &str,
    spec: &SourceConnectionSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    let provider_type = match spec.provider_type.as_str() {
        "github" => "GitHub",
        other => other,
    };
    let created = cli
        .run(
            name,
            &[
                "codestar-connections",
                "create-connection",
                "--connection-name",
                &spec.name,
                "--provider-type",
                provider_type,
                "--tags",
                &format!("Key=App,Value={}", app),
                &format!("Key=Name,Value={}", name),
            ],
        )
        .await?;
    let arn = required_str(&created, "/ConnectionArn", name)?;

    // A fresh connection sits in PENDING until someone completes the
    // handshake in the console.
    warn!("connection {} requires a one-time authorization with the hosting provider", spec.name);

    let attributes = ResourceSpec::SourceConnection(spec.clone()).attributes()?;
    Ok(record(app, name, ResourceKind::SourceConnection, arn, attributes))
}

pub(super) async fn delete_connection(
    cli: &AwsCli,
    target: &ResourceRecord,
) -> Result<(), OrchestratorError> {
    cli.run(
        &target.name,
        &["codestar-connections", "delete-connection", "--connection-arn", &target.provider_id],
    )
    .await?;
    Ok(())
}

/// Render build commands into the fixed buildspec layout.
fn render_buildspec(commands: &[String]) -> String {
    let mut out = String::from("version: 0.2\nphases:\n  build:\n    commands:\n");
    for command in commands {
        out.push_str("      - ");
        out.push_str(command);
        out.push('\n');
    }
    out
}

/// Inverse of [`render_buildspec`]; anything else in the document is
/// not ours and is dropped.
fn parse_buildspec(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.strip_prefix("      - "))
        .map(str::to_string)
        .collect()
}

async fn ensure_service_role(
    cli: &AwsCli,
    resource: &str,
    role_name: &str,
    service: &str,
    policy: &Value,
) -> Result<String, OrchestratorError> {
    let arn = match cli.try_run(resource, &["iam", "get-role", "--role-name", role_name]).await? {
        Some(existing) => required_str(&existing, "/Role/Arn", resource)?,
        None => {
            let trust = json!({
                "Version": "2012-10-17",
                "Statement": [{
                    "Effect": "Allow",
                    "Principal": {"Service": format!("{}.amazonaws.com", service)},
                    "Action": "sts:AssumeRole",
                }],
            })
            .to_string();
            let created = cli
                .run(
                    resource,
                    &[
                        "iam",
                        "create-role",
                        "--role-name",
                        role_name,
                        "--assume-role-policy-document",
                        &trust,
                    ],
                )
                .await?;
            required_str(&created, "/Role/Arn", resource)?
        }
    };

    let policy_json = serde_json::to_string(policy)?;
    cli.run(
        resource,
        &[
            "iam",
            "put-role-policy",
            "--role-name",
            role_name,
            "--policy-name",
            "access",
            "--policy-document",
            &policy_json,
        ],
    )
    .await?;
    Ok(arn)
}

async fn delete_service_role(
    cli: &AwsCli,
    resource: &str,
    role_name: &str,
) -> Result<(), OrchestratorError> {
    cli.try_run(
        resource,
        &["iam", "delete-role-policy", "--role-name", role_name, "--policy-name", "access"],
    )
    .await?;
    cli.try_run(resource, &["iam", "delete-role", "--role-name", role_name]).await?;
    Ok(())
}

async fn artifact_bucket_name(cli: &AwsCli, app: &str) -> Result<String, OrchestratorError> {
    let account = cli.account_id().await?;
    Ok(format!("{}-risectl-artifacts-{}", app, account))
}

async fn ensure_artifact_bucket(
    cli: &AwsCli,
    resource: &str,
    app: &str,
) -> Result<String, OrchestratorError> {
    let bucket = artifact_bucket_name(cli, app).await?;
    let exists = cli
        .try_run(resource, &["s3api", "head-bucket", "--bucket", &bucket])
        .await?
        .is_some();
    if !exists {
        let mut args: Vec<String> =
            vec!["s3api".into(), "create-bucket".into(), "--bucket".into(), bucket.clone()];
        if cli.region() != "us-east-1" {
            args.push("--create-bucket-configuration".into());
            args.push(format!("LocationConstraint={}", cli.region()));
        }
        cli.run(resource, &args).await?;
    }
    Ok(bucket)
}

fn codebuild_policy(bucket_pattern: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Action": ["logs:CreateLogGroup", "logs:CreateLogStream", "logs:PutLogEvents"],
                "Resource": "*",
            },
            {
                "Effect": "Allow",
                "Action": ["ecr:GetAuthorizationToken"],
                "Resource": "*",
            },
            {
                "Effect": "Allow",
                "Action": [
                    "ecr:BatchCheckLayerAvailability",
                    "ecr:GetDownloadUrlForLayer",
                    "ecr:BatchGetImage",
                    "ecr:PutImage",
                    "ecr:InitiateLayerUpload",
                    "ecr:UploadLayerPart",
                    "ecr:CompleteLayerUpload",
                ],
                "Resource": "*",
            },
            {
                "Effect": "Allow",
                "Action": ["s3:GetObject", "s3:GetObjectVersion", "s3:PutObject"],
                "Resource": bucket_pattern,
            },
        ],
    })
}

fn pipeline_policy(bucket: &str) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Action": ["codebuild:StartBuild", "codebuild:BatchGetBuilds"],
                "Resource": "*",
            },
            {
                "Effect": "Allow",
                "Action": ["codestar-connections:UseConnection"],
                "Resource": "*",
            },
            {
                "Effect": "Allow",
                "Action": [
                    "ecs:DescribeServices",
                    "ecs:DescribeTaskDefinition",
                    "ecs:RegisterTaskDefinition",
                    "ecs:UpdateService",
                ],
                "Resource": "*",
            },
            {
                "Effect": "Allow",
                "Action": ["iam:PassRole"],
                "Resource": "*",
            },
            {
                "Effect": "Allow",
                "Action": ["s3:GetObject", "s3:GetObjectVersion", "s3:GetBucketVersioning", "s3:PutObject"],
                "Resource": [
                    format!("arn:aws:s3:::{}", bucket),
                    format!("arn:aws:s3:::{}/*", bucket),
                ],
            },
        ],
    })
}

fn build_role_name(project: &str) -> String {
    format!("{}-codebuild-role", project)
}

fn pipeline_role_name(pipeline: &str) -> String {
    format!("{}-pipeline-role", pipeline)
}

fn build_project_input(name: &str, spec: &BuildProjectSpec, role_arn: &str, app: &str) -> Value {
    let environment_variables: Vec<Value> = spec
        .environment
        .iter()
        .map(|(key, value)| json!({"name": key, "value": value, "type": "PLAINTEXT"}))
        .collect();

    json!({
        "name": spec.name,
        "source": {"type": "CODEPIPELINE", "buildspec": render_buildspec(&spec.build_commands)},
        "artifacts": {"type": "CODEPIPELINE"},
        "environment": {
            "type": "LINUX_CONTAINER",
            "image": "aws/codebuild/standard:7.0",
            "computeType": "BUILD_GENERAL1_SMALL",
            "privilegedMode": spec.privileged,
            "environmentVariables": environment_variables,
        },
        "serviceRole": role_arn,
        "tags": [
            {"key": "App", "value": app},
            {"key": "Name", "value": name},
        ],
    })
}

pub(super) async fn describe_build_project(
    cli: &AwsCli,
    app: &str,
    name: &str,
    physical: &str,
) -> Result<Option<ResourceRecord>, OrchestratorError> {
    let described = cli
        .run(name, &["codebuild", "batch-get-projects", "--names", physical])
        .await?;
    let Some(project) = described.pointer("/projects/0") else {
        return Ok(None);
    };
    let arn = required_str(project, "/arn", name)?;

    let build_commands = project
        .pointer("/source/buildspec")
        .and_then(Value::as_str)
        .map(parse_buildspec)
        .unwrap_or_default();

    let mut environment = BTreeMap::new();
    for variable in project
        .pointer("/environment/environmentVariables")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        let key = variable.pointer("/name").and_then(Value::as_str);
        let value = variable.pointer("/value").and_then(Value::as_str);
        if let (Some(key), Some(value)) = (key, value) {
            environment.insert(key.to_string(), value.to_string());
        }
    }

    let attributes = json!({
        "kind": "build_project",
        "name": physical,
        "build_commands": build_commands,
        "environment": environment,
        "privileged": project
            .pointer("/environment/privilegedMode")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    });
    Ok(Some(record(app, name, ResourceKind::BuildProject, arn, attributes)))
}

pub(super) async fn create_build_project(
    cli: &AwsCli,
    app: &str,
    name: &str,
    spec: &BuildProjectSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    let role_arn = ensure_service_role(
        cli,
        name,
        &build_role_name(&spec.name),
        "codebuild",
        &codebuild_policy("*"),
    )
    .await?;

    let input = build_project_input(name, spec, &role_arn, app);
    let input_json = serde_json::to_string(&input)?;
    let created = cli
        .run(name, &["codebuild", "create-project", "--cli-input-json", &input_json])
        .await?;
    let arn = required_str(&created, "/project/arn", name)?;

    let attributes = ResourceSpec::BuildProject(spec.clone()).attributes()?;
    Ok(record(app, name, ResourceKind::BuildProject, arn, attributes))
}

pub(super) async fn update_build_project(
    cli: &AwsCli,
    current: &ResourceRecord,
    spec: &BuildProjectSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    let role_arn = ensure_service_role(
        cli,
        &current.name,
        &build_role_name(&spec.name),
        "codebuild",
        &codebuild_policy("*"),
    )
    .await?;

    let mut input = build_project_input(&current.name, spec, &role_arn, &current.app);
    if let Some(map) = input.as_object_mut() {
        map.remove("tags");
    }
    let input_json = serde_json::to_string(&input)?;
    cli.run(&current.name, &["codebuild", "update-project", "--cli-input-json", &input_json])
        .await?;

    let mut updated = current.clone();
    updated.attributes = ResourceSpec::BuildProject(spec.clone()).attributes()?;
    Ok(updated)
}

pub(super) async fn delete_build_project(
    cli: &AwsCli,
    target: &ResourceRecord,
) -> Result<(), OrchestratorError> {
    let physical = target
        .provider_id
        .split_once("project/")
        .map(|(_, tail)| tail)
        .unwrap_or(&target.name)
        .to_string();
    cli.run(&target.name, &["codebuild", "delete-project", "--name", &physical]).await?;
    delete_service_role(cli, &target.name, &build_role_name(&physical)).await?;
    Ok(())
}

fn stage_action_config<'a>(pipeline: &'a Value, stage: &str) -> Option<&'a Value> {
    pipeline
        .pointer("/stages")
        .and_then(Value::as_array)?
        .iter()
        .find(|s| s.pointer("/name").and_then(Value::as_str) == Some(stage))?
        .pointer("/actions/0/configuration")
}

fn pipeline_input(spec: &PipelineSpec, role_arn: &str, bucket: &str, project_name: &str) -> Value {
    json!({
        "pipeline": {
            "name": spec.name,
            "roleArn": role_arn,
            "artifactStore": {"type": "S3", "location": bucket},
            "stages": [
                {
                    "name": "Source",
                    "actions": [{
                        "name": "Source",
                        "actionTypeId": {
                            "category": "Source",
                            "owner": "AWS",
                            "provider": "CodeStarSourceConnection",
                            "version": "1",
                        },
                        "configuration": {
                            "ConnectionArn": spec.connection,
                            "FullRepositoryId": spec.repository_id,
                            "BranchName": spec.branch,
                        },
                        "outputArtifacts": [{"name": "source_output"}],
                    }],
                },
                {
                    "name": "Build",
                    "actions": [{
                        "name": "Build",
                        "actionTypeId": {
                            "category": "Build",
                            "owner": "AWS",
                            "provider": "CodeBuild",
                            "version": "1",
                        },
                        "configuration": {"ProjectName": project_name},
                        "inputArtifacts": [{"name": "source_output"}],
                        "outputArtifacts": [{"name": "build_output"}],
                    }],
                },
                {
                    "name": "Deploy",
                    "actions": [{
                        "name": "Deploy",
                        "actionTypeId": {
                            "category": "Deploy",
                            "owner": "AWS",
                            "provider": "ECS",
                            "version": "1",
                        },
                        "configuration": {
                            "ClusterName": spec.cluster,
                            "ServiceName": spec.service,
                            "FileName": spec.manifest_file,
                        },
                        "inputArtifacts": [{"name": "build_output"}],
                    }],
                },
            ],
        },
    })
}

pub(super) async fn describe_pipeline(
    cli: &AwsCli,
    app: &str,
    name: &str,
    physical: &str,
) -> Result<Option<ResourceRecord>, OrchestratorError> {
    let Some(described) = cli
        .try_run(name, &["codepipeline", "get-pipeline", "--name", physical])
        .await?
    else {
        return Ok(None);
    };
    let pipeline = &described["pipeline"];
    let arn = match described.pointer("/metadata/pipelineArn").and_then(Value::as_str) {
        Some(arn) => arn.to_string(),
        None => format!(
            "arn:aws:codepipeline:{}:{}:{}",
            cli.region(),
            cli.account_id().await?,
            physical
        ),
    };

    let source = stage_action_config(pipeline, "Source");
    let build = stage_action_config(pipeline, "Build");
    let deploy = stage_action_config(pipeline, "Deploy");

    let project_name = build
        .and_then(|c| c.pointer("/ProjectName"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let build_project_arn = if project_name.is_empty() {
        String::new()
    } else {
        format!(
            "arn:aws:codebuild:{}:{}:project/{}",
            cli.region(),
            cli.account_id().await?,
            project_name
        )
    };

    let config_str = |config: Option<&Value>, key: &str| {
        config
            .and_then(|c| c.pointer(&format!("/{}", key)))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let attributes = json!({
        "kind": "pipeline",
        "name": physical,
        "connection": config_str(source, "ConnectionArn"),
        "repository_id": config_str(source, "FullRepositoryId"),
        "branch": config_str(source, "BranchName"),
        "build_project": build_project_arn,
        "cluster": config_str(deploy, "ClusterName"),
        "service": config_str(deploy, "ServiceName"),
        "manifest_file": config_str(deploy, "FileName"),
    });
    Ok(Some(record(app, name, ResourceKind::Pipeline, arn, attributes)))
}

pub(super) async fn create_pipeline(
    cli: &AwsCli,
    app: &str,
    name: &str,
    spec: &PipelineSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    let bucket = ensure_artifact_bucket(cli, name, app).await?;
    let role_arn = ensure_service_role(
        cli,
        name,
        &pipeline_role_name(&spec.name),
        "codepipeline",
        &pipeline_policy(&bucket),
    )
    .await?;

    let project_name = spec
        .build_project
        .split_once("project/")
        .map(|(_, tail)| tail)
        .unwrap_or(&spec.build_project);

    let mut input = pipeline_input(spec, &role_arn, &bucket, project_name);
    if let Some(map) = input.as_object_mut() {
        map.insert(
            "tags".to_string(),
            json!([
                {"key": "App", "value": app},
                {"key": "Name", "value": name},
            ]),
        );
    }
    let input_json = serde_json::to_string(&input)?;
    cli.run(name, &["codepipeline", "create-pipeline", "--cli-input-json", &input_json])
        .await?;

    let arn = format!(
        "arn:aws:codepipeline:{}:{}:{}",
        cli.region(),
        cli.account_id().await?,
        spec.name
    );
    let attributes = ResourceSpec::Pipeline(spec.clone()).attributes()?;
    Ok(record(app, name, ResourceKind::Pipeline, arn, attributes))
}

pub(super) async fn update_pipeline(
    cli: &AwsCli,
    current: &ResourceRecord,
    spec: &PipelineSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    let bucket = artifact_bucket_name(cli, &current.app).await?;
    let role_arn = ensure_service_role(
        cli,
        &current.name,
        &pipeline_role_name(&spec.name),
        "codepipeline",
        &pipeline_policy(&bucket),
    )
    .await?;

    let project_name = spec
        .build_project
        .split_once("project/")
        .map(|(_, tail)| tail)
        .unwrap_or(&spec.build_project);

    let input = pipeline_input(spec, &role_arn, &bucket, project_name);
    let input_json = serde_json::to_string(&input)?;
    cli.run(&current.name, &["codepipeline", "update-pipeline", "--cli-input-json", &input_json])
        .await?;

    let mut updated = current.clone();
    updated.attributes = ResourceSpec::Pipeline(spec.clone()).attributes()?;
    Ok(updated)
}

pub(super) async fn delete_pipeline(
    cli: &AwsCli,
    target: &ResourceRecord,
) -> Result<(), OrchestratorError> {
    let physical = target.provider_id.rsplit(':').next().unwrap_or(&target.name).to_string();
    cli.run(&target.name, &["codepipeline", "delete-pipeline", "--name", &physical]).await?;
    delete_service_role(cli, &target.name, &pipeline_role_name(&physical)).await?;

    let bucket = artifact_bucket_name(cli, &target.app).await?;
    cli.try_run(&target.name, &["s3", "rb", &format!("s3://{}", bucket), "--force"]).await?;
    Ok(())
}

/// Permission sets come back from IAM in listing order; pin them to the
/// order the planner emits so diffs stay quiet.
fn permission_set_rank(name: &str) -> usize {
    ["registry-push-pull", "service-update-describe", "execution-role-assumption"]
        .iter()
        .position(|n| *n == name)
        .unwrap_or(usize::MAX)
}

fn permission_set_document(set: &PermissionSetSpec) -> Value {
    let (account_level, scoped): (Vec<&String>, Vec<&String>) = set
        .actions
        .iter()
        .partition(|action| action.as_str() == "ecr:GetAuthorizationToken");

    let mut statements = Vec::new();
    // Registry auth tokens are account-scoped; everything else pins to
    // the target resource.
    if !account_level.is_empty() {
        statements.push(json!({
            "Effect": "Allow",
            "Action": account_level,
            "Resource": "*",
        }));
    }
    if !scoped.is_empty() {
        statements.push(json!({
            "Effect": "Allow",
            "Action": scoped,
            "Resource": [set.target],
        }));
    }
    json!({"Version": "2012-10-17", "Statement": statements})
}

fn statement_actions(statement: &Value) -> Vec<String> {
    match statement.pointer("/Action") {
        Some(Value::String(action)) => vec![action.clone()],
        Some(Value::Array(actions)) => {
            actions.iter().filter_map(Value::as_str).map(str::to_string).collect()
        }
        _ => Vec::new(),
    }
}

fn statement_target(statement: &Value) -> Option<String> {
    match statement.pointer("/Resource") {
        Some(Value::String(resource)) if resource != "*" => Some(resource.clone()),
        Some(Value::Array(resources)) => resources
            .iter()
            .filter_map(Value::as_str)
            .find(|r| *r != "*")
            .map(str::to_string),
        _ => None,
    }
}

pub(super) async fn describe_credential(
    cli: &AwsCli,
    app: &str,
    name: &str,
    principal: &str,
) -> Result<Option<ResourceRecord>, OrchestratorError> {
    let Some(user) = cli.try_run(name, &["iam", "get-user", "--user-name", principal]).await?
    else {
        return Ok(None);
    };
    let arn = required_str(&user, "/User/Arn", name)?;

    let listed = cli
        .run(name, &["iam", "list-user-policies", "--user-name", principal])
        .await?;
    let policy_names: Vec<String> = listed
        .pointer("/PolicyNames")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();

    let mut permission_sets = Vec::new();
    for policy_name in &policy_names {
        let policy = cli
            .run(
                name,
                &[
                    "iam",
                    "get-user-policy",
                    "--user-name",
                    principal,
                    "--policy-name",
                    policy_name,
                ],
            )
            .await?;
        let statements = policy
            .pointer("/PolicyDocument/Statement")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut actions = Vec::new();
        let mut target = String::new();
        for statement in &statements {
            actions.extend(statement_actions(statement));
            if let Some(found) = statement_target(statement) {
                target = found;
            }
        }
        permission_sets.push(PermissionSetSpec { name: policy_name.clone(), actions, target });
    }
    permission_sets.sort_by_key(|set| (permission_set_rank(&set.name), set.name.clone()));

    let attributes = json!({
        "kind": "credential",
        "principal": principal,
        "permission_sets": serde_json::to_value(permission_sets)?,
    });
    Ok(Some(record(app, name, ResourceKind::Credential, arn, attributes)))
}

pub(super) async fn create_credential(
    cli: &AwsCli,
    app: &str,
    name: &str,
    spec: &CredentialSpec,
) -> Result<(ResourceRecord, CredentialPair), OrchestratorError> {
    let created = cli
        .run(
            name,
            &[
                "iam",
                "create-user",
                "--user-name",
                &spec.principal,
                "--tags",
                &format!("Key=App,Value={}", app),
                &format!("Key=Name,Value={}", name),
            ],
        )
        .await?;
    let arn = required_str(&created, "/User/Arn", name)?;

    for set in &spec.permission_sets {
        let document = serde_json::to_string(&permission_set_document(set))?;
        cli.run(
            name,
            &[
                "iam",
                "put-user-policy",
                "--user-name",
                &spec.principal,
                "--policy-name",
                &set.name,
                "--policy-document",
                &document,
            ],
        )
        .await?;
    }

    let key = cli
        .run(name, &["iam", "create-access-key", "--user-name", &spec.principal])
        .await?;
    let pair = CredentialPair {
        access_key_id: required_str(&key, "/AccessKey/AccessKeyId", name)?,
        secret: SecretString::from(required_str(&key, "/AccessKey/SecretAccessKey", name)?),
    };

    let attributes = ResourceSpec::Credential(spec.clone()).attributes()?;
    Ok((record(app, name, ResourceKind::Credential, arn, attributes), pair))
}

pub(super) async fn update_credential(
    cli: &AwsCli,
    current: &ResourceRecord,
    spec: &CredentialSpec,
) -> Result<ResourceRecord, OrchestratorError> {
    for set in &spec.permission_sets {
        let document = serde_json::to_string(&permission_set_document(set))?;
        cli.run(
            &current.name,
            &[
                "iam",
                "put-user-policy",
                "--user-name",
                &spec.principal,
                "--policy-name",
                &set.name,
                "--policy-document",
                &document,
            ],
        )
        .await?;
    }

    let listed = cli
        .run(&current.name, &["iam", "list-user-policies", "--user-name", &spec.principal])
        .await?;
    for policy_name in listed
        .pointer("/PolicyNames")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(Value::as_str)
    {
        if !spec.permission_sets.iter().any(|set| set.name == policy_name) {
            cli.run(
                &current.name,
                &[
                    "iam",
                    "delete-user-policy",
                    "--user-name",
                    &spec.principal,
                    "--policy-name",
                    policy_name,
                ],
            )
            .await?;
        }
    }

    let mut updated = current.clone();
    updated.attributes = ResourceSpec::Credential(spec.clone()).attributes()?;
    Ok(updated)
}

pub(super) async fn delete_credential(
    cli: &AwsCli,
    target: &ResourceRecord,
) -> Result<(), OrchestratorError> {
    let principal = target
        .provider_id
        .split_once("user/")
        .map(|(_, tail)| tail)
        .or_else(|| target.attributes.pointer("/principal").and_then(Value::as_str))
        .unwrap_or(&target.name)
        .to_string();

    let keys = cli
        .run(&target.name, &["iam", "list-access-keys", "--user-name", &principal])
        .await?;
    for key in keys
        .pointer("/AccessKeyMetadata")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        if let Some(key_id) = key.pointer("/AccessKeyId").and_then(Value::as_str) {
            cli.run(
                &target.name,
                &[
                    "iam",
                    "delete-access-key",
                    "--user-name",
                    &principal,
                    "--access-key-id",
                    key_id,
                ],
            )
            .await?;
        }
    }

    let policies = cli
        .run(&target.name, &["iam", "list-user-policies", "--user-name", &principal])
        .await?;
    for policy_name in policies
        .pointer("/PolicyNames")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .filter_map(Value::as_str)
    {
        cli.run(
            &target.name,
            &["iam", "delete-user-policy", "--user-name", &principal, "--policy-name", policy_name],
        )
        .await?;
    }

    cli.run(&target.name, &["iam", "delete-user", "--user-name", &principal]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buildspec_round_trip() {
        let commands = vec![
            "docker build -t $URI:$TAG .".to_string(),
            "docker push $URI:$TAG".to_string(),
        ];
        let rendered = render_buildspec(&commands);
        assert!(rendered.starts_with("version: 0.2\n"));
        assert_eq!(parse_buildspec(&rendered), commands);
    }

    #[test]
    fn test_registry_policy_splits_account_level_actions() {
        let set = PermissionSetSpec::registry_push_pull("arn:aws:ecr:us-east-1:123:repository/rise-app");
        let document = permission_set_document(&set);

        let statements = document.pointer("/Statement").and_then(Value::as_array).unwrap();
        assert_eq!(statements.len(), 2);
        assert_eq!(
            statements[0].pointer("/Resource").and_then(Value::as_str),
            Some("*")
        );
        assert_eq!(
            statements[0].pointer("/Action/0").and_then(Value::as_str),
            Some("ecr:GetAuthorizationToken")
        );
        assert_eq!(
            statements[1].pointer("/Resource/0").and_then(Value::as_str),
            Some("arn:aws:ecr:us-east-1:123:repository/rise-app")
        );
    }

    #[test]
    fn test_scoped_policy_has_single_statement() {
        let set = PermissionSetSpec::service_update_describe("arn:aws:ecs:us-east-1:123:service/c/s");
        let document = permission_set_document(&set);
        let statements = document.pointer("/Statement").and_then(Value::as_array).unwrap();
        assert_eq!(statements.len(), 1);
        assert_eq!(
            statements[0].pointer("/Resource/0").and_then(Value::as_str),
            Some("arn:aws:ecs:us-east-1:123:service/c/s")
        );
    }

    #[test]
    fn test_permission_set_rank_follows_planner_order() {
        let mut names = vec![
            "execution-role-assumption".to_string(),
            "registry-push-pull".to_string(),
            "service-update-describe".to_string(),
        ];
        names.sort_by_key(|n| permission_set_rank(n));
        assert_eq!(
            names,
            vec!["registry-push-pull", "service-update-describe", "execution-role-assumption"]
        );
    }
}
