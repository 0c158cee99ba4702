//! CI/CD layer models: source connection, build project, pipeline,
//! and the scoped credential used by external deployment systems

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::OrchestratorError;

/// Connection to a source hosting provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConnectionSpec {
    /// Connection name
    pub name: String,

    /// Hosting provider type ("github")
    pub provider_type: String,
}

/// Managed build project descriptor. Source comes from the pipeline, so
/// the project itself carries only the build recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildProjectSpec {
    /// Project name
    pub name: String,

    /// Shell commands the build runs, in order
    pub build_commands: Vec<String>,

    /// Build environment variables
    pub environment: BTreeMap<String, String>,

    /// Whether builds may talk to the container daemon
    pub privileged: bool,
}

/// Managed pipeline descriptor: Source -> Build -> Deploy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Pipeline name
    pub name: String,

    /// Reference to the source connection
    pub connection: String,

    /// Repository identifier ("owner/repo") for the source stage
    pub repository_id: String,

    /// Branch the pipeline watches
    pub branch: String,

    /// Reference to the build project
    pub build_project: String,

    /// Cluster name the deploy stage targets
    pub cluster: String,

    /// Service name the deploy stage updates
    pub service: String,

    /// Artifact manifest file the deploy stage consumes
    pub manifest_file: String,
}

/// Credential principal for external deployment systems
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialSpec {
    /// Principal name
    pub principal: String,

    /// Permission sets the principal is scoped to, nothing broader
    pub permission_sets: Vec<PermissionSetSpec>,
}

/// A named set of allowed actions scoped to one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionSetSpec {
    /// Permission set name
    pub name: String,

    /// Allowed actions
    pub actions: Vec<String>,

    /// Reference to the resource the actions are scoped to
    pub target: String,
}

impl PermissionSetSpec {
    /// Push and pull access to the application repository.
    pub fn registry_push_pull(repository: &str) -> Self {
        Self {
            name: "registry-push-pull".to_string(),
            actions: vec![
                "ecr:GetAuthorizationToken".to_string(),
                "ecr:BatchCheckLayerAvailability".to_string(),
                "ecr:GetDownloadUrlForLayer".to_string(),
                "ecr:BatchGetImage".to_string(),
                "ecr:PutImage".to_string(),
                "ecr:InitiateLayerUpload".to_string(),
                "ecr:UploadLayerPart".to_string(),
                "ecr:CompleteLayerUpload".to_string(),
            ],
            target: repository.to_string(),
        }
    }

    /// Update and describe access to the application service.
    pub fn service_update_describe(service: &str) -> Self {
        Self {
            name: "service-update-describe".to_string(),
            actions: vec![
                "ecs:UpdateService".to_string(),
                "ecs:DescribeServices".to_string(),
            ],
            target: service.to_string(),
        }
    }

    /// Assumption of the compute execution role.
    pub fn execution_role_assumption(role: &str) -> Self {
        Self {
            name: "execution-role-assumption".to_string(),
            actions: vec![
                "sts:AssumeRole".to_string(),
                "iam:PassRole".to_string(),
            ],
            target: role.to_string(),
        }
    }
}

/// Default build commands for the managed build project. Mirrors the
/// release workflow: login, resolve tag, build, push both tags, emit
/// the artifact manifest and tag file.
pub fn default_build_commands() -> Vec<String> {
    vec![
        "aws ecr get-login-password --region $RISECTL_REGION | docker login --username AWS --password-stdin $RISECTL_REGISTRY_URI".to_string(),
        "TAG=$(echo $CODEBUILD_RESOLVED_SOURCE_VERSION | cut -c1-7); if [ -z \"$TAG\" ]; then TAG=latest; fi".to_string(),
        "docker build -t $RISECTL_REGISTRY_URI:$TAG .".to_string(),
        "docker tag $RISECTL_REGISTRY_URI:$TAG $RISECTL_REGISTRY_URI:latest".to_string(),
        "docker push $RISECTL_REGISTRY_URI:$TAG".to_string(),
        "docker push $RISECTL_REGISTRY_URI:latest".to_string(),
        "printf '[{\"name\":\"%s\",\"imageUri\":\"%s\"}]' \"$RISECTL_APP\" \"$RISECTL_REGISTRY_URI:$TAG\" > imagedefinitions.json".to_string(),
        "echo $TAG > image_tag.txt".to_string(),
    ]
}

/// Extract the "owner/repo" identifier a source stage needs from a
/// repository URL such as "https://github.com/rise/rise-app.git".
pub fn repository_full_id(repository: &str) -> Result<String, OrchestratorError> {
    let url = Url::parse(repository).map_err(|_| {
        OrchestratorError::ConfigError(format!("invalid repository URL '{}'", repository))
    })?;

    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    match segments.as_slice() {
        [owner, repo] => Ok(format!("{}/{}", owner, repo.trim_end_matches(".git"))),
        _ => Err(OrchestratorError::ConfigError(format!(
            "repository URL '{}' does not end in owner/repo",
            repository
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_permission_sets() {
        let sets = vec![
            PermissionSetSpec::registry_push_pull("rise-app-repository"),
            PermissionSetSpec::service_update_describe("rise-app-service"),
            PermissionSetSpec::execution_role_assumption("rise-app-execution-role"),
        ];

        assert_eq!(sets.len(), 3);
        assert!(sets[0].actions.iter().any(|a| a == "ecr:PutImage"));
        assert!(sets[0].actions.iter().any(|a| a == "ecr:BatchGetImage"));
        assert_eq!(sets[1].actions, vec!["ecs:UpdateService", "ecs:DescribeServices"]);
        assert_eq!(sets[2].target, "rise-app-execution-role");
    }

    #[test]
    fn test_repository_full_id() {
        assert_eq!(
            repository_full_id("https://github.com/rise/rise-app.git").unwrap(),
            "rise/rise-app"
        );
        assert_eq!(
            repository_full_id("https://github.com/rise/rise-app").unwrap(),
            "rise/rise-app"
        );
        assert!(repository_full_id("https://github.com/rise").is_err());
        assert!(repository_full_id("not a url").is_err());
    }
}
