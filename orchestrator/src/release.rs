//! Image release workflow: resolve the source revision, build the
//! container image, and push it to the application repository under
//! both the revision tag and `latest`.

use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

use crate::errors::OrchestratorError;

/// What a release produced
#[derive(Debug, Clone)]
pub struct Release {
    /// Resolved image tag
    pub tag: String,

    /// Source revision the tag was derived from, if any
    pub revision: Option<String>,

    /// Full image reference under the revision tag
    pub image_uri: String,

    /// Full image reference under `latest`
    pub latest_uri: String,
}

/// Resolve the source revision of a build context via git.
pub async fn resolve_revision(context: &Path) -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(context)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let revision = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!revision.is_empty()).then_some(revision)
}

/// Derive the image tag from a source revision: the first seven hex
/// characters, or `latest` when no revision resolved.
pub fn resolve_tag(revision: Option<&str>) -> String {
    match revision {
        Some(rev) if rev.len() >= 7 && rev.chars().all(|c| c.is_ascii_hexdigit()) => {
            rev[..7].to_ascii_lowercase()
        }
        _ => "latest".to_string(),
    }
}

/// Shells out to docker for builds and pushes
pub struct ImageBuilder {
    region: String,
}

impl ImageBuilder {
    pub fn new(region: impl Into<String>) -> Self {
        Self { region: region.into() }
    }

    /// Authenticate the docker daemon against the registry. The login
    /// token travels over stdin and is never logged.
    pub async fn login(&self, registry_uri: &str) -> Result<(), OrchestratorError> {
        let registry = registry_uri.split('/').next().unwrap_or(registry_uri);

        let token = Command::new("aws")
            .args(["ecr", "get-login-password", "--region", &self.region])
            .output()
            .await
            .map_err(|e| OrchestratorError::BuildError(format!("failed to run aws: {}", e)))?;
        if !token.status.success() {
            return Err(OrchestratorError::BuildError(format!(
                "registry token request failed: {}",
                String::from_utf8_lossy(&token.stderr).trim()
            )));
        }

        let mut login = Command::new("docker")
            .args(["login", "--username", "AWS", "--password-stdin", registry])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| OrchestratorError::BuildError(format!("failed to run docker: {}", e)))?;

        if let Some(mut stdin) = login.stdin.take() {
            stdin.write_all(&token.stdout).await?;
            stdin.shutdown().await?;
        }

        let output = login.wait_with_output().await?;
        if !output.status.success() {
            return Err(OrchestratorError::BuildError(format!(
                "docker login to {} failed: {}",
                registry,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!("logged in to {}", registry);
        Ok(())
    }

    /// Build the image, streaming docker output to the terminal.
    pub async fn build(&self, image: &str, context: &Path) -> Result<(), OrchestratorError> {
        info!("building {}", image);
        let status = Command::new("docker")
            .args(["build", "-t", image])
            .arg(context)
            .status()
            .await
            .map_err(|e| OrchestratorError::BuildError(format!("failed to run docker: {}", e)))?;
        if !status.success() {
            return Err(OrchestratorError::BuildError(format!("docker build of {} failed", image)));
        }
        Ok(())
    }

    pub async fn tag(&self, from: &str, to: &str) -> Result<(), OrchestratorError> {
        let status = Command::new("docker")
            .args(["tag", from, to])
            .status()
            .await
            .map_err(|e| OrchestratorError::BuildError(format!("failed to run docker: {}", e)))?;
        if !status.success() {
            return Err(OrchestratorError::BuildError(format!("docker tag {} failed", to)));
        }
        Ok(())
    }

    pub async fn push(&self, image: &str) -> Result<(), OrchestratorError> {
        info!("pushing {}", image);
        let status = Command::new("docker")
            .args(["push", image])
            .status()
            .await
            .map_err(|e| OrchestratorError::BuildError(format!("failed to run docker: {}", e)))?;
        if !status.success() {
            return Err(OrchestratorError::BuildError(format!("docker push of {} failed", image)));
        }
        Ok(())
    }
}

/// Build and publish one release: login, build, push the revision tag
/// and `latest`.
pub async fn release(
    builder: &ImageBuilder,
    registry_uri: &str,
    context: &Path,
    revision_override: Option<String>,
) -> Result<Release, OrchestratorError> {
    let revision = match revision_override {
        Some(rev) => Some(rev),
        None => resolve_revision(context).await,
    };
    let tag = resolve_tag(revision.as_deref());
    let image_uri = format!("{}:{}", registry_uri, tag);
    let latest_uri = format!("{}:latest", registry_uri);

    builder.login(registry_uri).await?;
    builder.build(&image_uri, context).await?;

    if tag != "latest" {
        builder.tag(&image_uri, &latest_uri).await?;
    }
    builder.push(&image_uri).await?;
    if tag != "latest" {
        builder.push(&latest_uri).await?;
    }

    info!("released {} (tag {})", registry_uri, tag);
    Ok(Release { tag, revision, image_uri, latest_uri })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_is_first_seven_hex_chars() {
        assert_eq!(resolve_tag(Some("a1b2c3d4e5")), "a1b2c3d");
        assert_eq!(
            resolve_tag(Some("9f8e7d6c5b4a39281706f5e4d3c2b1a098765432")),
            "9f8e7d6"
        );
    }

    #[test]
    fn test_unresolved_revision_falls_back_to_latest() {
        assert_eq!(resolve_tag(None), "latest");
        assert_eq!(resolve_tag(Some("")), "latest");
        assert_eq!(resolve_tag(Some("abc")), "latest");
        assert_eq!(resolve_tag(Some("not-a-revision!")), "latest");
    }

    #[test]
    fn test_tag_is_lowercased() {
        assert_eq!(resolve_tag(Some("A1B2C3D4E5")), "a1b2c3d");
    }
}
