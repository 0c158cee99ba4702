//! `risectl deploy`

use std::path::Path;

use crate::artifacts::ArtifactStore;
use crate::config::Settings;
use crate::errors::OrchestratorError;
use crate::fsio::File;
use crate::models::artifact::{RecordAction, TAG_FILE};
use crate::planner::{cluster_name, service_name};
use crate::rollout::{wait_for_stable, RolloutOptions};

use super::{load, registry_uri};

/// Point the service at a released image and wait for the rollout to
/// stabilize.
pub async fn run(spec: &Path, tag: Option<String>, no_wait: bool) -> Result<(), OrchestratorError> {
    let (engine, graph) = load(spec).await?;
    let registry = registry_uri(&engine, &graph).await?;
    let settings = engine.settings().clone();

    let tag = match tag {
        Some(tag) => tag,
        None => last_released_tag(&settings).await?,
    };
    let image = format!("{}:{}", registry, tag);

    let cluster = cluster_name(&settings.app);
    let service = service_name(&settings.app);
    engine.set_service_image(&cluster, &service, &image).await?;
    println!("Service {} is rolling out {}.", service, image);

    let store = ArtifactStore::new(&settings.artifacts_dir);
    store.record(RecordAction::Deploy, &tag, &image, None).await?;

    if no_wait {
        return Ok(());
    }

    let options = RolloutOptions::from(&settings.timeouts);
    let health =
        wait_for_stable(engine.provider().as_ref(), &cluster, &service, &image, &options).await?;
    println!("Rollout stable: {}/{} tasks healthy.", health.healthy, health.desired);
    Ok(())
}

/// Tag of the most recent release, from the tag file in the artifacts
/// directory.
async fn last_released_tag(settings: &Settings) -> Result<String, OrchestratorError> {
    let file = File::new(settings.artifacts_dir.join(TAG_FILE));
    if !file.exists().await {
        return Err(OrchestratorError::ConfigError(
            "no tag given and no prior release found; pass --tag or run release first".to_string(),
        ));
    }
    Ok(file.read_string().await?.trim().to_string())
}
