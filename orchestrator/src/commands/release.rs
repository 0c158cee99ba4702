//! `risectl release`

use std::path::Path;

use crate::artifacts::ArtifactStore;
use crate::errors::OrchestratorError;
use crate::models::artifact::RecordAction;
use crate::release::{release, ImageBuilder};

use super::{load, registry_uri};

/// Build the image from the context directory and push it to the app
/// repository under the revision tag and `latest`, then write the
/// artifact manifest and tag file.
pub async fn run(
    spec: &Path,
    context: &Path,
    revision: Option<String>,
    registry: Option<String>,
) -> Result<(), OrchestratorError> {
    let (engine, graph) = load(spec).await?;
    // Inside the managed build the registry arrives via environment;
    // everywhere else it comes from the applied repository.
    let registry = match registry {
        Some(uri) => uri,
        None => registry_uri(&engine, &graph).await?,
    };
    let settings = engine.settings();

    let builder = ImageBuilder::new(&settings.region);
    let released = release(&builder, &registry, context, revision).await?;

    let store = ArtifactStore::new(&settings.artifacts_dir);
    let manifest = store.write_manifest(&settings.app, &released.image_uri).await?;
    let tag_file = store.write_tag(&released.tag).await?;
    store
        .record(
            RecordAction::Release,
            &released.tag,
            &released.image_uri,
            released.revision.clone(),
        )
        .await?;

    println!("Released {} (tag {}).", released.image_uri, released.tag);
    println!("Wrote {} and {}.", manifest.display(), tag_file.display());
    Ok(())
}
