//! `risectl history`

use std::path::Path;

use crate::artifacts::ArtifactStore;
use crate::config::Settings;
use crate::errors::OrchestratorError;

/// List recorded releases and deployments, oldest first.
pub async fn run(spec: &Path) -> Result<(), OrchestratorError> {
    let settings = Settings::load(spec).await?;
    let store = ArtifactStore::new(&settings.artifacts_dir);

    let records = store.history().await?;
    if records.is_empty() {
        println!("No releases or deployments recorded.");
        return Ok(());
    }

    for record in &records {
        println!(
            "{}  {:<7}  {:<8}  {}  {}",
            record.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            record.action,
            record.tag,
            record.revision.as_deref().unwrap_or("-"),
            record.image_uri
        );
    }
    Ok(())
}
