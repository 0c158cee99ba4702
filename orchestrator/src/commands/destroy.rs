//! `risectl destroy`

use std::path::Path;

use crate::errors::OrchestratorError;

use super::{load, shutdown_signal};

/// Tear down everything the spec manages, dependents first. Resources
/// that are already gone are skipped.
pub async fn run(spec: &Path) -> Result<(), OrchestratorError> {
    let (engine, graph) = load(spec).await?;
    let outcome = engine.destroy(&graph, Some(shutdown_signal())).await?;

    println!(
        "Destroy complete: {} removed, {} already gone.",
        outcome.removed.len(),
        outcome.skipped.len()
    );
    Ok(())
}
