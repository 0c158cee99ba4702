//! `risectl apply`

use std::path::Path;

use crate::credentials::{print_credentials, write_credentials};
use crate::errors::OrchestratorError;

use super::{load, shutdown_signal};

/// Converge live infrastructure onto the spec. Safe to re-run and to
/// resume after an interrupted attempt.
pub async fn run(spec: &Path, credentials_out: Option<&Path>) -> Result<(), OrchestratorError> {
    let (engine, graph) = load(spec).await?;
    let outcome = engine.apply(&graph, Some(shutdown_signal())).await?;

    println!(
        "Apply complete: {} created, {} updated, {} unchanged, {} removed.",
        outcome.created.len(),
        outcome.updated.len(),
        outcome.unchanged.len(),
        outcome.removed.len()
    );

    // Minted once; gone from the provider's side after this.
    if let Some(pair) = &outcome.credentials {
        match credentials_out {
            Some(path) => {
                write_credentials(pair, path).await?;
                println!("Deployer credentials written to {} (owner-only).", path.display());
            }
            None => print_credentials(&engine.settings().app, pair),
        }
    }

    Ok(())
}
