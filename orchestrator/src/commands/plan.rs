//! `risectl plan`

use std::path::Path;

use crate::errors::OrchestratorError;

use super::load;

/// Print the diff between the spec and live state without changing
/// anything. Pending changes are not an error; the exit code is zero
/// unless the walk itself fails.
pub async fn run(spec: &Path) -> Result<(), OrchestratorError> {
    let (engine, graph) = load(spec).await?;
    let plan = engine.plan(&graph).await?;
    print!("{}", plan.render());
    Ok(())
}
