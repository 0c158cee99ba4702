//! Command handlers behind the CLI verbs

pub mod apply;
pub mod deploy;
pub mod destroy;
pub mod history;
pub mod plan;
pub mod release;
pub mod status;

use std::path::Path;

use serde_json::Value;
use tracing::info;

use crate::config::Settings;
use crate::engine::{Engine, Shutdown};
use crate::errors::OrchestratorError;
use crate::graph::ResourceGraph;
use crate::planner::{desired_graph, repository_name};
use crate::provider::create_provider;

/// Load the spec, expand it, and stand up the engine.
pub(crate) async fn load(spec: &Path) -> Result<(Engine, ResourceGraph), OrchestratorError> {
    let settings = Settings::load(spec).await?;
    let graph = desired_graph(&settings)?;
    let provider = create_provider(&settings);
    Ok((Engine::new(provider, settings), graph))
}

/// Registry URI of the applied app repository. Only exists once apply
/// has created it.
pub(crate) async fn registry_uri(
    engine: &Engine,
    graph: &ResourceGraph,
) -> Result<String, OrchestratorError> {
    let settings = engine.settings();
    let name = repository_name(&settings.app);
    let node = graph.get(&name).ok_or_else(|| {
        OrchestratorError::Internal(format!("graph is missing '{}'", name))
    })?;

    let record = engine.provider().describe(&settings.app, node).await?.ok_or_else(|| {
        OrchestratorError::ConfigError(
            "the app repository does not exist yet; run apply first".to_string(),
        )
    })?;
    record
        .attributes
        .get("uri")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            OrchestratorError::Internal("repository record is missing its uri".to_string())
        })
}

/// Future resolving on SIGTERM/SIGINT. Aborts the walk between
/// resources; nothing is rolled back.
pub(crate) fn shutdown_signal() -> Shutdown {
    Box::pin(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(mut sigterm), Ok(mut sigint)) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("SIGTERM received, stopping..."),
                        _ = sigint.recv() => info!("SIGINT received, stopping..."),
                    }
                }
                _ => {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Ctrl+C received, stopping...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Ctrl+C received, stopping...");
        }
    })
}
