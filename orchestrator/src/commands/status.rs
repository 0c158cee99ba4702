//! `risectl status`

use std::path::Path;

use serde_json::Value;

use crate::errors::OrchestratorError;
use crate::planner::{cluster_name, service_name};
use crate::rollout::probe_endpoint;

use super::load;

/// Show live resources, rollout state of the service, and the public
/// endpoint.
pub async fn run(spec: &Path, probe: bool) -> Result<(), OrchestratorError> {
    let (engine, graph) = load(spec).await?;
    let app = engine.settings().app.clone();

    let resources = engine.provider().list_app_resources(&app).await?;
    if resources.is_empty() {
        println!("No live resources for {}; run apply first.", app);
        return Ok(());
    }
    println!("Resources ({}):", resources.len());
    for record in &resources {
        println!("  {:<18} {:<28} {}", record.kind.to_string(), record.name, record.provider_id);
    }

    let cluster = cluster_name(&app);
    let service = service_name(&app);
    match engine.service_health(&cluster, &service).await {
        Ok(health) => {
            println!("Service {}:", service);
            println!("  running: {}/{}", health.running, health.desired);
            println!("  healthy: {}/{}", health.healthy, health.desired);
            println!("  image:   {}", health.image);
        }
        Err(OrchestratorError::NotFound(_)) => {
            println!("Service {} not created yet.", service);
        }
        Err(e) => return Err(e),
    }

    let Some(node) = graph.get(&format!("{}-lb", app)) else {
        return Ok(());
    };
    let Some(record) = engine.provider().describe(&app, node).await? else {
        return Ok(());
    };
    let Some(dns) = record.attributes.get("dns_name").and_then(Value::as_str) else {
        return Ok(());
    };

    let url = format!("http://{}/", dns);
    println!("  endpoint: {}", url);
    if probe {
        match probe_endpoint(&url).await {
            Ok(code) => println!("  probe: HTTP {}", code),
            Err(e) => println!("  probe failed: {}", e),
        }
    }
    Ok(())
}
