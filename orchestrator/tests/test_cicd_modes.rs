//! Delivery-mode tests: managed pipeline wiring versus the scoped
//! credential handed to an external deployment system.

use std::sync::Arc;

use risectl::config::Settings;
use risectl::engine::Engine;
use risectl::planner::desired_graph;
use risectl::provider::memory::MemoryProvider;
use risectl::provider::CloudProvider;

fn pipeline_settings() -> Settings {
    serde_json::from_str(
        r#"{
            "app": "rise-app",
            "provider": "memory",
            "cicd": {"repository": "https://github.com/rise/rise-app"}
        }"#,
    )
    .unwrap()
}

fn external_settings() -> Settings {
    serde_json::from_str(
        r#"{
            "app": "rise-app",
            "provider": "memory",
            "cicd": {"provider": "external"}
        }"#,
    )
    .unwrap()
}

#[tokio::test]
async fn test_external_mode_mints_one_scoped_credential() {
    let settings = external_settings();
    let graph = desired_graph(&settings).unwrap();
    let provider = Arc::new(MemoryProvider::new());
    let engine = Engine::new(provider.clone(), settings);

    let outcome = engine.apply(&graph, None).await.unwrap();
    assert_eq!(outcome.created.len(), 16);

    // The key pair comes back exactly once, at creation.
    let pair = outcome.credentials.unwrap();
    assert!(pair.access_key_id.starts_with("RISE"));

    // The principal is scoped to the three permission sets and nothing
    // broader, each pinned to the resource it covers.
    let deployer = provider.record("rise-app-deployer").await.unwrap();
    let sets = deployer.attributes["permission_sets"].as_array().unwrap();
    let names: Vec<&str> = sets.iter().map(|s| s["name"].as_str().unwrap()).collect();
    assert_eq!(
        names,
        vec!["registry-push-pull", "service-update-describe", "execution-role-assumption"]
    );

    let repository = provider.record("rise-app-repository").await.unwrap();
    let service = provider.record("rise-app-service").await.unwrap();
    let role = provider.record("rise-app-execution-role").await.unwrap();
    assert_eq!(sets[0]["target"].as_str().unwrap(), repository.provider_id);
    assert_eq!(sets[1]["target"].as_str().unwrap(), service.provider_id);
    assert_eq!(sets[2]["target"].as_str().unwrap(), role.provider_id);

    // No pipeline plumbing exists in this mode.
    assert!(provider.record("rise-app-connection").await.is_none());
    assert!(provider.record("rise-app-build").await.is_none());
    assert!(provider.record("rise-app-pipeline").await.is_none());
    assert_eq!(provider.list_app_resources("rise-app").await.unwrap().len(), 16);
}

#[tokio::test]
async fn test_external_reapply_never_remints_the_credential() {
    let settings = external_settings();
    let graph = desired_graph(&settings).unwrap();
    let provider = Arc::new(MemoryProvider::new());
    let engine = Engine::new(provider.clone(), settings);

    let first = engine.apply(&graph, None).await.unwrap();
    assert!(first.credentials.is_some());
    let mutations = provider.mutation_count().await;

    let second = engine.apply(&graph, None).await.unwrap();
    assert!(second.credentials.is_none());
    assert!(second.unchanged.iter().any(|n| n == "rise-app-deployer"));
    assert_eq!(provider.mutation_count().await, mutations);
}

#[tokio::test]
async fn test_pipeline_mode_builds_delivery_resources_and_no_credential() {
    let settings = pipeline_settings();
    let graph = desired_graph(&settings).unwrap();
    let provider = Arc::new(MemoryProvider::new());
    let engine = Engine::new(provider.clone(), settings);

    let outcome = engine.apply(&graph, None).await.unwrap();
    assert_eq!(outcome.created.len(), 18);
    assert!(outcome.credentials.is_none());

    assert!(provider.record("rise-app-connection").await.is_some());
    assert!(provider.record("rise-app-build").await.is_some());
    assert!(provider.record("rise-app-pipeline").await.is_some());
    assert!(provider.record("rise-app-deployer").await.is_none());

    // The deploy stage targets the live cluster and service by name.
    let pipeline = provider.record("rise-app-pipeline").await.unwrap();
    assert_eq!(pipeline.attributes["cluster"].as_str().unwrap(), "rise-app-cluster");
    assert_eq!(pipeline.attributes["service"].as_str().unwrap(), "rise-app-service");
    assert_eq!(
        pipeline.attributes["manifest_file"].as_str().unwrap(),
        "imagedefinitions.json"
    );
}

#[tokio::test]
async fn test_switching_to_external_replaces_pipeline_with_credential() {
    let provider = Arc::new(MemoryProvider::new());

    let pipeline = pipeline_settings();
    let pipeline_graph = desired_graph(&pipeline).unwrap();
    Engine::new(provider.clone(), pipeline)
        .apply(&pipeline_graph, None)
        .await
        .unwrap();

    let external = external_settings();
    let external_graph = desired_graph(&external).unwrap();
    let outcome = Engine::new(provider.clone(), external)
        .apply(&external_graph, None)
        .await
        .unwrap();

    assert_eq!(outcome.created, vec!["rise-app-deployer".to_string()]);
    assert!(outcome.credentials.is_some());

    // Delivery plumbing is torn down dependents-first.
    assert_eq!(
        outcome.removed,
        vec![
            "rise-app-pipeline".to_string(),
            "rise-app-build".to_string(),
            "rise-app-connection".to_string(),
        ]
    );
    assert_eq!(provider.list_app_resources("rise-app").await.unwrap().len(), 16);
}

#[tokio::test]
async fn test_switching_to_pipeline_removes_the_credential() {
    let provider = Arc::new(MemoryProvider::new());

    let external = external_settings();
    let external_graph = desired_graph(&external).unwrap();
    Engine::new(provider.clone(), external)
        .apply(&external_graph, None)
        .await
        .unwrap();

    let pipeline = pipeline_settings();
    let pipeline_graph = desired_graph(&pipeline).unwrap();
    let outcome = Engine::new(provider.clone(), pipeline)
        .apply(&pipeline_graph, None)
        .await
        .unwrap();

    assert_eq!(outcome.removed, vec!["rise-app-deployer".to_string()]);
    assert_eq!(outcome.created.len(), 3);
    assert!(provider.record("rise-app-deployer").await.is_none());
    assert_eq!(provider.list_app_resources("rise-app").await.unwrap().len(), 18);
}
