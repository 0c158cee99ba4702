//! Release artifact and deployment flow tests.

use std::sync::Arc;
use std::time::Duration;

use risectl::artifacts::ArtifactStore;
use risectl::config::Settings;
use risectl::engine::Engine;
use risectl::fsio::File;
use risectl::models::artifact::{ImageDefinition, RecordAction};
use risectl::planner::desired_graph;
use risectl::provider::memory::MemoryProvider;
use risectl::release::resolve_tag;
use risectl::rollout::{wait_for_stable, RolloutOptions};

#[tokio::test]
async fn test_release_artifacts_for_a_resolved_revision() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());

    let tag = resolve_tag(Some("a1b2c3d4e5"));
    assert_eq!(tag, "a1b2c3d");
    let image_uri = format!("registry.local/rise-app:{}", tag);

    let manifest = store.write_manifest("rise-app", &image_uri).await.unwrap();
    let written = File::new(&manifest).read_string().await.unwrap();
    assert_eq!(
        written,
        r#"[{"name":"rise-app","imageUri":"registry.local/rise-app:a1b2c3d"}]"#
    );

    let parsed: Vec<ImageDefinition> = serde_json::from_str(&written).unwrap();
    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed[0].name, "rise-app");
    assert_eq!(parsed[0].image_uri, image_uri);

    let tag_file = store.write_tag(&tag).await.unwrap();
    assert_eq!(File::new(&tag_file).read_string().await.unwrap(), "a1b2c3d\n");
}

#[tokio::test]
async fn test_unresolved_revision_releases_latest() {
    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());

    let tag = resolve_tag(None);
    assert_eq!(tag, "latest");

    let manifest = store
        .write_manifest("rise-app", &format!("registry.local/rise-app:{}", tag))
        .await
        .unwrap();
    let written = File::new(&manifest).read_string().await.unwrap();
    assert!(written.contains("registry.local/rise-app:latest"));
}

#[tokio::test]
async fn test_deploy_rolls_the_service_to_the_released_tag() {
    let settings: Settings = serde_json::from_str(
        r#"{
            "app": "rise-app",
            "provider": "memory",
            "cicd": {"provider": "external"}
        }"#,
    )
    .unwrap();
    let graph = desired_graph(&settings).unwrap();
    let provider = Arc::new(MemoryProvider::new());
    let engine = Engine::new(provider.clone(), settings);
    engine.apply(&graph, None).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(dir.path());
    let image = "registry.local/rise-app:a1b2c3d";
    store.record(RecordAction::Release, "a1b2c3d", image, Some("a1b2c3d4e5".to_string())).await.unwrap();

    // Two health polls report an unfinished rollout before it settles.
    provider.set_stabilize_after(2).await;
    engine.set_service_image("rise-app-cluster", "rise-app-service", image).await.unwrap();

    let options = RolloutOptions {
        timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(1),
    };
    let health = wait_for_stable(
        engine.provider().as_ref(),
        "rise-app-cluster",
        "rise-app-service",
        image,
        &options,
    )
    .await
    .unwrap();
    assert_eq!(health.image, image);
    assert!(health.is_stable());

    store.record(RecordAction::Deploy, "a1b2c3d", image, None).await.unwrap();
    let history = store.history().await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].action, RecordAction::Release);
    assert_eq!(history[1].action, RecordAction::Deploy);
    assert_eq!(history[1].tag, "a1b2c3d");

    // The live record now carries the deployed tag; a later apply
    // must leave it in place.
    let service = provider.record("rise-app-service").await.unwrap();
    assert_eq!(service.attributes["image_tag"].as_str().unwrap(), "a1b2c3d");
    let outcome = engine.apply(&graph, None).await.unwrap();
    assert!(outcome.updated.is_empty());
}
