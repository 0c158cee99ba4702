//! Convergence tests: the full desired graph applied against the
//! in-memory provider.

use std::sync::Arc;
use std::time::Duration;

use risectl::config::Settings;
use risectl::engine::{Engine, RetryOptions, Shutdown};
use risectl::errors::OrchestratorError;
use risectl::graph::ResourceGraph;
use risectl::models::compute::LogGroupSpec;
use risectl::models::resource::ResourceSpec;
use risectl::planner::desired_graph;
use risectl::provider::memory::MemoryProvider;
use risectl::provider::CloudProvider;
use risectl::utils::CooldownOptions;

fn settings() -> Settings {
    serde_json::from_str(
        r#"{
            "app": "rise-app",
            "provider": "memory",
            "cicd": {"repository": "https://github.com/rise/rise-app"}
        }"#,
    )
    .unwrap()
}

fn fast_retry() -> RetryOptions {
    RetryOptions {
        max_attempts: 2,
        cooldown: CooldownOptions {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        },
    }
}

fn harness() -> (Arc<MemoryProvider>, Engine, ResourceGraph) {
    let settings = settings();
    let graph = desired_graph(&settings).unwrap();
    let provider = Arc::new(MemoryProvider::new());
    let engine = Engine::new(provider.clone(), settings).with_retry(fast_retry());
    (provider, engine, graph)
}

#[tokio::test]
async fn test_apply_creates_the_full_graph() {
    let (provider, engine, graph) = harness();

    let outcome = engine.apply(&graph, None).await.unwrap();
    assert_eq!(outcome.created.len(), 18);
    assert!(outcome.updated.is_empty());
    assert!(outcome.removed.is_empty());
    assert!(outcome.credentials.is_none());
    assert_eq!(provider.mutation_count().await, 18);

    // References carry the provider ids of resources created in
    // earlier levels.
    let vpc = provider.record("rise-app-vpc").await.unwrap();
    let subnet = provider.record("rise-app-subnet-a").await.unwrap();
    assert_eq!(subnet.attributes["vpc"].as_str().unwrap(), vpc.provider_id);

    let repository = provider.record("rise-app-repository").await.unwrap();
    let service = provider.record("rise-app-service").await.unwrap();
    assert_eq!(service.attributes["repository"], repository.attributes["uri"]);
}

#[tokio::test]
async fn test_second_apply_reads_everything_writes_nothing() {
    let (provider, engine, graph) = harness();
    engine.apply(&graph, None).await.unwrap();
    let mutations = provider.mutation_count().await;

    let outcome = engine.apply(&graph, None).await.unwrap();
    assert!(outcome.created.is_empty());
    assert!(outcome.updated.is_empty());
    assert_eq!(outcome.unchanged.len(), 18);
    assert_eq!(provider.mutation_count().await, mutations);
}

#[tokio::test]
async fn test_apply_recreates_a_deleted_resource() {
    let (provider, engine, graph) = harness();
    engine.apply(&graph, None).await.unwrap();

    // Someone removed the pipeline out-of-band.
    let pipeline = provider.record("rise-app-pipeline").await.unwrap();
    provider.delete(&pipeline).await.unwrap();

    let outcome = engine.apply(&graph, None).await.unwrap();
    assert_eq!(outcome.created, vec!["rise-app-pipeline".to_string()]);
    assert_eq!(outcome.unchanged.len(), 17);
    assert!(provider.record("rise-app-pipeline").await.is_some());
}

#[tokio::test]
async fn test_apply_resumes_after_provider_failure() {
    let (provider, engine, graph) = harness();

    provider.fail_next(1, false).await;
    let err = engine.apply(&graph, None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ProviderError { transient: false, .. }));

    // The failed run stopped partway; the next run picks up whatever
    // converged and never creates a resource twice.
    let survivors = provider.mutation_count().await;
    let outcome = engine.apply(&graph, None).await.unwrap();
    assert_eq!(outcome.created.len() as u64, 18 - survivors);
    assert_eq!(outcome.created.len() + outcome.unchanged.len(), 18);
    assert_eq!(provider.mutation_count().await, 18);
}

#[tokio::test]
async fn test_transient_failure_is_retried_within_a_run() {
    let (provider, engine, graph) = harness();

    provider.fail_next(1, true).await;
    let outcome = engine.apply(&graph, None).await.unwrap();
    assert_eq!(outcome.created.len(), 18);
    assert_eq!(provider.mutation_count().await, 18);
}

#[tokio::test]
async fn test_apply_removes_resources_dropped_from_the_spec() {
    let (provider, engine, graph) = harness();
    engine.apply(&graph, None).await.unwrap();

    // Applied under an older spec, no longer desired.
    let stray = ResourceSpec::LogGroup(LogGroupSpec {
        name: "/ecs/rise-app-old".to_string(),
        retention_days: 7,
    });
    provider.create("rise-app", "rise-app-old-logs", &stray).await.unwrap();

    let outcome = engine.apply(&graph, None).await.unwrap();
    assert_eq!(outcome.removed, vec!["rise-app-old-logs".to_string()]);
    assert!(provider.record("rise-app-old-logs").await.is_none());
}

#[tokio::test]
async fn test_apply_does_not_revert_an_externally_deployed_image() {
    let (provider, engine, graph) = harness();
    engine.apply(&graph, None).await.unwrap();

    // An external deployer rolled the service to a pinned tag.
    provider
        .set_service_image("rise-app-cluster", "rise-app-service", "registry.local/rise-app:a1b2c3d")
        .await
        .unwrap();
    let mutations = provider.mutation_count().await;

    let outcome = engine.apply(&graph, None).await.unwrap();
    assert!(outcome.updated.is_empty());
    assert_eq!(provider.mutation_count().await, mutations);

    let health = provider
        .service_health("rise-app-cluster", "rise-app-service")
        .await
        .unwrap();
    assert_eq!(health.image, "registry.local/rise-app:a1b2c3d");
}

#[tokio::test]
async fn test_cancelled_apply_keeps_converged_state() {
    let (provider, engine, graph) = harness();
    engine.apply(&graph, None).await.unwrap();
    let mutations = provider.mutation_count().await;

    let stop: Shutdown = Box::pin(async {});
    let err = engine.apply(&graph, Some(stop)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancelled(_)));

    // Nothing was rolled back.
    assert_eq!(provider.mutation_count().await, mutations);
    assert!(provider.record("rise-app-service").await.is_some());
}

#[tokio::test]
async fn test_plan_diffs_without_writing() {
    let (provider, engine, graph) = harness();

    let before = engine.plan(&graph).await.unwrap();
    assert_eq!(before.creates(), 18);
    assert!(before.has_changes());
    assert_eq!(provider.mutation_count().await, 0);

    engine.apply(&graph, None).await.unwrap();

    let after = engine.plan(&graph).await.unwrap();
    assert_eq!(after.unchanged(), 18);
    assert!(!after.has_changes());
    assert_eq!(provider.mutation_count().await, 18);
}

#[tokio::test]
async fn test_plan_lists_orphans_without_deleting_them() {
    let (provider, engine, graph) = harness();
    engine.apply(&graph, None).await.unwrap();

    let stray = ResourceSpec::LogGroup(LogGroupSpec {
        name: "/ecs/rise-app-old".to_string(),
        retention_days: 7,
    });
    provider.create("rise-app", "rise-app-old-logs", &stray).await.unwrap();
    let mutations = provider.mutation_count().await;

    let plan = engine.plan(&graph).await.unwrap();
    assert_eq!(plan.orphans.len(), 1);
    assert_eq!(plan.orphans[0].name, "rise-app-old-logs");
    assert!(plan.has_changes());

    assert_eq!(provider.mutation_count().await, mutations);
    assert!(provider.record("rise-app-old-logs").await.is_some());
}

#[tokio::test]
async fn test_destroy_tears_down_in_reverse_order() {
    let (provider, engine, graph) = harness();
    engine.apply(&graph, None).await.unwrap();

    let outcome = engine.destroy(&graph, None).await.unwrap();
    assert_eq!(outcome.removed.len(), 18);
    assert!(outcome.skipped.is_empty());

    let position = |name: &str| {
        outcome.removed.iter().position(|n| n == name).unwrap_or_else(|| panic!("{} not removed", name))
    };
    assert!(position("rise-app-pipeline") < position("rise-app-service"));
    assert!(position("rise-app-service") < position("rise-app-listener"));
    assert!(position("rise-app-listener") < position("rise-app-lb"));
    assert!(position("rise-app-subnet-a") < position("rise-app-vpc"));

    assert!(provider.list_app_resources("rise-app").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_destroy_is_idempotent() {
    let (_provider, engine, graph) = harness();
    engine.apply(&graph, None).await.unwrap();
    engine.destroy(&graph, None).await.unwrap();

    let second = engine.destroy(&graph, None).await.unwrap();
    assert!(second.removed.is_empty());
    assert_eq!(second.skipped.len(), 18);
}

#[tokio::test]
async fn test_destroy_sweeps_stragglers() {
    let (provider, engine, graph) = harness();
    engine.apply(&graph, None).await.unwrap();

    let stray = ResourceSpec::LogGroup(LogGroupSpec {
        name: "/ecs/rise-app-old".to_string(),
        retention_days: 7,
    });
    provider.create("rise-app", "rise-app-forgotten", &stray).await.unwrap();

    let outcome = engine.destroy(&graph, None).await.unwrap();
    assert!(outcome.removed.iter().any(|n| n == "rise-app-forgotten"));
    assert!(provider.list_app_resources("rise-app").await.unwrap().is_empty());
}
