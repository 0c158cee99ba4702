//! Rollout watching: poll a service until every desired task runs the
//! expected image and reports healthy behind the load balancer.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::TimeoutSettings;
use crate::errors::OrchestratorError;
use crate::models::compute::ServiceHealth;
use crate::provider::CloudProvider;

/// Polling bounds for one rollout
#[derive(Debug, Clone)]
pub struct RolloutOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl From<&TimeoutSettings> for RolloutOptions {
    fn from(timeouts: &TimeoutSettings) -> Self {
        Self {
            timeout: Duration::from_secs(timeouts.rollout_secs),
            poll_interval: Duration::from_secs(timeouts.poll_interval_secs),
        }
    }
}

/// Wait until the service runs `image` stably, or time out. A live
/// service left on a different image is never touched from here; this
/// only observes.
pub async fn wait_for_stable(
    provider: &dyn CloudProvider,
    cluster: &str,
    service: &str,
    image: &str,
    options: &RolloutOptions,
) -> Result<ServiceHealth, OrchestratorError> {
    let started = Instant::now();
    info!("waiting for {} to stabilize on {}", service, image);

    loop {
        match provider.service_health(cluster, service).await {
            Ok(health) => {
                if health.image == image && health.is_stable() {
                    info!(
                        "rollout stable: {}/{} tasks healthy on {}",
                        health.healthy, health.desired, image
                    );
                    return Ok(health);
                }
                debug!(
                    "rollout in progress: {}/{} running, {}/{} healthy, image {}",
                    health.running, health.desired, health.healthy, health.desired, health.image
                );
            }
            // Transient read failures do not abort the wait
            Err(e) if e.is_transient() => warn!("health check failed, will retry: {}", e),
            Err(e) => return Err(e),
        }

        if started.elapsed() >= options.timeout {
            return Err(OrchestratorError::RolloutTimeoutError {
                service: service.to_string(),
                elapsed_secs: started.elapsed().as_secs(),
            });
        }
        tokio::time::sleep(options.poll_interval).await;
    }
}

/// Probe an HTTP endpoint once and return its status code.
pub async fn probe_endpoint(url: &str) -> Result<u16, OrchestratorError> {
    let client = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
    let response = client.get(url).send().await?;
    Ok(response.status().as_u16())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::compute::ServiceSpec;
    use crate::models::resource::ResourceSpec;
    use crate::provider::memory::MemoryProvider;

    fn service_spec(image_tag: &str) -> ResourceSpec {
        ResourceSpec::Service(ServiceSpec {
            cluster: "mem-cluster-1".to_string(),
            repository: "registry.local/rise-app".to_string(),
            image_tag: image_tag.to_string(),
            container_port: 3000,
            replicas: 2,
            cpu: 256,
            memory: 512,
            execution_role: "mem-role-1".to_string(),
            log_group: "mem-logs-1".to_string(),
            subnets: vec!["mem-subnet-1".to_string()],
            security_group: "mem-sg-1".to_string(),
            target_group: "mem-tg-1".to_string(),
            assign_public_ip: true,
        })
    }

    fn fast() -> RolloutOptions {
        RolloutOptions {
            timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_wait_reaches_stability() {
        let provider = MemoryProvider::new();
        provider.set_stabilize_after(3).await;
        provider
            .create("rise-app", "rise-app-service", &service_spec("latest"))
            .await
            .unwrap();

        let health = wait_for_stable(
            &provider,
            "rise-app-cluster",
            "rise-app-service",
            "registry.local/rise-app:latest",
            &fast(),
        )
        .await
        .unwrap();
        assert_eq!(health.healthy, 2);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let provider = MemoryProvider::new();
        provider.set_stabilize_after(u32::MAX).await;
        provider
            .create("rise-app", "rise-app-service", &service_spec("latest"))
            .await
            .unwrap();

        let err = wait_for_stable(
            &provider,
            "rise-app-cluster",
            "rise-app-service",
            "registry.local/rise-app:latest",
            &RolloutOptions {
                timeout: Duration::from_millis(20),
                poll_interval: Duration::from_millis(2),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::RolloutTimeoutError { ref service, .. } if service == "rise-app-service"
        ));
    }

    #[tokio::test]
    async fn test_wait_tracks_new_image_after_deploy() {
        let provider = MemoryProvider::new();
        provider
            .create("rise-app", "rise-app-service", &service_spec("latest"))
            .await
            .unwrap();

        provider.set_stabilize_after(2).await;
        provider
            .set_service_image(
                "rise-app-cluster",
                "rise-app-service",
                "registry.local/rise-app:a1b2c3d",
            )
            .await
            .unwrap();

        let health = wait_for_stable(
            &provider,
            "rise-app-cluster",
            "rise-app-service",
            "registry.local/rise-app:a1b2c3d",
            &fast(),
        )
        .await
        .unwrap();
        assert_eq!(health.image, "registry.local/rise-app:a1b2c3d");
    }
}
