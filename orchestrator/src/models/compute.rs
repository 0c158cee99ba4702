//! Compute and registry layer models: repository, cluster, service, roles, logs

use serde::{Deserialize, Serialize};

/// Container image repository descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositorySpec {
    /// Repository name in the registry (the app name)
    pub name: String,

    /// Scan pushed images for known vulnerabilities
    pub scan_on_push: bool,
}

/// Log group for service task output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogGroupSpec {
    /// Log group name, e.g. "/rise/rise-app"
    pub name: String,

    /// Retention in days
    pub retention_days: u32,
}

/// IAM-equivalent role descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleSpec {
    /// Role name
    pub name: String,

    /// Service principal allowed to assume the role (e.g. "ecs-tasks")
    pub assume_service: String,

    /// Managed policy identifiers attached to the role
    pub policies: Vec<String>,
}

/// Compute cluster descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Cluster name
    pub name: String,
}

/// Long-running container service descriptor.
///
/// The task definition is folded into the service: replicas, cpu/memory and
/// the image reference describe the single container the service runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Reference to the owning cluster
    pub cluster: String,

    /// Reference to the registry URI the image is pulled from
    pub repository: String,

    /// Image tag the service runs. Deployment-managed: a live tag that
    /// diverges from this value is never reverted by apply.
    pub image_tag: String,

    /// Port the container listens on
    pub container_port: u16,

    /// Desired replica count
    pub replicas: u32,

    /// CPU units reserved per task
    pub cpu: u32,

    /// Memory (MiB) reserved per task
    pub memory: u32,

    /// Reference to the execution role
    pub execution_role: String,

    /// Reference to the log group
    pub log_group: String,

    /// References to the subnets tasks run in
    pub subnets: Vec<String>,

    /// Reference to the task security group
    pub security_group: String,

    /// Reference to the target group registering tasks
    pub target_group: String,

    /// Assign public addresses to tasks (required for image pulls in
    /// public subnets without a NAT gateway)
    pub assign_public_ip: bool,
}

/// Live rollout state of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    /// Desired replica count
    pub desired: u32,

    /// Tasks currently running
    pub running: u32,

    /// Tasks healthy behind the load balancer
    pub healthy: u32,

    /// Image reference the live service currently runs
    pub image: String,
}

impl ServiceHealth {
    /// A rollout is stable once every desired task runs and is healthy
    /// behind the load balancer.
    pub fn is_stable(&self) -> bool {
        self.running == self.desired && self.healthy == self.desired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_stability() {
        let mut health = ServiceHealth {
            desired: 2,
            running: 2,
            healthy: 2,
            image: "registry/rise-app:a1b2c3d".to_string(),
        };
        assert!(health.is_stable());

        health.healthy = 1;
        assert!(!health.is_stable());

        health.healthy = 2;
        health.running = 1;
        assert!(!health.is_stable());
    }
}
