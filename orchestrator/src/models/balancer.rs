//! Load-balancing layer models: load balancer, target group, listener

use serde::{Deserialize, Serialize};

/// Port the load balancer listens on
pub const LISTENER_PORT: u16 = 80;

/// Default port the container listens on
pub const DEFAULT_CONTAINER_PORT: u16 = 3000;

/// Load balancer descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerSpec {
    /// Load balancer name
    pub name: String,

    /// References to the subnets the balancer spans
    pub subnets: Vec<String>,

    /// Reference to the balancer security group
    pub security_group: String,
}

/// Target group descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetGroupSpec {
    /// Target group name
    pub name: String,

    /// Reference to the owning VPC
    pub vpc: String,

    /// Port targets receive traffic on (the container port)
    pub port: u16,

    /// Health check configuration
    pub health_check: HealthCheck,
}

/// Listener forwarding HTTP traffic to a target group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerSpec {
    /// Reference to the owning load balancer
    pub load_balancer: String,

    /// Listen port
    pub port: u16,

    /// Reference to the target group traffic forwards to
    pub target_group: String,
}

/// Target health check configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Request path
    #[serde(default = "default_path")]
    pub path: String,

    /// Consecutive successes to flip a target healthy
    #[serde(default = "default_threshold")]
    pub healthy_threshold: u32,

    /// Consecutive failures to flip a target unhealthy
    #[serde(default = "default_threshold")]
    pub unhealthy_threshold: u32,

    /// Seconds between checks
    #[serde(default = "default_interval")]
    pub interval_secs: u32,

    /// Seconds before a check attempt times out
    #[serde(default = "default_timeout")]
    pub timeout_secs: u32,
}

fn default_path() -> String {
    "/".to_string()
}

fn default_threshold() -> u32 {
    3
}

fn default_interval() -> u32 {
    30
}

fn default_timeout() -> u32 {
    5
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            path: default_path(),
            healthy_threshold: default_threshold(),
            unhealthy_threshold: default_threshold(),
            interval_secs: default_interval(),
            timeout_secs: default_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_check_defaults() {
        let check = HealthCheck::default();
        assert_eq!(check.path, "/");
        assert_eq!(check.healthy_threshold, 3);
        assert_eq!(check.unhealthy_threshold, 3);
        assert_eq!(check.interval_secs, 30);
        assert_eq!(check.timeout_secs, 5);
    }

    #[test]
    fn test_health_check_partial_override() {
        let check: HealthCheck = serde_json::from_str(r#"{"path": "/healthz"}"#).unwrap();
        assert_eq!(check.path, "/healthz");
        assert_eq!(check.interval_secs, 30);
    }
}
