//! Network layer models: VPC, subnets, routing, security groups

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::errors::OrchestratorError;

/// VPC descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpcSpec {
    /// IPv4 CIDR block covering all subnets
    pub cidr: String,

    /// DNS hostname resolution, required for load balancer DNS names
    pub dns_hostnames: bool,
}

/// Subnet descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetSpec {
    /// Reference to the owning VPC
    pub vpc: String,

    /// Availability zone (e.g. "us-east-1a")
    pub zone: String,

    /// IPv4 CIDR block, must lie within the VPC CIDR
    pub cidr: String,

    /// Public subnets map instance addresses on launch
    pub public: bool,
}

/// Internet gateway attachment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySpec {
    /// Reference to the attached VPC
    pub vpc: String,
}

/// Route table with a default route through the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteTableSpec {
    /// Reference to the owning VPC
    pub vpc: String,

    /// Reference to the internet gateway for the default route
    pub gateway: String,

    /// References to associated subnets
    pub subnets: Vec<String>,
}

/// Security group descriptor; egress is always allow-all
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityGroupSpec {
    /// Reference to the owning VPC
    pub vpc: String,

    /// Human-readable description
    pub description: String,

    /// Ingress rules
    pub ingress: Vec<IngressRule>,
}

/// A single ingress rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressRule {
    /// IP protocol ("tcp")
    pub protocol: String,

    /// Destination port
    pub port: u16,

    /// Traffic source
    pub source: RuleSource,
}

/// Traffic source for an ingress rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    /// CIDR block, e.g. "0.0.0.0/0"
    Cidr(String),

    /// Reference to another security group
    Group(String),
}

/// Validate the network layout: every subnet CIDR must parse, lie within
/// the VPC CIDR, and not overlap any other subnet.
pub fn validate_network(vpc_cidr: &str, subnets: &[(String, String)]) -> Result<(), OrchestratorError> {
    let vpc: Ipv4Net = vpc_cidr
        .parse()
        .map_err(|_| OrchestratorError::ConfigError(format!("invalid VPC CIDR '{}'", vpc_cidr)))?;

    let mut seen: Vec<(&str, Ipv4Net)> = Vec::new();
    for (zone, cidr) in subnets {
        let net: Ipv4Net = cidr.parse().map_err(|_| {
            OrchestratorError::ConfigError(format!("invalid subnet CIDR '{}' in zone {}", cidr, zone))
        })?;

        if !vpc.contains(&net) {
            return Err(OrchestratorError::ConfigError(format!(
                "subnet {} ({}) is not contained in VPC CIDR {}",
                zone, cidr, vpc_cidr
            )));
        }

        // CIDR blocks are power-of-two aligned, so two blocks overlap
        // exactly when one contains the other.
        for (other_zone, other) in &seen {
            if net.contains(other) || other.contains(&net) {
                return Err(OrchestratorError::ConfigError(format!(
                    "subnet {} ({}) overlaps subnet {} ({})",
                    zone, cidr, other_zone, other
                )));
            }
        }

        seen.push((zone, net));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(zone: &str, cidr: &str) -> (String, String) {
        (zone.to_string(), cidr.to_string())
    }

    #[test]
    fn test_valid_layout() {
        let subnets = vec![subnet("us-east-1a", "10.0.0.0/24"), subnet("us-east-1b", "10.0.1.0/24")];
        assert!(validate_network("10.0.0.0/16", &subnets).is_ok());
    }

    #[test]
    fn test_subnet_outside_vpc() {
        let subnets = vec![subnet("us-east-1a", "192.168.0.0/24")];
        let err = validate_network("10.0.0.0/16", &subnets).unwrap_err();
        assert!(matches!(err, OrchestratorError::ConfigError(_)));
    }

    #[test]
    fn test_overlapping_subnets() {
        let subnets = vec![subnet("us-east-1a", "10.0.0.0/23"), subnet("us-east-1b", "10.0.1.0/24")];
        let err = validate_network("10.0.0.0/16", &subnets).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("overlaps"), "unexpected message: {}", msg);
    }

    #[test]
    fn test_invalid_cidr_rejected() {
        let subnets = vec![subnet("us-east-1a", "not-a-cidr")];
        assert!(validate_network("10.0.0.0/16", &subnets).is_err());
        assert!(validate_network("banana", &[]).is_err());
    }
}
