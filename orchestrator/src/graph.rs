//! Desired resource graph (DAG) with dependency-ordered execution levels.
//!
//! Apply walks the levels forward; destroy walks them in reverse. Within a
//! level no two resources depend on each other, so they may be applied in
//! parallel.

use std::collections::HashMap;

use crate::errors::OrchestratorError;
use crate::models::resource::DesiredResource;

/// The desired resource graph
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    /// All nodes, in planner order
    nodes: Vec<DesiredResource>,

    /// Adjacency list: dependency name -> dependent names
    edges: HashMap<String, Vec<String>>,
}

impl ResourceGraph {
    /// Build the graph, validating that logical names are unique and that
    /// every dependency references a known resource.
    pub fn new(nodes: Vec<DesiredResource>) -> Result<Self, OrchestratorError> {
        let mut edges: HashMap<String, Vec<String>> = HashMap::new();

        for node in &nodes {
            if nodes.iter().filter(|n| n.name == node.name).count() > 1 {
                return Err(OrchestratorError::ConfigError(format!(
                    "duplicate logical resource name '{}'",
                    node.name
                )));
            }

            for dep in node.dependencies()? {
                if !nodes.iter().any(|n| n.name == dep) {
                    return Err(OrchestratorError::ConfigError(format!(
                        "resource '{}' depends on unknown resource '{}'",
                        node.name, dep
                    )));
                }
                edges.entry(dep).or_default().push(node.name.clone());
            }
        }

        Ok(Self { nodes, edges })
    }

    pub fn nodes(&self) -> &[DesiredResource] {
        &self.nodes
    }

    pub fn get(&self, name: &str) -> Option<&DesiredResource> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Execution levels via Kahn's algorithm, taken in waves: each level
    /// holds only nodes whose dependencies all sit in earlier levels.
    pub fn levels(&self) -> Result<Vec<Vec<String>>, OrchestratorError> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for node in &self.nodes {
            in_degree.insert(&node.name, node.dependencies()?.len());
        }

        // Seed with nodes that have no dependencies, in planner order
        let mut current: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| in_degree[n.name.as_str()] == 0)
            .map(|n| n.name.clone())
            .collect();

        let mut levels = Vec::new();
        let mut processed = 0;

        while !current.is_empty() {
            processed += current.len();
            let mut next = Vec::new();

            for name in &current {
                if let Some(dependents) = self.edges.get(name) {
                    for dependent in dependents {
                        let degree = in_degree.get_mut(dependent.as_str()).ok_or_else(|| {
                            OrchestratorError::Internal(format!(
                                "dependent '{}' missing from graph",
                                dependent
                            ))
                        })?;
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(dependent.clone());
                        }
                    }
                }
            }

            levels.push(std::mem::replace(&mut current, next));
        }

        // Any unprocessed node sits on a cycle
        if processed != self.nodes.len() {
            let stuck: Vec<&str> = self
                .nodes
                .iter()
                .filter(|n| in_degree[n.name.as_str()] > 0)
                .map(|n| n.name.as_str())
                .collect();
            return Err(OrchestratorError::ConfigError(format!(
                "dependency cycle involving: {}",
                stuck.join(", ")
            )));
        }

        Ok(levels)
    }

    /// Levels in reverse order, for teardown.
    pub fn reverse_levels(&self) -> Result<Vec<Vec<String>>, OrchestratorError> {
        let mut levels = self.levels()?;
        levels.reverse();
        Ok(levels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::compute::ClusterSpec;
    use crate::models::resource::ResourceSpec;

    fn node(name: &str, deps: &[&str]) -> DesiredResource {
        let mut desired = DesiredResource::new(
            name,
            ResourceSpec::Cluster(ClusterSpec { name: name.to_string() }),
        );
        for dep in deps {
            desired = desired.with_dependency(*dep);
        }
        desired
    }

    #[test]
    fn test_levels_respect_dependencies() {
        let graph = ResourceGraph::new(vec![
            node("vpc", &[]),
            node("subnet-a", &["vpc"]),
            node("subnet-b", &["vpc"]),
            node("lb", &["subnet-a", "subnet-b"]),
        ])
        .unwrap();

        let levels = graph.levels().unwrap();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec!["vpc"]);
        assert_eq!(levels[1], vec!["subnet-a", "subnet-b"]);
        assert_eq!(levels[2], vec!["lb"]);
    }

    #[test]
    fn test_independent_nodes_share_the_first_level() {
        let graph = ResourceGraph::new(vec![
            node("cluster", &[]),
            node("repository", &[]),
            node("log-group", &[]),
        ])
        .unwrap();

        let levels = graph.levels().unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].len(), 3);
    }

    #[test]
    fn test_reverse_levels_for_teardown() {
        let graph = ResourceGraph::new(vec![
            node("vpc", &[]),
            node("subnet", &["vpc"]),
            node("service", &["subnet"]),
        ])
        .unwrap();

        let reversed = graph.reverse_levels().unwrap();
        assert_eq!(reversed[0], vec!["service"]);
        assert_eq!(reversed[2], vec!["vpc"]);
    }

    #[test]
    fn test_cycle_detected() {
        let graph = ResourceGraph::new(vec![
            node("a", &["b"]),
            node("b", &["a"]),
            node("c", &[]),
        ])
        .unwrap();

        let err = graph.levels().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cycle"), "unexpected message: {}", msg);
        assert!(msg.contains('a') && msg.contains('b'));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = ResourceGraph::new(vec![node("a", &["ghost"])]).unwrap_err();
        assert!(err.to_string().contains("unknown resource 'ghost'"));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let err = ResourceGraph::new(vec![node("a", &[]), node("a", &[])]).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_levels_deterministic() {
        let build = || {
            ResourceGraph::new(vec![
                node("vpc", &[]),
                node("subnet-a", &["vpc"]),
                node("subnet-b", &["vpc"]),
                node("lb", &["subnet-a", "subnet-b"]),
            ])
            .unwrap()
        };

        let first = build().levels().unwrap();
        let second = build().levels().unwrap();
        assert_eq!(first, second);
    }
}
