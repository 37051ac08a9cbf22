//! Dependency graph (DAG) construction and traversal
//!
//! Builds forward and reverse dependency graphs used by the selection graph
//! operators (`+model`, `model+`, `@model`).

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::manifest::{DbtNode, Manifest};

/// Node identifier (unique_id from manifest)
pub type NodeId = String;

/// Dependency graph with forward and reverse edges
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Forward edges: node -> list of nodes it depends on (parents)
    parents: HashMap<NodeId, Vec<NodeId>>,

    /// Reverse edges: node -> list of nodes that depend on it (children)
    children: HashMap<NodeId, Vec<NodeId>>,
}

impl DependencyGraph {
    /// Build a dependency graph from a manifest
    ///
    /// Uses `parent_map` when dbt wrote one, otherwise falls back to each
    /// entry's `depends_on`.
    pub fn from_manifest(manifest: &Manifest) -> Self {
        if !manifest.parent_map.is_empty() {
            return Self::from_edges(&manifest.parent_map);
        }

        Self::from_node_table(&manifest.node_table())
    }

    /// Build a dependency graph from a flattened node table
    pub fn from_node_table(nodes: &BTreeMap<NodeId, DbtNode>) -> Self {
        let mut graph = Self::default();

        for (node_id, node) in nodes {
            for dep_id in &node.depends_on {
                graph.add_edge(dep_id, node_id);
            }
        }

        graph
    }

    /// Build a dependency graph from a node -> parents mapping
    pub fn from_edges(parents: &BTreeMap<NodeId, Vec<NodeId>>) -> Self {
        let mut graph = Self::default();

        for (node_id, parent_ids) in parents {
            for parent_id in parent_ids {
                graph.add_edge(parent_id, node_id);
            }
        }

        graph
    }

    fn add_edge(&mut self, parent: &str, child: &str) {
        let parents = self.parents.entry(child.to_string()).or_default();
        if parents.iter().any(|p| p == parent) {
            return;
        }
        parents.push(parent.to_string());

        self.children
            .entry(parent.to_string())
            .or_default()
            .push(child.to_string());
    }

    /// All upstream nodes, optionally limited to `depth` hops
    pub fn ancestors(&self, node_id: &str, depth: Option<usize>) -> BTreeSet<NodeId> {
        Self::walk(&self.parents, node_id, depth)
    }

    /// All downstream nodes, optionally limited to `depth` hops
    pub fn descendants(&self, node_id: &str, depth: Option<usize>) -> BTreeSet<NodeId> {
        Self::walk(&self.children, node_id, depth)
    }

    /// Breadth-first walk over one edge direction, excluding the start node
    fn walk(
        edges: &HashMap<NodeId, Vec<NodeId>>,
        start: &str,
        depth: Option<usize>,
    ) -> BTreeSet<NodeId> {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::new();
        queue.push_back((start.to_string(), 0usize));

        while let Some((current, distance)) = queue.pop_front() {
            if depth.is_some_and(|max| distance >= max) {
                continue;
            }

            if let Some(next) = edges.get(&current) {
                for neighbour in next {
                    if neighbour != start && visited.insert(neighbour.clone()) {
                        queue.push_back((neighbour.clone(), distance + 1));
                    }
                }
            }
        }

        visited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;

    const FIXTURE: &str = include_str!("../tests/fixtures/jaffle_shop_manifest.json");

    fn graph() -> DependencyGraph {
        DependencyGraph::from_manifest(&Manifest::from_str(FIXTURE).unwrap())
    }

    #[test]
    fn build_dag_from_manifest() {
        let dag = graph();

        assert_eq!(dag.ancestors("model.jaffle_shop.customers", Some(1)).len(), 4);
        assert_eq!(dag.descendants("source.jaffle_shop.raw.orders", Some(1)).len(), 2);
        assert_eq!(
            dag.ancestors("metric.jaffle_shop.revenue", Some(1)),
            BTreeSet::from(["model.jaffle_shop.orders".to_string()])
        );
    }

    #[test]
    fn downstream_impact() {
        let dag = graph();
        let downstream = dag.descendants("source.jaffle_shop.raw.payments", None);

        assert!(downstream.contains("model.jaffle_shop.stg_payments"));
        assert!(downstream.contains("model.jaffle_shop.customers"));
        assert!(downstream.contains("exposure.jaffle_shop.weekly_dashboard"));
        assert!(!downstream.contains("model.jaffle_shop.stg_orders"));
    }

    #[test]
    fn depth_limited_walks() {
        let dag = graph();

        let one_hop = dag.ancestors("model.jaffle_shop.orders", Some(1));
        assert_eq!(
            one_hop,
            BTreeSet::from([
                "model.jaffle_shop.stg_orders".to_string(),
                "model.jaffle_shop.stg_payments".to_string(),
            ])
        );

        let all = dag.ancestors("model.jaffle_shop.orders", None);
        assert!(all.contains("source.jaffle_shop.raw.orders"));
        assert_eq!(all.len(), 4);

        assert!(dag.descendants("model.jaffle_shop.orders", Some(0)).is_empty());
    }

    #[test]
    fn walks_terminate_on_cycles() {
        let mut edges = BTreeMap::new();
        edges.insert("a".to_string(), vec!["b".to_string()]);
        edges.insert("b".to_string(), vec!["a".to_string()]);
        let dag = DependencyGraph::from_edges(&edges);

        assert_eq!(dag.ancestors("a", None), BTreeSet::from(["b".to_string()]));
        assert_eq!(dag.descendants("a", None), BTreeSet::from(["b".to_string()]));
    }
}
