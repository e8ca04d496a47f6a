
use petgraph::graph::{NodeIndex, UnGraph};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

use crate::schema::Table;

/// One foreign key between two indexed tables. Traversal ignores direction;
/// it is kept for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FkEdge {
    /// Table holding the foreign key
    pub from_table: String,
    pub from_columns: Vec<String>,
    /// Table the foreign key points at
    pub to_table: String,
    pub to_columns: Vec<String>,
}

/// Node list plus edge list, the persisted form of a [`SchemaGraph`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<String>,
    pub edges: Vec<FkEdge>,
}

/// Undirected foreign-key graph over table identifiers
#[derive(Debug, Clone, Default)]
pub struct SchemaGraph {
    graph: UnGraph<String, FkEdge>,
    nodes: HashMap<String, NodeIndex>,
}

impl SchemaGraph {
    /// Build the graph for `tables`. Foreign keys whose referenced table is
    /// not part of the set are skipped.
    #[inline]
    pub fn build(tables: &[Table]) -> Self {
        let mut graph = Self::default();
        for table in tables {
            graph.add_node(table.id());
        }

        for table in tables {
            let from_table = table.id();
            for fk in &table.foreign_keys {
                let edge = FkEdge {
                    from_table: from_table.clone(),
                    from_columns: fk.constrained_columns.clone(),
                    to_table: fk.referred_table.clone(),
                    to_columns: fk.referred_columns.clone(),
                };
                if !graph.add_edge(edge) {
                    debug!(
                        "Skipping foreign key {} -> {}: referenced table is not indexed",
                        from_table, fk.referred_table
                    );
                }
            }
        }

        debug!(
            "Built schema graph with {} tables and {} foreign keys",
            graph.node_count(),
            graph.edge_count()
        );
        graph
    }

    /// Restore a graph from its persisted form
    #[inline]
    pub fn from_snapshot(snapshot: &GraphSnapshot) -> Result<Self, String> {
        let mut graph = Self::default();
        for node in &snapshot.nodes {
            if graph.nodes.contains_key(node) {
                return Err(format!("duplicate graph node {}", node));
            }
            graph.add_node(node.clone());
        }
        for edge in &snapshot.edges {
            if !graph.add_edge(edge.clone()) {
                return Err(format!(
                    "edge {} -> {} references an unknown table",
                    edge.from_table, edge.to_table
                ));
            }
        }
        Ok(graph)
    }

    #[inline]
    pub fn to_snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.graph.node_weights().cloned().collect(),
            edges: self.edges().cloned().collect(),
        }
    }

    fn add_node(&mut self, id: String) {
        if !self.nodes.contains_key(&id) {
            let index = self.graph.add_node(id.clone());
            self.nodes.insert(id, index);
        }
    }

    fn add_edge(&mut self, edge: FkEdge) -> bool {
        match (self.nodes.get(&edge.from_table), self.nodes.get(&edge.to_table)) {
            (Some(&a), Some(&b)) => {
                self.graph.add_edge(a, b, edge);
                true
            }
            _ => false,
        }
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    #[inline]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    #[inline]
    pub fn contains(&self, table: &str) -> bool {
        self.nodes.contains_key(table)
    }

    /// All foreign keys with their original direction
    #[inline]
    pub fn edges(&self) -> impl Iterator<Item = &FkEdge> {
        self.graph.edge_weights()
    }

    /// Foreign keys touching `table`, in either direction
    #[inline]
    pub fn edges_of(&self, table: &str) -> Vec<&FkEdge> {
        self.nodes
            .get(table)
            .map(|&index| self.graph.edges(index).map(|e| e.weight()).collect())
            .unwrap_or_default()
    }

    /// Direct neighbors of `table`, sorted, without the table itself
    #[inline]
    pub fn neighbors(&self, table: &str) -> Vec<&str> {
        let Some(&index) = self.nodes.get(table) else {
            return Vec::new();
        };
        let neighbors: BTreeSet<&str> = self
            .graph
            .neighbors(index)
            .filter(|&n| n != index)
            .map(|n| self.graph[n].as_str())
            .collect();
        neighbors.into_iter().collect()
    }

    /// Tables reachable from any seed within `hops` undirected edges, seeds
    /// included. Breadth-first by level with each level sorted, so the
    /// output is ordered by (distance, identifier) and each table appears
    /// once. Seeds unknown to the graph are kept but have no neighbors.
    #[inline]
    pub fn expand<S: AsRef<str>>(&self, seeds: &[S], hops: usize) -> Vec<String> {
        let mut frontier: Vec<&str> = seeds
            .iter()
            .map(AsRef::as_ref)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut visited: HashSet<&str> = frontier.iter().copied().collect();
        let mut result: Vec<String> = frontier.iter().map(|s| (*s).to_string()).collect();

        for _ in 0..hops {
            let mut next: BTreeSet<&str> = BTreeSet::new();
            for table in &frontier {
                for neighbor in self.neighbors(table) {
                    if !visited.contains(neighbor) {
                        next.insert(neighbor);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            for &table in &next {
                visited.insert(table);
                result.push(table.to_string());
            }
            frontier = next.into_iter().collect();
        }

        result
    }

    /// Tables within `hops` of `table`, excluding the table itself
    #[inline]
    pub fn related(&self, table: &str, hops: usize) -> Vec<String> {
        let mut related: Vec<String> = self
            .expand(&[table], hops)
            .into_iter()
            .filter(|t| t != table)
            .collect();
        related.sort();
        related
    }
}
