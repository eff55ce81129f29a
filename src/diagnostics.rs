//! Point-in-time view of what the store holds, for inspecting stuck trees

use crate::core::errors::Result;
use crate::identity::NodeKey;
use crate::storage::GraphStore;
use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Roots of the trees in flight
    pub launched: Vec<NodeKey>,
    /// Pending (child, parent) edges
    pub edges: Vec<(NodeKey, NodeKey)>,
}

impl Snapshot {
    pub async fn capture(graph: &GraphStore) -> Result<Self> {
        Ok(Self {
            launched: graph.launched_trees().await?,
            edges: graph.edges().await?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.launched.is_empty() && self.edges.is_empty()
    }

    /// Parent -> child graph over node keys
    pub fn to_graph(&self) -> (DiGraph<String, ()>, HashMap<String, NodeIndex>) {
        let mut graph = DiGraph::new();
        let mut indices: HashMap<String, NodeIndex> = HashMap::new();
        let mut index_of = |graph: &mut DiGraph<String, ()>, key: &NodeKey| {
            *indices
                .entry(key.to_string())
                .or_insert_with(|| graph.add_node(key.to_string()))
        };
        for root in &self.launched {
            index_of(&mut graph, root);
        }
        for (child, parent) in &self.edges {
            let parent = index_of(&mut graph, parent);
            let child = index_of(&mut graph, child);
            graph.add_edge(parent, child, ());
        }
        (graph, indices)
    }

    /// Graphviz rendering of [`Snapshot::to_graph`]
    pub fn to_dot(&self) -> String {
        let (graph, _) = self.to_graph();
        format!("{:?}", Dot::with_config(&graph, &[Config::EdgeNoLabel]))
    }
}
