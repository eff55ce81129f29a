//! Registry of tree definitions, looked up by name at run time

use crate::core::errors::{Result, TreeError};
use crate::definition::{NodeDefinition, TreeDefinition};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Clone, Default)]
pub struct TreeRegistry {
    trees: Arc<DashMap<String, Arc<TreeDefinition>>>,
}

impl TreeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tree: TreeDefinition) -> Result<Arc<TreeDefinition>> {
        let name = tree.name().to_string();
        let tree = Arc::new(tree);
        match self.trees.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(TreeError::TreeAlreadyRegistered(name))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tree.clone());
                info!(tree = %name, "Registered tree definition");
                Ok(tree)
            }
        }
    }

    pub fn find_tree(&self, name: &str) -> Result<Arc<TreeDefinition>> {
        self.trees
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TreeError::UnknownTree(name.to_string()))
    }

    pub fn find_node(&self, tree: &str, node: &str) -> Result<NodeDefinition> {
        self.find_tree(tree)?.find(node).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.trees.contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.trees.iter().map(|entry| entry.key().clone()).collect()
    }
}
