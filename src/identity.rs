//! Canonical node identity
//!
//! A node key is `jobtree:node:` followed by the compact JSON array
//! `[tree, node, args...]`. The encoding is reversible so a key found in
//! storage can be turned back into a live node.

use crate::core::errors::{Result, TreeError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const KEY_NAMESPACE: &str = "jobtree:";
pub const NODE_KEY_PREFIX: &str = "jobtree:node:";
/// Hash of child key -> parent key
pub const PARENTS_KEY: &str = "jobtree:node:parents";
/// Set of root keys currently in flight
pub const LAUNCHED_TREES_KEY: &str = "jobtree:tree:launched";

const CHILDREN_SUFFIX: &str = ":children";
const LOCK_SUFFIX: &str = ":lock";

/// Storage identity of one node instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeKey(String);

/// Decoded contents of a [`NodeKey`]
#[derive(Debug, Clone, PartialEq)]
pub struct KeyParts {
    pub tree: String,
    pub node: String,
    pub args: Vec<Value>,
}

impl NodeKey {
    pub fn encode(tree: &str, node: &str, args: &[Value]) -> Result<Self> {
        let mut parts = Vec::with_capacity(args.len() + 2);
        parts.push(Value::String(tree.to_string()));
        parts.push(Value::String(node.to_string()));
        parts.extend(args.iter().cloned());
        let payload = serde_json::to_string(&parts)?;
        Ok(Self(format!("{}{}", NODE_KEY_PREFIX, payload)))
    }

    /// Wrap a raw key read back from storage
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn decode(&self) -> Result<KeyParts> {
        let payload = self
            .0
            .strip_prefix(NODE_KEY_PREFIX)
            .ok_or_else(|| TreeError::malformed_key(&self.0, "missing node prefix"))?;
        let parts: Vec<Value> = serde_json::from_str(payload)
            .map_err(|e| TreeError::malformed_key(&self.0, e.to_string()))?;
        let mut parts = parts.into_iter();
        let tree = match parts.next() {
            Some(Value::String(s)) => s,
            _ => return Err(TreeError::malformed_key(&self.0, "tree name is not a string")),
        };
        let node = match parts.next() {
            Some(Value::String(s)) => s,
            _ => return Err(TreeError::malformed_key(&self.0, "node name is not a string")),
        };
        Ok(KeyParts {
            tree,
            node,
            args: parts.collect(),
        })
    }

    pub fn children_key(&self) -> String {
        format!("{}{}", self.0, CHILDREN_SUFFIX)
    }

    pub fn lock_key(&self) -> String {
        format!("{}{}", self.0, LOCK_SUFFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NodeKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
