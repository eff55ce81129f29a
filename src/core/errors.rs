use thiserror::Error;

/// Unified error type for the job tree engine
#[derive(Debug, Error)]
pub enum TreeError {
    /// Two sibling specs under the same parent encode to the same key
    #[error("Node {parent} already has the child {child}")]
    DuplicateChild { parent: String, child: String },

    /// Roots are never stored as children of anything
    #[error("Can't store root node {key} as a child")]
    RootRegistration { key: String },

    /// A node action failed without continue-on-failure; the tree was torn down
    #[error("Node {key} failed: {source}")]
    NodeFailed {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// A node action failed with continue-on-failure; the barrier still advanced
    #[error("Node {key} failed (continued): {source}")]
    SuppressedFailure {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// The tree-level failure handler raised, replacing the original error
    #[error("Failure handler of tree {tree} failed: {source}")]
    FailureHandler {
        tree: String,
        #[source]
        source: anyhow::Error,
    },

    /// The children generator of a node raised
    #[error("Children generator of {key} failed: {source}")]
    ChildrenGenerator {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Unknown tree: {0}")]
    UnknownTree(String),

    #[error("Unknown node {node} in tree {tree}")]
    UnknownNode { tree: String, node: String },

    #[error("Tree already registered: {0}")]
    TreeAlreadyRegistered(String),

    #[error("Invalid tree definition: {0}")]
    Definition(String),

    #[error("Malformed node key {key}: {reason}")]
    MalformedKey { key: String, reason: String },

    /// A non-root node has no parent index entry anymore
    #[error("Node {0} is detached from its parent")]
    Detached(String),

    #[error("Resource codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Store operation failed: {operation}")]
    Store {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TreeError {
    pub fn duplicate_child(parent: impl Into<String>, child: impl Into<String>) -> Self {
        Self::DuplicateChild {
            parent: parent.into(),
            child: child.into(),
        }
    }

    pub fn malformed_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn store<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::Store {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// True for the continue-on-failure path: siblings keep running
    pub fn is_suppressed(&self) -> bool {
        matches!(self, Self::SuppressedFailure { .. })
    }

    /// The error raised by a node action, if this error wraps one
    pub fn action_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::NodeFailed { source, .. }
            | Self::SuppressedFailure { source, .. }
            | Self::FailureHandler { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::DuplicateChild { .. } | Self::RootRegistration { .. } => "registration",
            Self::NodeFailed { .. } | Self::FailureHandler { .. } => "hard_failure",
            Self::SuppressedFailure { .. } => "suppressed_failure",
            Self::ChildrenGenerator { .. } => "generator",
            Self::UnknownTree(_)
            | Self::UnknownNode { .. }
            | Self::TreeAlreadyRegistered(_)
            | Self::Definition(_) => "definition",
            Self::MalformedKey { .. } | Self::Detached(_) => "identity",
            Self::Codec(_) | Self::Serialization(_) => "serialization",
            Self::Configuration(_) => "configuration",
            Self::Store { .. } => "store",
            Self::Queue(_) => "queue",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, TreeError>;

impl From<sled::Error> for TreeError {
    fn from(err: sled::Error) -> Self {
        Self::store("sled_operation", err)
    }
}

impl From<serde_yaml::Error> for TreeError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(err.to_string())
    }
}
