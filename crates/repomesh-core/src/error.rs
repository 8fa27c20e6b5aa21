//! Error types for graph construction, repair, planning and execution.

use thiserror::Error;

use crate::graph::NodeStatus;

/// Errors produced by the orchestration layer.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A descriptor or execution setting is malformed.
    #[error("configuration error in {entity}: {reason}")]
    Configuration { entity: String, reason: String },

    /// An edge between the same ordered pair already exists.
    #[error("duplicate edge: {dependent} already depends on {dependency}")]
    DuplicateEdge {
        dependent: String,
        dependency: String,
    },

    /// A referenced node is not present in the graph.
    #[error("node not found in graph: {id}")]
    UnknownNode { id: String },

    /// A status change the node state machine does not allow.
    #[error("invalid status transition for node {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: NodeStatus,
        to: NodeStatus,
    },

    /// The graph contains a dependency cycle where an acyclic graph is required.
    #[error("dependency cycle detected involving nodes: {nodes:?}")]
    CyclicGraph { nodes: Vec<String> },

    /// A node could not be resolved cleanly.
    #[error("resolution issue on node {node}: {detail}")]
    ResolutionIssue { node: String, detail: String },

    /// A node task failed or timed out.
    #[error("task failed for node {node}: {reason}")]
    TaskFailure { node: String, reason: String },

    /// The build produced no nodes, nothing can be planned.
    #[error("graph is empty after build")]
    EmptyGraph,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl OrchestratorError {
    /// Shorthand for a [`OrchestratorError::Configuration`] error.
    pub fn configuration(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`OrchestratorError::UnknownNode`] error.
    pub fn unknown_node(id: impl Into<String>) -> Self {
        Self::UnknownNode { id: id.into() }
    }

    /// `true` for errors that abort the whole run rather than a single node.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            Self::CyclicGraph { .. } | Self::EmptyGraph | Self::Io(_) | Self::Json(_) | Self::Toml(_)
        )
    }
}

/// Convenience result alias.
pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;
