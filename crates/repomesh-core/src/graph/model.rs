//! Node and edge records of the multi-repo graph.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a node stands for in the multi-repo inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Repository,
    Pipeline,
    Agent,
    File,
    SemanticUnit,
    Dependency,
    Cluster,
    Deployment,
    Organization,
    Project,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Repository => "repository",
            NodeKind::Pipeline => "pipeline",
            NodeKind::Agent => "agent",
            NodeKind::File => "file",
            NodeKind::SemanticUnit => "semantic-unit",
            NodeKind::Dependency => "dependency",
            NodeKind::Cluster => "cluster",
            NodeKind::Deployment => "deployment",
            NodeKind::Organization => "organization",
            NodeKind::Project => "project",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relationship carried by an [`Edge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    #[default]
    Dependency,
    Reference,
    Include,
    Import,
    DeployTo,
    ManagedBy,
    PartOf,
}

/// Lifecycle state of a node.
///
/// Allowed transitions: `pending → running`, `failed → running` (retry),
/// `running → completed | failed`, and any non-terminal state `→ skipped`.
/// `completed` and `skipped` are terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        }
    }

    /// `true` once the node can no longer change status within a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Skipped)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        match (self, next) {
            (Completed, _) | (Skipped, _) => false,
            (Pending, Running) | (Failed, Running) => true,
            (Running, Completed) | (Running, Failed) => true,
            (_, Skipped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timestamps and retry bookkeeping for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMeta {
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Payload returned by the node task on success.
    pub result: Option<serde_json::Value>,
}

impl Default for ExecutionMeta {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            last_error: None,
            result: None,
        }
    }
}

/// Governance metadata attached to each node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceRecord {
    pub compliant: bool,
    /// 0–100.
    pub score: f64,
    pub violations: Vec<String>,
    pub last_audit: Option<DateTime<Utc>>,
}

impl ComplianceRecord {
    /// Fully compliant record audited now.
    pub fn fully_compliant() -> Self {
        Self {
            compliant: true,
            score: 100.0,
            violations: Vec::new(),
            last_audit: Some(Utc::now()),
        }
    }
}

impl Default for ComplianceRecord {
    fn default() -> Self {
        Self {
            compliant: true,
            score: 100.0,
            violations: Vec::new(),
            last_audit: None,
        }
    }
}

/// A unit of work or inventory item in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    /// Owning repository id.
    pub repository: String,
    pub organization: String,
    pub governance_layer: String,
    pub path: Option<String>,
    /// Ids this node depends on.
    pub dependencies: BTreeSet<String>,
    /// Ids that depend on this node.
    pub dependents: BTreeSet<String>,
    /// Higher runs first within a wave.
    pub priority: i32,
    pub status: NodeStatus,
    pub execution: ExecutionMeta,
    pub compliance: ComplianceRecord,
}

impl Node {
    /// Create a pending node with no edges.
    pub fn new(id: impl Into<String>, kind: NodeKind, organization: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            repository: id.clone(),
            id,
            kind,
            organization: organization.into(),
            governance_layer: "default".to_string(),
            path: None,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            priority: 0,
            status: NodeStatus::Pending,
            execution: ExecutionMeta::default(),
            compliance: ComplianceRecord::default(),
        }
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_governance_layer(mut self, layer: impl Into<String>) -> Self {
        self.governance_layer = layer.into();
        self
    }
}

/// A directed edge: `source` depends on `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    /// The dependent node.
    pub source: String,
    /// The dependency node.
    pub target: String,
    pub kind: EdgeKind,
    /// Layout/optimizer weight only, never used for correctness.
    pub strength: f64,
    /// Removal must be recorded, never silent.
    pub critical: bool,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>, kind: EdgeKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            target: target.into(),
            kind,
            strength: 1.0,
            critical: false,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = strength;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_reject_every_transition() {
        for next in [
            NodeStatus::Pending,
            NodeStatus::Running,
            NodeStatus::Completed,
            NodeStatus::Failed,
            NodeStatus::Skipped,
        ] {
            assert!(!NodeStatus::Completed.can_transition_to(next));
            assert!(!NodeStatus::Skipped.can_transition_to(next));
        }
    }

    #[test]
    fn test_retry_path_is_allowed() {
        assert!(NodeStatus::Failed.can_transition_to(NodeStatus::Running));
        assert!(NodeStatus::Pending.can_transition_to(NodeStatus::Skipped));
        assert!(!NodeStatus::Pending.can_transition_to(NodeStatus::Completed));
        assert!(!NodeStatus::Running.can_transition_to(NodeStatus::Pending));
    }

    #[test]
    fn test_node_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&NodeKind::SemanticUnit).unwrap();
        assert_eq!(json, "\"semantic-unit\"");
        let kind: EdgeKind = serde_json::from_str("\"deploy-to\"").unwrap();
        assert_eq!(kind, EdgeKind::DeployTo);
    }
}
