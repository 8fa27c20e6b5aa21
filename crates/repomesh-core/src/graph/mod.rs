//! Multi-repo dependency graph.
//!
//! Nodes are keyed by id. An edge `source → target` means "source depends on
//! target": `target` is recorded in `source.dependencies` and `source` in
//! `target.dependents`. The two sets are kept mirrored by every mutator on
//! [`Graph`]; [`Graph::remove_edge`] is the only way to drop a link and it
//! clears both sides together.
//!
//! During build a node may declare a dependency on an id that does not exist
//! yet ([`Graph::declare_dependency`]). Such dangling ids live only in
//! `dependencies` until the target is added ([`Graph::add_node`] then links
//! both sides) or the resolver prunes them.

pub mod layers;
pub mod model;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{OrchestratorError, OrchestratorResult};

pub use layers::compute_layers;
pub use model::{ComplianceRecord, Edge, EdgeKind, ExecutionMeta, Node, NodeKind, NodeStatus};

/// Run-scoped execution bookkeeping kept alongside the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub max_concurrency: usize,
    pub executing: BTreeSet<String>,
    pub completed: BTreeSet<String>,
    pub failed: BTreeSet<String>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            executing: BTreeSet::new(),
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
        }
    }
}

/// Aggregate counts over the graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStatistics {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub by_kind: BTreeMap<NodeKind, usize>,
    pub by_organization: BTreeMap<String, usize>,
    pub by_status: BTreeMap<NodeStatus, usize>,
    pub completed: usize,
    pub failed: usize,
    /// Mean compliance score over all nodes, `0.0` for an empty graph.
    pub average_compliance: f64,
}

impl GraphStatistics {
    /// Completed nodes over total nodes, `0.0` for an empty graph.
    pub fn completion_rate(&self) -> f64 {
        if self.total_nodes == 0 {
            return 0.0;
        }
        self.completed as f64 / self.total_nodes as f64
    }
}

/// Serializable copy of the graph handed to the persistence layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub statistics: GraphStatistics,
    /// Hex SHA-256 of the serialized nodes and edges.
    pub digest: String,
}

/// Directed dependency graph over [`Node`]s.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: BTreeMap<String, Node>,
    edges: Vec<Edge>,
    context: ExecutionContext,
}

impl Graph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Returns `false` and leaves the graph untouched when
    /// the id is already present.
    ///
    /// Dangling declarations from existing nodes onto the new id become full
    /// dependency edges, mirror included.
    pub fn add_node(&mut self, mut node: Node) -> bool {
        if self.nodes.contains_key(&node.id) {
            return false;
        }
        let declared: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.dependencies.contains(&node.id))
            .map(|n| n.id.clone())
            .collect();
        for source in declared {
            self.edges
                .push(Edge::new(source.as_str(), node.id.as_str(), EdgeKind::Dependency));
            node.dependents.insert(source);
        }
        self.nodes.insert(node.id.clone(), node);
        true
    }

    /// Add `edge.source` depends on `edge.target`.
    ///
    /// Both nodes must exist. A second edge between the same ordered pair is
    /// rejected with [`OrchestratorError::DuplicateEdge`]; a dangling
    /// declaration of the same pair is upgraded to a full edge.
    pub fn add_edge(&mut self, edge: Edge) -> OrchestratorResult<()> {
        if !self.nodes.contains_key(&edge.source) {
            return Err(OrchestratorError::unknown_node(&edge.source));
        }
        if !self.nodes.contains_key(&edge.target) {
            return Err(OrchestratorError::unknown_node(&edge.target));
        }
        if self.edge(&edge.source, &edge.target).is_some() {
            return Err(OrchestratorError::DuplicateEdge {
                dependent: edge.source,
                dependency: edge.target,
            });
        }

        if let Some(source) = self.nodes.get_mut(&edge.source) {
            source.dependencies.insert(edge.target.clone());
        }
        if let Some(target) = self.nodes.get_mut(&edge.target) {
            target.dependents.insert(edge.source.clone());
        }
        self.edges.push(edge);
        Ok(())
    }

    /// Record that `source` depends on `target` even though `target` may not
    /// exist yet. When `target` is present this is a plain dependency edge.
    ///
    /// Returns `true` when the link is new.
    pub fn declare_dependency(&mut self, source: &str, target: &str) -> OrchestratorResult<bool> {
        if !self.nodes.contains_key(source) {
            return Err(OrchestratorError::unknown_node(source));
        }
        if self.nodes.contains_key(target) {
            return match self.add_edge(Edge::new(source, target, EdgeKind::Dependency)) {
                Ok(()) => Ok(true),
                Err(OrchestratorError::DuplicateEdge { .. }) => Ok(false),
                Err(e) => Err(e),
            };
        }
        let node = self
            .nodes
            .get_mut(source)
            .ok_or_else(|| OrchestratorError::unknown_node(source))?;
        Ok(node.dependencies.insert(target.to_string()))
    }

    /// Remove the link "source depends on target" from both sides and drop
    /// the matching edge record. Returns `true` if a link was present.
    pub fn remove_edge(&mut self, source: &str, target: &str) -> OrchestratorResult<bool> {
        let node = self
            .nodes
            .get_mut(source)
            .ok_or_else(|| OrchestratorError::unknown_node(source))?;
        let mut existed = node.dependencies.remove(target);
        if let Some(dependency) = self.nodes.get_mut(target) {
            existed |= dependency.dependents.remove(source);
        }
        let before = self.edges.len();
        self.edges
            .retain(|e| !(e.source == source && e.target == target));
        Ok(existed || self.edges.len() != before)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub(crate) fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// All nodes, ordered by id.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// The edge record for "source depends on target", if any.
    pub fn edge(&self, source: &str, target: &str) -> Option<&Edge> {
        self.edges
            .iter()
            .find(|e| e.source == source && e.target == target)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn set_max_concurrency(&mut self, max_concurrency: usize) {
        self.context.max_concurrency = max_concurrency;
    }

    fn transition(&mut self, id: &str, to: NodeStatus) -> OrchestratorResult<&mut Node> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::unknown_node(id))?;
        if !node.status.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition {
                id: id.to_string(),
                from: node.status,
                to,
            });
        }
        node.status = to;
        Ok(node)
    }

    pub fn mark_node_running(&mut self, id: &str) -> OrchestratorResult<()> {
        let node = self.transition(id, NodeStatus::Running)?;
        node.execution.started_at = Some(Utc::now());
        node.execution.completed_at = None;
        self.context.failed.remove(id);
        self.context.executing.insert(id.to_string());
        Ok(())
    }

    pub fn mark_node_completed(
        &mut self,
        id: &str,
        result: Option<serde_json::Value>,
    ) -> OrchestratorResult<()> {
        let node = self.transition(id, NodeStatus::Completed)?;
        node.execution.completed_at = Some(Utc::now());
        node.execution.last_error = None;
        node.execution.result = result;
        self.context.executing.remove(id);
        self.context.completed.insert(id.to_string());
        Ok(())
    }

    /// Fail a running node, recording the error and bumping its retry count.
    pub fn mark_node_failed(&mut self, id: &str, error: impl Into<String>) -> OrchestratorResult<()> {
        let node = self.transition(id, NodeStatus::Failed)?;
        node.execution.completed_at = Some(Utc::now());
        node.execution.last_error = Some(error.into());
        node.execution.retry_count += 1;
        self.context.executing.remove(id);
        self.context.failed.insert(id.to_string());
        Ok(())
    }

    pub fn mark_node_skipped(&mut self, id: &str, reason: Option<String>) -> OrchestratorResult<()> {
        let node = self.transition(id, NodeStatus::Skipped)?;
        node.execution.completed_at = Some(Utc::now());
        if reason.is_some() {
            node.execution.last_error = reason;
        }
        self.context.executing.remove(id);
        self.context.failed.remove(id);
        Ok(())
    }

    /// Put a node back to `pending` and clear its run-scoped metadata.
    ///
    /// This is a re-seed for a new pass, not a state-machine transition.
    pub fn reset_status(&mut self, id: &str) -> OrchestratorResult<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::unknown_node(id))?;
        node.status = NodeStatus::Pending;
        node.execution.started_at = None;
        node.execution.completed_at = None;
        node.execution.retry_count = 0;
        node.execution.last_error = None;
        node.execution.result = None;
        self.context.executing.remove(id);
        self.context.completed.remove(id);
        self.context.failed.remove(id);
        Ok(())
    }

    /// All transitive dependents of `id` (BFS over `dependents`).
    pub fn transitive_dependents(&self, id: &str) -> OrchestratorResult<BTreeSet<String>> {
        let start = self
            .nodes
            .get(id)
            .ok_or_else(|| OrchestratorError::unknown_node(id))?;
        let mut visited = BTreeSet::new();
        let mut queue: VecDeque<&String> = start.dependents.iter().collect();
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(current) {
                queue.extend(node.dependents.iter());
            }
        }
        visited.remove(id);
        Ok(visited)
    }

    /// `true` when `from` depends on `to`, directly or transitively.
    pub fn depends_transitively(&self, from: &str, to: &str) -> bool {
        let mut visited = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            let Some(node) = self.nodes.get(current) else {
                continue;
            };
            for dep in &node.dependencies {
                if dep == to {
                    return true;
                }
                if visited.insert(dep.as_str()) {
                    queue.push_back(dep.as_str());
                }
            }
        }
        false
    }

    pub fn statistics(&self) -> GraphStatistics {
        let mut stats = GraphStatistics {
            total_nodes: self.nodes.len(),
            total_edges: self.edges.len(),
            ..Default::default()
        };
        let mut compliance_sum = 0.0;
        for node in self.nodes.values() {
            *stats.by_kind.entry(node.kind).or_default() += 1;
            *stats
                .by_organization
                .entry(node.organization.clone())
                .or_default() += 1;
            *stats.by_status.entry(node.status).or_default() += 1;
            match node.status {
                NodeStatus::Completed => stats.completed += 1,
                NodeStatus::Failed => stats.failed += 1,
                _ => {}
            }
            compliance_sum += node.compliance.score;
        }
        if !self.nodes.is_empty() {
            stats.average_compliance = compliance_sum / self.nodes.len() as f64;
        }
        stats
    }

    pub fn snapshot(&self) -> OrchestratorResult<GraphSnapshot> {
        let nodes: Vec<Node> = self.nodes.values().cloned().collect();
        let edges = self.edges.clone();
        let bytes = serde_json::to_vec(&(&nodes, &edges))?;
        let digest = hex::encode(Sha256::digest(&bytes));
        Ok(GraphSnapshot {
            nodes,
            edges,
            statistics: self.statistics(),
            digest,
        })
    }
}
