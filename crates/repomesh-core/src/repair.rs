//! Cycle breaking and heuristic single-node recovery.
//!
//! Cycle policy: for a flow-ordered cycle `[n0, n1, .., nk, n0]` the link
//! "n0 depends on nk" is removed. It is always that link, whatever the edge's
//! strength or criticality. Cutting a critical edge is allowed but logged and
//! flagged on the returned [`CycleRepair`].
//!
//! Node repair is best effort. A strategy is chosen from keywords in the
//! node's error text; the result records what was attempted, not whether the
//! node is now correct.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::graph::{ComplianceRecord, Graph, NodeKind, NodeStatus};

/// What a node repair did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStrategy {
    StripMissingDependencies,
    NormalizePath,
    ForceCompliance,
    /// No keyword matched; the node is simply re-queued.
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairAction {
    pub strategy: RepairStrategy,
    pub detail: String,
}

/// Outcome of [`Repairer::repair_node`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRepair {
    pub node_id: String,
    pub success: bool,
    pub actions: Vec<RepairAction>,
    pub error: Option<String>,
    pub elapsed: Duration,
}

/// Outcome of breaking one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRepair {
    pub cycle: Vec<String>,
    /// `(dependent, dependency)` of the removed link, `None` when the closing
    /// link was already gone.
    pub removed: Option<(String, String)>,
    pub critical: bool,
}

impl CycleRepair {
    pub fn is_repaired(&self) -> bool {
        self.removed.is_some()
    }
}

/// Aggregate view over every node repair attempted so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairStats {
    pub total: usize,
    pub repaired: usize,
    pub failed: usize,
    pub total_repairs: usize,
    /// `0.0` when nothing has been repaired.
    pub average_time_ms: f64,
}

#[derive(Debug, Default)]
pub struct Repairer {
    results: BTreeMap<String, NodeRepair>,
    cycles: Vec<CycleRepair>,
}

impl Repairer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find cycles by walking dependents from every node in id order.
    ///
    /// Each cycle is returned in flow order (each id is a dependency of the
    /// next) and closed by repeating its first id. One cycle is reported per
    /// back link found, so overlapping cycles may share nodes.
    pub fn detect_cycles(graph: &Graph) -> Vec<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Active,
            Done,
        }

        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
        let mut cycles = Vec::new();

        for root in graph.nodes() {
            if marks.contains_key(root.id.as_str()) {
                continue;
            }
            // (node, its dependents, index of the next dependent to visit)
            let mut stack: Vec<(&str, Vec<&str>, usize)> = Vec::new();
            marks.insert(root.id.as_str(), Mark::Active);
            stack.push((root.id.as_str(), dependents_of(graph, &root.id), 0));

            while let Some(frame) = stack.last_mut() {
                let id = frame.0;
                let Some(child) = frame.1.get(frame.2).copied() else {
                    marks.insert(id, Mark::Done);
                    stack.pop();
                    continue;
                };
                frame.2 += 1;

                match marks.get(child) {
                    Some(Mark::Done) => {}
                    Some(Mark::Active) => {
                        let start = stack
                            .iter()
                            .position(|(n, _, _)| *n == child)
                            .unwrap_or(0);
                        let mut cycle: Vec<String> =
                            stack[start..].iter().map(|(n, _, _)| n.to_string()).collect();
                        cycle.push(child.to_string());
                        cycles.push(cycle);
                    }
                    None => {
                        if !graph.contains(child) {
                            continue;
                        }
                        marks.insert(child, Mark::Active);
                        stack.push((child, dependents_of(graph, child), 0));
                    }
                }
            }
        }

        cycles
    }

    /// Break each cycle by removing the link "first depends on last".
    #[instrument(skip_all, fields(cycles = cycles.len()))]
    pub fn repair_cycles(
        &mut self,
        graph: &mut Graph,
        cycles: &[Vec<String>],
    ) -> OrchestratorResult<Vec<CycleRepair>> {
        let mut repairs = Vec::with_capacity(cycles.len());

        for cycle in cycles {
            let mut members: &[String] = cycle;
            if members.len() > 1 && members.first() == members.last() {
                members = &members[..members.len() - 1];
            }
            let (Some(first), Some(last)) = (members.first(), members.last()) else {
                continue;
            };

            let critical = graph.edge(first, last).is_some_and(|e| e.critical);
            let removed = if graph.contains(first) && graph.remove_edge(first, last)? {
                Some((first.clone(), last.clone()))
            } else {
                None
            };

            match &removed {
                Some(_) if critical => warn!(
                    dependent = %first,
                    dependency = %last,
                    "cut critical edge to break cycle"
                ),
                Some(_) => debug!(dependent = %first, dependency = %last, "cut edge to break cycle"),
                None => warn!(cycle = ?cycle, "closing link already absent, cycle not repaired"),
            }

            let repair = CycleRepair {
                cycle: cycle.clone(),
                removed,
                critical,
            };
            self.cycles.push(repair.clone());
            repairs.push(repair);
        }

        Ok(repairs)
    }

    /// Apply every strategy whose keyword appears in `error_text`.
    ///
    /// Keywords are matched case-insensitively: `missing` or `not found`
    /// strips dependencies on absent nodes, `path` or `file` normalizes path
    /// separators, `governance` or `compliance` resets the compliance record.
    /// With no match the node gets a retry marker and success is reported.
    pub fn repair_node(&mut self, graph: &mut Graph, id: &str, error_text: &str) -> NodeRepair {
        let started = Instant::now();
        let outcome = apply_strategies(graph, id, &error_text.to_lowercase());

        let repair = match outcome {
            Ok(actions) => NodeRepair {
                node_id: id.to_string(),
                success: true,
                actions,
                error: None,
                elapsed: started.elapsed(),
            },
            Err(e) => {
                warn!(node_id = %id, error = %e, "node repair failed");
                NodeRepair {
                    node_id: id.to_string(),
                    success: false,
                    actions: Vec::new(),
                    error: Some(e.to_string()),
                    elapsed: started.elapsed(),
                }
            }
        };
        self.results.insert(id.to_string(), repair.clone());
        repair
    }

    /// Repair every `failed` or `pending` node (optionally of one kind) from its
    /// last error, then put it back to `pending` for another resolution pass.
    #[instrument(skip_all, fields(kind = ?kind))]
    pub fn auto_repair_all(
        &mut self,
        graph: &mut Graph,
        kind: Option<NodeKind>,
    ) -> OrchestratorResult<Vec<NodeRepair>> {
        let targets: Vec<(String, String)> = graph
            .nodes()
            .filter(|n| kind.map_or(true, |k| n.kind == k))
            .filter(|n| matches!(n.status, NodeStatus::Failed | NodeStatus::Pending))
            .map(|n| {
                (
                    n.id.clone(),
                    n.execution.last_error.clone().unwrap_or_default(),
                )
            })
            .collect();

        let mut repairs = Vec::with_capacity(targets.len());
        for (id, error_text) in targets {
            let repair = self.repair_node(graph, &id, &error_text);
            graph.reset_status(&id)?;
            repairs.push(repair);
        }

        info!(requeued = repairs.len(), "auto repair pass finished");
        Ok(repairs)
    }

    /// Cycle repairs recorded so far, in order.
    pub fn cycle_repairs(&self) -> &[CycleRepair] {
        &self.cycles
    }

    pub fn statistics(&self) -> RepairStats {
        let mut stats = RepairStats {
            total: self.results.len(),
            ..Default::default()
        };
        let mut total_ms = 0.0;
        for r in self.results.values() {
            if r.success {
                stats.repaired += 1;
            } else {
                stats.failed += 1;
            }
            stats.total_repairs += r.actions.len();
            total_ms += r.elapsed.as_secs_f64() * 1000.0;
        }
        if stats.total > 0 {
            stats.average_time_ms = total_ms / stats.total as f64;
        }
        stats
    }
}

fn dependents_of<'g>(graph: &'g Graph, id: &str) -> Vec<&'g str> {
    graph
        .node(id)
        .map(|n| n.dependents.iter().map(String::as_str).collect())
        .unwrap_or_default()
}

fn apply_strategies(
    graph: &mut Graph,
    id: &str,
    error_text: &str,
) -> OrchestratorResult<Vec<RepairAction>> {
    let node = graph
        .node(id)
        .ok_or_else(|| OrchestratorError::unknown_node(id))?;
    let mut actions = Vec::new();

    if error_text.contains("missing") || error_text.contains("not found") {
        let unresolved: BTreeSet<String> = node
            .dependencies
            .iter()
            .filter(|d| !graph.contains(d))
            .cloned()
            .collect();
        for dep in &unresolved {
            graph.remove_edge(id, dep)?;
        }
        actions.push(RepairAction {
            strategy: RepairStrategy::StripMissingDependencies,
            detail: format!("removed {} unresolved dependencies", unresolved.len()),
        });
    }

    if error_text.contains("path") || error_text.contains("file") {
        let node = graph
            .node_mut(id)
            .ok_or_else(|| OrchestratorError::unknown_node(id))?;
        let detail = match node.path.as_mut() {
            Some(path) => {
                *path = normalize_path(path);
                format!("normalized path to {path}")
            }
            None => "no path to normalize".to_string(),
        };
        actions.push(RepairAction {
            strategy: RepairStrategy::NormalizePath,
            detail,
        });
    }

    if error_text.contains("governance") || error_text.contains("compliance") {
        let node = graph
            .node_mut(id)
            .ok_or_else(|| OrchestratorError::unknown_node(id))?;
        node.compliance = ComplianceRecord::fully_compliant();
        actions.push(RepairAction {
            strategy: RepairStrategy::ForceCompliance,
            detail: "compliance record reset to fully compliant".to_string(),
        });
    }

    if actions.is_empty() {
        actions.push(RepairAction {
            strategy: RepairStrategy::Retry,
            detail: "no matching strategy, marked for retry".to_string(),
        });
    }
    Ok(actions)
}

/// Forward slashes only, no repeated separators.
fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let mut out = String::with_capacity(unified.len());
    let mut prev_slash = false;
    for c in unified.chars() {
        if c == '/' && prev_slash {
            continue;
        }
        prev_slash = c == '/';
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, EdgeKind, Node};

    fn triangle() -> Graph {
        // b depends on a, c depends on b, a depends on c
        let mut g = Graph::new();
        for id in ["a", "b", "c"] {
            g.add_node(Node::new(id, NodeKind::Pipeline, "org"));
        }
        g.add_edge(Edge::new("b", "a", EdgeKind::Dependency)).unwrap();
        g.add_edge(Edge::new("c", "b", EdgeKind::Dependency)).unwrap();
        g.add_edge(Edge::new("a", "c", EdgeKind::Dependency)).unwrap();
        g
    }

    #[test]
    fn test_detect_cycles_flow_order() {
        let g = triangle();
        let cycles = Repairer::detect_cycles(&g);
        assert_eq!(cycles, vec![vec!["a", "b", "c", "a"]]);
    }

    #[test]
    fn test_detect_cycles_none_on_dag() {
        let mut g = Graph::new();
        for id in ["a", "b"] {
            g.add_node(Node::new(id, NodeKind::Pipeline, "org"));
        }
        g.add_edge(Edge::new("b", "a", EdgeKind::Dependency)).unwrap();
        assert!(Repairer::detect_cycles(&g).is_empty());
    }

    #[test]
    fn test_repair_cycles_cuts_first_to_last() {
        let mut g = triangle();
        let mut repairer = Repairer::new();
        let cycle: Vec<String> = ["a", "b", "c", "a"].iter().map(|s| s.to_string()).collect();
        let repairs = repairer.repair_cycles(&mut g, &[cycle]).unwrap();

        assert_eq!(
            repairs[0].removed,
            Some(("a".to_string(), "c".to_string()))
        );
        assert!(g.edge("a", "c").is_none());
        assert!(!g.node("c").unwrap().dependents.contains("a"));
        assert!(g.edge("b", "a").is_some());
        assert!(g.edge("c", "b").is_some());
        assert!(Repairer::detect_cycles(&g).is_empty());
    }

    #[test]
    fn test_cutting_critical_edge_is_flagged() {
        let mut g = Graph::new();
        for id in ["x", "y"] {
            g.add_node(Node::new(id, NodeKind::Agent, "org"));
        }
        g.add_edge(Edge::new("y", "x", EdgeKind::Dependency)).unwrap();
        g.add_edge(Edge::new("x", "y", EdgeKind::Dependency).critical())
            .unwrap();

        let mut repairer = Repairer::new();
        let cycles = Repairer::detect_cycles(&g);
        let repairs = repairer.repair_cycles(&mut g, &cycles).unwrap();
        assert!(repairs[0].critical);
        assert!(repairs[0].is_repaired());
        assert_eq!(repairer.cycle_repairs().len(), 1);
    }

    #[test]
    fn test_repair_cycle_with_missing_link_is_unrepaired() {
        let mut g = triangle();
        let mut repairer = Repairer::new();
        let bogus: Vec<String> = ["b", "c", "b"].iter().map(|s| s.to_string()).collect();
        let repairs = repairer.repair_cycles(&mut g, &[bogus]).unwrap();
        assert!(!repairs[0].is_repaired());
        assert_eq!(g.edge_count(), 3);
    }

    #[test]
    fn test_repair_node_strategies() {
        let mut g = Graph::new();
        g.add_node(
            Node::new("f", NodeKind::File, "org").with_path("src\\\\nested\\mod.rs"),
        );
        g.declare_dependency("f", "ghost").unwrap();
        g.node_mut("f").unwrap().compliance.score = 20.0;

        let mut repairer = Repairer::new();
        let missing = repairer.repair_node(&mut g, "f", "Dependency NOT FOUND: ghost");
        assert!(missing.success);
        assert_eq!(missing.actions[0].strategy, RepairStrategy::StripMissingDependencies);
        assert!(g.node("f").unwrap().dependencies.is_empty());

        repairer.repair_node(&mut g, "f", "bad file path");
        assert_eq!(g.node("f").unwrap().path.as_deref(), Some("src/nested/mod.rs"));

        repairer.repair_node(&mut g, "f", "governance violation");
        assert_eq!(g.node("f").unwrap().compliance.score, 100.0);
        assert!(g.node("f").unwrap().compliance.compliant);

        let retry = repairer.repair_node(&mut g, "f", "something odd");
        assert!(retry.success);
        assert_eq!(retry.actions[0].strategy, RepairStrategy::Retry);
    }

    #[test]
    fn test_repair_unknown_node_counts_as_failure() {
        let mut g = Graph::new();
        let mut repairer = Repairer::new();
        let repair = repairer.repair_node(&mut g, "nope", "missing");
        assert!(!repair.success);
        let stats = repairer.statistics();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn test_auto_repair_requeues_failed_files() {
        let mut g = Graph::new();
        g.add_node(Node::new("f", NodeKind::File, "org"));
        g.add_node(Node::new("p", NodeKind::Pipeline, "org"));
        g.declare_dependency("f", "ghost").unwrap();
        for id in ["f", "p"] {
            g.mark_node_running(id).unwrap();
            g.mark_node_failed(id, "missing dependency: ghost").unwrap();
        }

        let mut repairer = Repairer::new();
        let repairs = repairer
            .auto_repair_all(&mut g, Some(NodeKind::File))
            .unwrap();
        assert_eq!(repairs.len(), 1);

        let f = g.node("f").unwrap();
        assert_eq!(f.status, NodeStatus::Pending);
        assert!(f.dependencies.is_empty());
        assert_eq!(g.node("p").unwrap().status, NodeStatus::Failed);

        let stats = repairer.statistics();
        assert_eq!(stats.repaired, 1);
        assert_eq!(stats.total_repairs, 1);
    }

    #[test]
    fn test_statistics_empty_is_zero() {
        let stats = Repairer::new().statistics();
        assert_eq!(stats, RepairStats::default());
    }
}
