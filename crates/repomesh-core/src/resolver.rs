//! Dependency resolution: prune dangling dependencies, link orphans.
//!
//! Nodes are processed in fixed-size batches. Inside a batch every node is
//! analysed independently against the same read borrow of the graph, so one
//! node's findings never depend on another's fixes. Analysis is a pure read
//! with no suspension points and runs inline. The fixes are then applied one
//! node at a time. Batches run in order, which lets a later batch see the
//! repairs made by an earlier one; the resolver yields to the runtime between
//! batches.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::ResolverConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::graph::{Edge, EdgeKind, Graph, Node, NodeKind, NodeStatus};

/// Decides whether a node without dependents is an intentional leaf.
pub trait LeafPolicy: Send + Sync {
    fn is_intentional_leaf(&self, node: &Node) -> bool;
}

impl<F> LeafPolicy for F
where
    F: Fn(&Node) -> bool + Send + Sync,
{
    fn is_intentional_leaf(&self, node: &Node) -> bool {
        self(node)
    }
}

/// Default leaf policy.
///
/// Only `file`, `semantic-unit` and `dependency` nodes can be orphans. A file
/// whose stem matches one of the configured entry points (`index.ts`,
/// `main.rs`, ...) is an intentional leaf.
#[derive(Debug, Clone)]
pub struct EntryPointPolicy {
    entry_points: Vec<String>,
}

impl EntryPointPolicy {
    pub fn new(entry_points: Vec<String>) -> Self {
        Self { entry_points }
    }
}

impl Default for EntryPointPolicy {
    fn default() -> Self {
        Self::new(ResolverConfig::default().entry_points)
    }
}

impl LeafPolicy for EntryPointPolicy {
    fn is_intentional_leaf(&self, node: &Node) -> bool {
        if !matches!(
            node.kind,
            NodeKind::File | NodeKind::SemanticUnit | NodeKind::Dependency
        ) {
            return true;
        }
        let Some(path) = node.path.as_deref() else {
            return false;
        };
        let normalized = path.replace('\\', "/");
        Path::new(&normalized)
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|stem| self.entry_points.iter().any(|e| e.eq_ignore_ascii_case(stem)))
    }
}

/// Outcome of resolving one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResolution {
    pub node_id: String,
    /// `true` when no issues were found.
    pub resolved: bool,
    pub issues: Vec<String>,
    pub fixes: Vec<String>,
    pub elapsed: Duration,
}

/// Aggregate view over the latest resolution of every node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionStats {
    pub total: usize,
    pub resolved: usize,
    pub failed: usize,
    pub total_issues: usize,
    pub total_fixes: usize,
    /// `0.0` when nothing has been resolved.
    pub average_time_ms: f64,
}

/// Read-only findings for one node, computed before any fix in its batch.
struct NodeAnalysis {
    node_id: String,
    missing: Vec<String>,
    orphan_of: Option<String>,
    started: Instant,
}

/// Validates dependency edges and repairs what it safely can.
pub struct Resolver {
    config: ResolverConfig,
    policy: Arc<dyn LeafPolicy>,
    results: BTreeMap<String, NodeResolution>,
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> Self {
        let policy = Arc::new(EntryPointPolicy::new(config.entry_points.clone()));
        Self {
            config,
            policy,
            results: BTreeMap::new(),
        }
    }

    /// Replace the orphan classification hook.
    pub fn with_leaf_policy(mut self, policy: Arc<dyn LeafPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Resolve every `pending` or `failed` node, optionally restricted to one kind.
    ///
    /// Each processed node ends `completed` when no issues were found and
    /// `failed` (with the joined issue text as its error) otherwise.
    #[instrument(skip_all, fields(kind = ?kind, batch_size = self.config.batch_size))]
    pub async fn resolve_all(
        &mut self,
        graph: &mut Graph,
        kind: Option<NodeKind>,
    ) -> OrchestratorResult<BTreeMap<String, NodeResolution>> {
        let candidates: Vec<String> = graph
            .nodes()
            .filter(|n| kind.map_or(true, |k| n.kind == k))
            .filter(|n| matches!(n.status, NodeStatus::Pending | NodeStatus::Failed))
            .map(|n| n.id.clone())
            .collect();

        let batch_size = self.config.batch_size.max(1);
        let mut resolved = BTreeMap::new();

        for (index, batch) in candidates.chunks(batch_size).enumerate() {
            let analyses: Vec<NodeAnalysis> = {
                let shared: &Graph = graph;
                let policy = self.policy.as_ref();
                batch
                    .iter()
                    .filter_map(|id| analyze_node(shared, policy, id))
                    .collect()
            };

            for analysis in analyses {
                let resolution = apply_analysis(graph, analysis)?;
                resolved.insert(resolution.node_id.clone(), resolution);
            }
            debug!(batch = index, size = batch.len(), "resolution batch applied");
            tokio::task::yield_now().await;
        }

        self.results
            .extend(resolved.iter().map(|(k, v)| (k.clone(), v.clone())));

        let failed = resolved.values().filter(|r| !r.resolved).count();
        info!(
            processed = resolved.len(),
            failed = failed,
            "resolution pass finished"
        );
        Ok(resolved)
    }

    /// Latest resolution recorded for `id`.
    pub fn result(&self, id: &str) -> Option<&NodeResolution> {
        self.results.get(id)
    }

    pub fn statistics(&self) -> ResolutionStats {
        let mut stats = ResolutionStats {
            total: self.results.len(),
            ..Default::default()
        };
        let mut total_ms = 0.0;
        for r in self.results.values() {
            if r.resolved {
                stats.resolved += 1;
            } else {
                stats.failed += 1;
            }
            stats.total_issues += r.issues.len();
            stats.total_fixes += r.fixes.len();
            total_ms += r.elapsed.as_secs_f64() * 1000.0;
        }
        if stats.total > 0 {
            stats.average_time_ms = total_ms / stats.total as f64;
        }
        stats
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(ResolverConfig::default())
    }
}

fn analyze_node(graph: &Graph, policy: &dyn LeafPolicy, id: &str) -> Option<NodeAnalysis> {
    let started = Instant::now();
    let node = graph.node(id)?;

    let missing = node
        .dependencies
        .iter()
        .filter(|d| !graph.contains(d))
        .cloned()
        .collect();

    let orphan_of = if node.dependents.is_empty() && !policy.is_intentional_leaf(node) {
        graph
            .node(&node.repository)
            .filter(|repo| repo.kind == NodeKind::Repository && repo.id != node.id)
            .map(|repo| repo.id.clone())
    } else {
        None
    };

    Some(NodeAnalysis {
        node_id: id.to_string(),
        missing,
        orphan_of,
        started,
    })
}

fn apply_analysis(graph: &mut Graph, analysis: NodeAnalysis) -> OrchestratorResult<NodeResolution> {
    let id = analysis.node_id;
    let mut issues = Vec::new();
    let mut fixes = Vec::new();

    for missing in &analysis.missing {
        graph.remove_edge(&id, missing)?;
        issues.push(format!("missing dependency: {missing}"));
        fixes.push(format!("removed missing dependency {missing}"));
    }

    if let Some(repo) = analysis.orphan_of {
        // An orphan that already depends on its repository would close a cycle.
        if graph.depends_transitively(&id, &repo) {
            debug!(node_id = %id, repository = %repo, "orphan not linked, it depends on its repository");
        } else if graph.edge(&repo, &id).is_none() {
            graph.add_edge(Edge::new(repo.as_str(), id.as_str(), EdgeKind::PartOf))?;
            fixes.push(format!("linked orphan to repository {repo}"));
        }
    }

    graph.mark_node_running(&id)?;
    if issues.is_empty() {
        graph.mark_node_completed(&id, None)?;
    } else {
        warn!(node_id = %id, issues = issues.len(), "node resolved with issues");
        let error = OrchestratorError::ResolutionIssue {
            node: id.clone(),
            detail: issues.join("; "),
        };
        graph.mark_node_failed(&id, error.to_string())?;
    }

    Ok(NodeResolution {
        node_id: id,
        resolved: issues.is_empty(),
        issues,
        fixes,
        elapsed: analysis.started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(id: &str, path: &str, repo: &str) -> Node {
        Node::new(id, NodeKind::File, "org")
            .with_repository(repo)
            .with_path(path)
    }

    #[tokio::test]
    async fn test_chain_resolves_without_issues() {
        let mut g = Graph::new();
        for id in ["a", "b", "c"] {
            g.add_node(Node::new(id, NodeKind::Pipeline, "org"));
        }
        g.add_edge(Edge::new("b", "a", EdgeKind::Dependency)).unwrap();
        g.add_edge(Edge::new("c", "b", EdgeKind::Dependency)).unwrap();

        let mut resolver = Resolver::default();
        let results = resolver.resolve_all(&mut g, None).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.values().all(|r| r.resolved && r.issues.is_empty()));
        assert!(g.nodes().all(|n| n.status == NodeStatus::Completed));
    }

    #[tokio::test]
    async fn test_missing_dependency_is_removed_and_node_failed() {
        let mut g = Graph::new();
        g.add_node(Node::new("d", NodeKind::Agent, "org"));
        g.declare_dependency("d", "ghost").unwrap();

        let mut resolver = Resolver::default();
        let results = resolver.resolve_all(&mut g, None).await.unwrap();

        let d = g.node("d").unwrap();
        assert!(!d.dependencies.contains("ghost"));
        assert_eq!(d.status, NodeStatus::Failed);
        assert!(d.execution.last_error.as_deref().unwrap().contains("ghost"));
        assert!(results["d"].issues[0].contains("ghost"));
        assert_eq!(results["d"].fixes.len(), 1);
    }

    #[tokio::test]
    async fn test_orphan_file_is_linked_to_repository() {
        let mut g = Graph::new();
        g.add_node(Node::new("repo", NodeKind::Repository, "org"));
        g.add_node(file("repo:src/util.ts", "src/util.ts", "repo"));
        g.add_node(file("repo:src/index.ts", "src/index.ts", "repo"));

        let mut resolver = Resolver::default();
        let results = resolver
            .resolve_all(&mut g, Some(NodeKind::File))
            .await
            .unwrap();

        assert!(g.node("repo").unwrap().dependencies.contains("repo:src/util.ts"));
        assert!(g.node("repo:src/util.ts").unwrap().dependents.contains("repo"));
        assert_eq!(results["repo:src/util.ts"].fixes.len(), 1);
        assert!(results["repo:src/util.ts"].resolved);
        // entry point stays a leaf
        assert!(results["repo:src/index.ts"].fixes.is_empty());
        // kind filter left the repository untouched
        assert_eq!(g.node("repo").unwrap().status, NodeStatus::Pending);
    }

    #[tokio::test]
    async fn test_orphan_depending_on_repository_is_not_linked() {
        let mut g = Graph::new();
        g.add_node(Node::new("repo", NodeKind::Repository, "org"));
        g.add_node(file("f", "src/a.rs", "repo"));
        g.add_edge(Edge::new("f", "repo", EdgeKind::Reference)).unwrap();

        let mut resolver = Resolver::default();
        resolver.resolve_all(&mut g, None).await.unwrap();
        assert!(g.node("repo").unwrap().dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_custom_leaf_policy() {
        let mut g = Graph::new();
        g.add_node(Node::new("repo", NodeKind::Repository, "org"));
        g.add_node(file("f", "src/a.rs", "repo"));

        let policy: Arc<dyn LeafPolicy> = Arc::new(|_: &Node| true);
        let mut resolver = Resolver::default().with_leaf_policy(policy);
        resolver.resolve_all(&mut g, None).await.unwrap();
        assert!(g.node("repo").unwrap().dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_small_batches_and_statistics() {
        let mut g = Graph::new();
        for i in 0..7 {
            g.add_node(Node::new(format!("n{i}"), NodeKind::Pipeline, "org"));
        }
        g.declare_dependency("n3", "missing").unwrap();

        let mut resolver = Resolver::new(ResolverConfig {
            batch_size: 2,
            ..Default::default()
        });
        resolver.resolve_all(&mut g, None).await.unwrap();

        let stats = resolver.statistics();
        assert_eq!(stats.total, 7);
        assert_eq!(stats.resolved, 6);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total_issues, 1);
        assert_eq!(stats.total_fixes, 1);
    }

    #[tokio::test]
    async fn test_runtime_gets_a_turn_between_batches() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let mut g = Graph::new();
        for i in 0..4 {
            g.add_node(Node::new(format!("p{i}"), NodeKind::Pipeline, "org"));
        }
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let ticker = tokio::spawn(async move {
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
            }
        });

        let mut resolver = Resolver::new(ResolverConfig {
            batch_size: 1,
            ..Default::default()
        });
        let results = resolver.resolve_all(&mut g, None).await.unwrap();
        ticker.abort();

        assert_eq!(results.len(), 4);
        assert!(ticks.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_statistics_empty_is_zero() {
        let stats = Resolver::default().statistics();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.average_time_ms, 0.0);
    }

    #[tokio::test]
    async fn test_completed_nodes_are_not_reprocessed() {
        let mut g = Graph::new();
        g.add_node(Node::new("a", NodeKind::Pipeline, "org"));
        let mut resolver = Resolver::default();
        resolver.resolve_all(&mut g, None).await.unwrap();
        let second = resolver.resolve_all(&mut g, None).await.unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn test_entry_point_policy() {
        let policy = EntryPointPolicy::default();
        assert!(policy.is_intentional_leaf(&file("x", "src\\index.js", "r")));
        assert!(policy.is_intentional_leaf(&file("x", "src/main.rs", "r")));
        assert!(!policy.is_intentional_leaf(&file("x", "src/reindex.rs", "r")));
        assert!(policy.is_intentional_leaf(&Node::new("p", NodeKind::Pipeline, "o")));
    }
}
