//! Turns entity descriptors into graph nodes and dependency edges.
//!
//! Building is partial-failure: a malformed descriptor is reported in the
//! [`BuildReport`] and skipped while the rest of the build proceeds.
//! Re-running the builder with the same descriptors is a no-op: existing
//! node ids are left untouched and existing edges are counted, not re-added.
//! Dependencies on ids that do not exist are recorded as dangling
//! declarations for the resolver to deal with.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::{DependencyRef, EntityDescriptor, GraphConfig};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::graph::{Edge, EdgeKind, Graph, Node, NodeKind};

/// Supplies the descriptor set the builder consumes.
///
/// Inject a file-backed source in production or a static one in tests.
#[async_trait]
pub trait DescriptorSource: Send + Sync {
    async fn load(&self) -> OrchestratorResult<GraphConfig>;
}

/// In-memory descriptor set.
#[derive(Debug, Clone)]
pub struct StaticSource {
    config: GraphConfig,
}

impl StaticSource {
    pub fn new(config: GraphConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DescriptorSource for StaticSource {
    async fn load(&self) -> OrchestratorResult<GraphConfig> {
        Ok(self.config.clone())
    }
}

/// Descriptor file on disk, TOML or JSON by extension.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DescriptorSource for FileSource {
    async fn load(&self) -> OrchestratorResult<GraphConfig> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        GraphConfig::parse_for_path(&raw, &self.path)
    }
}

/// A descriptor the builder had to skip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildError {
    /// Best available name for the entity, e.g. `pipelines[2]`.
    pub entity: String,
    pub reason: String,
}

impl From<&BuildError> for OrchestratorError {
    fn from(e: &BuildError) -> Self {
        OrchestratorError::configuration(&e.entity, &e.reason)
    }
}

/// Outcome of one build pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub nodes_added: usize,
    pub nodes_existing: usize,
    pub edges_added: usize,
    pub edges_existing: usize,
    /// `(dependent, missing dependency)` pairs left for the resolver.
    pub deferred: Vec<(String, String)>,
    pub errors: Vec<BuildError>,
}

impl BuildReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.deferred.is_empty()
    }
}

struct NodeDraft {
    node: Node,
    depends_on: Vec<DependencyRef>,
}

/// Builds a [`Graph`] from a [`GraphConfig`].
pub struct GraphBuilder;

impl GraphBuilder {
    /// Add every descriptor in `config` to `graph`.
    #[instrument(skip_all, fields(entities = config.entity_count()))]
    pub fn build(graph: &mut Graph, config: &GraphConfig) -> BuildReport {
        let mut report = BuildReport::default();
        let drafts = Self::collect_drafts(config, &mut report);

        // Nodes first so that dependencies between declared entities resolve
        // regardless of declaration order.
        for draft in &drafts {
            if graph.add_node(draft.node.clone()) {
                report.nodes_added += 1;
            } else {
                debug!(node_id = %draft.node.id, "node already present, leaving as is");
                report.nodes_existing += 1;
            }
        }

        for draft in &drafts {
            for dep in &draft.depends_on {
                Self::add_dependency(graph, &draft.node.id, dep, &mut report);
            }
        }

        graph.set_max_concurrency(config.execution.max_concurrency);

        for error in &report.errors {
            warn!(entity = %error.entity, reason = %error.reason, "descriptor skipped");
        }
        info!(
            nodes_added = report.nodes_added,
            nodes_existing = report.nodes_existing,
            edges_added = report.edges_added,
            deferred = report.deferred.len(),
            errors = report.errors.len(),
            "graph build finished"
        );
        report
    }

    fn collect_drafts(config: &GraphConfig, report: &mut BuildReport) -> Vec<NodeDraft> {
        let mut drafts = Vec::new();

        for (i, repo) in config.repositories.iter().enumerate() {
            let label = format!("repositories[{i}]");
            let Some(node) =
                Self::entity_node(&repo.entity, NodeKind::Repository, &label, report)
            else {
                continue;
            };
            let repo_id = node.id.clone();
            let organization = node.organization.clone();
            let layer = node.governance_layer.clone();
            drafts.push(NodeDraft {
                node,
                depends_on: repo.entity.depends_on.clone(),
            });

            for (j, file) in repo.files.iter().enumerate() {
                if file.path.trim().is_empty() {
                    report.errors.push(BuildError {
                        entity: format!("{label}.files[{j}]"),
                        reason: "missing path".to_string(),
                    });
                    continue;
                }
                let id = file
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("{repo_id}:{}", file.path));
                let node = Node::new(id, NodeKind::File, organization.clone())
                    .with_repository(repo_id.clone())
                    .with_path(file.path.clone())
                    .with_priority(file.priority)
                    .with_governance_layer(layer.clone());
                drafts.push(NodeDraft {
                    node,
                    depends_on: file.depends_on.clone(),
                });
            }
        }

        let groups = [
            ("pipelines", NodeKind::Pipeline, &config.pipelines),
            ("agents", NodeKind::Agent, &config.agents),
            ("clusters", NodeKind::Cluster, &config.clusters),
        ];
        for (name, kind, entities) in groups {
            for (i, entity) in entities.iter().enumerate() {
                let label = format!("{name}[{i}]");
                if let Some(node) = Self::entity_node(entity, kind, &label, report) {
                    drafts.push(NodeDraft {
                        node,
                        depends_on: entity.depends_on.clone(),
                    });
                }
            }
        }

        drafts
    }

    fn entity_node(
        entity: &EntityDescriptor,
        kind: NodeKind,
        label: &str,
        report: &mut BuildReport,
    ) -> Option<Node> {
        let id = entity.id.trim();
        if id.is_empty() {
            report.errors.push(BuildError {
                entity: label.to_string(),
                reason: "missing id".to_string(),
            });
            return None;
        }
        if entity.organization.trim().is_empty() {
            report.errors.push(BuildError {
                entity: format!("{label} ({id})"),
                reason: "missing organization".to_string(),
            });
            return None;
        }

        let mut node = Node::new(id, kind, entity.organization.trim())
            .with_priority(entity.priority)
            .with_repository(entity.repository.clone().unwrap_or_else(|| id.to_string()));
        if let Some(layer) = &entity.governance_layer {
            node = node.with_governance_layer(layer.clone());
        }
        if let Some(path) = &entity.path {
            node = node.with_path(path.clone());
        }
        Some(node)
    }

    fn add_dependency(graph: &mut Graph, source: &str, dep: &DependencyRef, report: &mut BuildReport) {
        let target = dep.id().trim();
        if target.is_empty() || target == source {
            report.errors.push(BuildError {
                entity: format!("{source} -> {target:?}"),
                reason: if target.is_empty() {
                    "empty dependency id".to_string()
                } else {
                    "node cannot depend on itself".to_string()
                },
            });
            return;
        }

        if !graph.contains(target) {
            match graph.declare_dependency(source, target) {
                Ok(_) => {
                    debug!(node_id = %source, dependency = %target, "dependency deferred to resolver");
                    report
                        .deferred
                        .push((source.to_string(), target.to_string()));
                }
                Err(e) => report.errors.push(BuildError {
                    entity: source.to_string(),
                    reason: e.to_string(),
                }),
            }
            return;
        }

        let edge = match dep {
            DependencyRef::Id(_) => Edge::new(source, target, EdgeKind::Dependency),
            DependencyRef::Detailed {
                kind,
                critical,
                strength,
                ..
            } => {
                let edge = Edge::new(source, target, *kind).with_strength(*strength);
                if *critical {
                    edge.critical()
                } else {
                    edge
                }
            }
        };

        match graph.add_edge(edge) {
            Ok(()) => report.edges_added += 1,
            Err(OrchestratorError::DuplicateEdge { .. }) => report.edges_existing += 1,
            Err(e) => report.errors.push(BuildError {
                entity: source.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepositoryDescriptor;

    fn sample() -> GraphConfig {
        GraphConfig {
            repositories: vec![
                RepositoryDescriptor::new("org/lib", "org").with_file("src/index.ts", &[]),
                RepositoryDescriptor::new("org/app", "org").depends_on_repo("org/lib"),
            ],
            pipelines: vec![EntityDescriptor::new("app-ci", "org")
                .in_repository("org/app")
                .depends_on(&["org/app", "ghost"])],
            agents: vec![EntityDescriptor::new("", "org")],
            clusters: vec![EntityDescriptor::new("prod", "")],
            ..Default::default()
        }
    }

    trait RepoExt {
        fn depends_on_repo(self, id: &str) -> Self;
    }

    impl RepoExt for RepositoryDescriptor {
        fn depends_on_repo(mut self, id: &str) -> Self {
            self.entity.depends_on.push(DependencyRef::from(id));
            self
        }
    }

    #[test]
    fn test_build_creates_nodes_edges_and_defers_missing() {
        let mut g = Graph::new();
        let report = GraphBuilder::build(&mut g, &sample());

        assert_eq!(report.nodes_added, 4);
        assert_eq!(report.edges_added, 2);
        assert_eq!(
            report.deferred,
            vec![("app-ci".to_string(), "ghost".to_string())]
        );
        assert!(g.node("app-ci").unwrap().dependencies.contains("ghost"));

        let file = g.node("org/lib:src/index.ts").unwrap();
        assert_eq!(file.kind, NodeKind::File);
        assert_eq!(file.repository, "org/lib");
        assert_eq!(file.path.as_deref(), Some("src/index.ts"));
        assert_eq!(g.node("app-ci").unwrap().repository, "org/app");
    }

    #[test]
    fn test_malformed_descriptors_are_skipped_not_fatal() {
        let mut g = Graph::new();
        let report = GraphBuilder::build(&mut g, &sample());
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors.iter().any(|e| e.reason == "missing id"));
        assert!(report
            .errors
            .iter()
            .any(|e| e.reason == "missing organization" && e.entity.contains("prod")));
        assert!(!g.contains("prod"));
        let err: OrchestratorError = (&report.errors[0]).into();
        assert!(matches!(err, OrchestratorError::Configuration { .. }));
    }

    #[test]
    fn test_build_twice_is_idempotent() {
        let mut g = Graph::new();
        let config = sample();
        GraphBuilder::build(&mut g, &config);
        let (nodes, edges) = (g.node_count(), g.edge_count());

        let second = GraphBuilder::build(&mut g, &config);
        assert_eq!(g.node_count(), nodes);
        assert_eq!(g.edge_count(), edges);
        assert_eq!(second.nodes_added, 0);
        assert_eq!(second.nodes_existing, 4);
        assert_eq!(second.edges_existing, 2);
    }

    #[test]
    fn test_detailed_dependency_carries_edge_attributes() {
        let mut config = GraphConfig::default();
        config.repositories.push(RepositoryDescriptor::new("r", "o"));
        let mut agent = EntityDescriptor::new("bot", "o");
        agent.depends_on.push(DependencyRef::Detailed {
            id: "r".to_string(),
            kind: EdgeKind::ManagedBy,
            critical: true,
            strength: 0.5,
        });
        config.agents.push(agent);

        let mut g = Graph::new();
        GraphBuilder::build(&mut g, &config);
        let edge = g.edge("bot", "r").unwrap();
        assert_eq!(edge.kind, EdgeKind::ManagedBy);
        assert!(edge.critical);
        assert_eq!(edge.strength, 0.5);
    }

    #[test]
    fn test_self_dependency_is_reported() {
        let mut config = GraphConfig::default();
        config
            .pipelines
            .push(EntityDescriptor::new("loop", "o").depends_on(&["loop"]));
        let mut g = Graph::new();
        let report = GraphBuilder::build(&mut g, &config);
        assert!(g.contains("loop"));
        assert!(g.node("loop").unwrap().dependencies.is_empty());
        assert_eq!(report.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_file_source_loads_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(
            &path,
            r#"{"repositories": [{"id": "r", "organization": "o", "files": [{"path": "a.rs"}]}]}"#,
        )
        .unwrap();
        let config = FileSource::new(&path).load().await.unwrap();
        assert_eq!(config.entity_count(), 2);
        assert_eq!(config.repositories[0].files[0].path, "a.rs");
    }
}
