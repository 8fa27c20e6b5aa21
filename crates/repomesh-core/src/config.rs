//! Inbound configuration: entity descriptors plus execution settings.
//!
//! A descriptor file is TOML or JSON (chosen by extension):
//!
//! ```toml
//! [execution]
//! max_concurrency = 4
//! retry_limit = 1
//!
//! [[repositories]]
//! id = "org/lib"
//! organization = "org"
//! files = [{ path = "src/index.ts" }]
//!
//! [[pipelines]]
//! id = "lib-ci"
//! organization = "org"
//! repository = "org/lib"
//! depends_on = ["org/lib", { id = "shared-runner", critical = true }]
//! ```
//!
//! Entity `id` / `organization` default to empty so that one malformed entry
//! does not reject the whole file; the builder reports it and moves on.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::graph::EdgeKind;

/// Default number of nodes resolved per concurrent batch.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default bound on detect/repair rounds before a cycle is declared fatal.
pub const DEFAULT_MAX_REPAIR_ROUNDS: usize = 8;

/// A declared dependency: a bare id or a detailed edge description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyRef {
    Id(String),
    Detailed {
        id: String,
        #[serde(default)]
        kind: EdgeKind,
        #[serde(default)]
        critical: bool,
        #[serde(default = "default_strength")]
        strength: f64,
    },
}

fn default_strength() -> f64 {
    1.0
}

impl DependencyRef {
    pub fn id(&self) -> &str {
        match self {
            DependencyRef::Id(id) => id,
            DependencyRef::Detailed { id, .. } => id,
        }
    }
}

impl From<&str> for DependencyRef {
    fn from(id: &str) -> Self {
        DependencyRef::Id(id.to_string())
    }
}

/// Descriptor shared by pipelines, agents and clusters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub organization: String,
    /// Owning repository id; defaults to the entity's own id.
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub governance_layer: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub depends_on: Vec<DependencyRef>,
}

impl EntityDescriptor {
    pub fn new(id: impl Into<String>, organization: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            organization: organization.into(),
            ..Default::default()
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on.extend(deps.iter().map(|d| DependencyRef::from(*d)));
        self
    }

    pub fn in_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A file tracked inside a repository.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    #[serde(default)]
    pub path: String,
    /// Defaults to `<repository>:<path>`.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub depends_on: Vec<DependencyRef>,
}

/// A repository and the files it owns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    #[serde(flatten)]
    pub entity: EntityDescriptor,
    #[serde(default)]
    pub files: Vec<FileDescriptor>,
}

impl RepositoryDescriptor {
    pub fn new(id: impl Into<String>, organization: impl Into<String>) -> Self {
        Self {
            entity: EntityDescriptor::new(id, organization),
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, depends_on: &[&str]) -> Self {
        self.files.push(FileDescriptor {
            path: path.into(),
            depends_on: depends_on.iter().map(|d| DependencyRef::from(*d)).collect(),
            ..Default::default()
        });
        self
    }
}

/// Executor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum nodes running at once within a wave. Must be between 1 and
    /// [`Semaphore::MAX_PERMITS`].
    pub max_concurrency: usize,
    /// Retries after the first failed attempt.
    pub retry_limit: u32,
    /// Per-attempt task timeout; `None` disables it.
    pub task_timeout_secs: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            retry_limit: 2,
            task_timeout_secs: None,
        }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.max_concurrency == 0 {
            return Err(OrchestratorError::configuration(
                "execution",
                "max_concurrency must be greater than zero",
            ));
        }
        if self.max_concurrency > Semaphore::MAX_PERMITS {
            return Err(OrchestratorError::configuration(
                "execution",
                format!(
                    "max_concurrency must not exceed {}",
                    Semaphore::MAX_PERMITS
                ),
            ));
        }
        if self.task_timeout_secs == Some(0) {
            return Err(OrchestratorError::configuration(
                "execution",
                "task_timeout_secs must be greater than zero when set",
            ));
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }
}

/// Resolver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub batch_size: usize,
    /// File stems treated as intentional entry points by the default leaf policy.
    pub entry_points: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            entry_points: ["index", "main", "lib", "mod"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Everything needed to build and run one graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub repositories: Vec<RepositoryDescriptor>,
    pub pipelines: Vec<EntityDescriptor>,
    pub agents: Vec<EntityDescriptor>,
    pub clusters: Vec<EntityDescriptor>,
    pub execution: ExecutionConfig,
    pub resolver: ResolverConfig,
    pub max_repair_rounds: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            repositories: Vec::new(),
            pipelines: Vec::new(),
            agents: Vec::new(),
            clusters: Vec::new(),
            execution: ExecutionConfig::default(),
            resolver: ResolverConfig::default(),
            max_repair_rounds: DEFAULT_MAX_REPAIR_ROUNDS,
        }
    }
}

impl GraphConfig {
    pub fn from_toml_str(s: &str) -> OrchestratorResult<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> OrchestratorResult<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load a descriptor file; `.json` is parsed as JSON, anything else as TOML.
    pub fn from_path(path: &Path) -> OrchestratorResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse_for_path(&raw, path)
    }

    /// Parse `raw` in the format implied by `path`'s extension.
    pub fn parse_for_path(raw: &str, path: &Path) -> OrchestratorResult<Self> {
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(raw)
        } else {
            Self::from_toml_str(raw)
        }
    }

    /// Validate run-level settings. Entity-level problems are reported by the builder.
    pub fn validate(&self) -> OrchestratorResult<()> {
        self.execution.validate()?;
        if self.resolver.batch_size == 0 {
            return Err(OrchestratorError::configuration(
                "resolver",
                "batch_size must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Number of declared entities, files included.
    pub fn entity_count(&self) -> usize {
        self.repositories
            .iter()
            .map(|r| 1 + r.files.len())
            .sum::<usize>()
            + self.pipelines.len()
            + self.agents.len()
            + self.clusters.len()
    }
}
