//! repomesh core library
//!
//! Builds a dependency graph spanning repositories, pipelines, agents,
//! clusters and files, repairs its structural defects, plans it into waves
//! and executes it with bounded concurrency.

pub mod builder;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod obs;
pub mod optimizer;
pub mod orchestrator;
pub mod repair;
pub mod resolver;
pub mod telemetry;
pub mod visualizer;

pub use builder::{
    BuildError, BuildReport, DescriptorSource, FileSource, GraphBuilder, StaticSource,
};
pub use config::{
    DependencyRef, EntityDescriptor, ExecutionConfig, FileDescriptor, GraphConfig,
    RepositoryDescriptor, ResolverConfig,
};
pub use error::{OrchestratorError, OrchestratorResult};
pub use events::{EventBus, OrchestratorEvent, Phase};
pub use executor::{
    ExecutionMonitor, ExecutionReport, ExecutionStats, Executor, NodeExecutionResult, NodeTask,
    TaskRegistry,
};
pub use graph::{
    compute_layers, ComplianceRecord, Edge, EdgeKind, ExecutionContext, ExecutionMeta, Graph,
    GraphSnapshot, GraphStatistics, Node, NodeKind, NodeStatus,
};
pub use optimizer::{ExecutionPlan, Optimizer, Wave};
pub use orchestrator::{Orchestrator, PreparedGraph, RunReport};
pub use repair::{CycleRepair, NodeRepair, RepairStats, RepairStrategy, Repairer};
pub use resolver::{EntryPointPolicy, LeafPolicy, NodeResolution, ResolutionStats, Resolver};
pub use visualizer::{Visualization, Visualizer};

/// Crate version, as recorded in Cargo metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
