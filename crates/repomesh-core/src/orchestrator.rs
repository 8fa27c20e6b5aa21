//! Run pipeline: Build → Resolve → Optimize → Execute → Visualize.
//!
//! Phases run strictly one after another and each owns the graph while it
//! runs. Per-node problems are recorded and the run continues; only an empty
//! graph, a cycle that survives repair, or an unreadable descriptor source
//! abort the run.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn, Instrument};

use crate::builder::{BuildReport, DescriptorSource, GraphBuilder};
use crate::config::GraphConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{EventBus, OrchestratorEvent, Phase};
use crate::executor::{ExecutionReport, Executor, TaskRegistry};
use crate::graph::{Graph, GraphSnapshot, GraphStatistics, NodeKind};
use crate::obs;
use crate::optimizer::{ExecutionPlan, Optimizer};
use crate::repair::{CycleRepair, RepairStats, Repairer};
use crate::resolver::{ResolutionStats, Resolver};
use crate::visualizer::{Visualization, Visualizer};

/// Everything a run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub build: BuildReport,
    pub resolution: ResolutionStats,
    pub repairs: RepairStats,
    pub cycle_repairs: Vec<CycleRepair>,
    pub plan: ExecutionPlan,
    pub execution: ExecutionReport,
    pub visualization: Visualization,
    pub statistics: GraphStatistics,
    /// Human-readable rendering of `statistics`.
    pub report: String,
    pub snapshot: GraphSnapshot,
    pub duration_ms: u64,
    /// `true` when no node ended `failed`.
    pub success: bool,
}

/// Output of the structural phases, before anything executes.
#[derive(Debug, Clone)]
pub struct PreparedGraph {
    pub build: BuildReport,
    pub resolution: ResolutionStats,
    pub repairs: RepairStats,
    pub cycle_repairs: Vec<CycleRepair>,
    pub plan: ExecutionPlan,
}

pub struct Orchestrator {
    registry: TaskRegistry,
    events: EventBus,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(registry: TaskRegistry, events: EventBus, cancel: CancellationToken) -> Self {
        Self {
            registry,
            events,
            cancel,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Load descriptors from `source` and run every phase on a fresh graph.
    pub async fn run(&self, source: &dyn DescriptorSource) -> OrchestratorResult<RunReport> {
        let config = source.load().await?;
        let mut graph = Graph::new();
        self.run_with(&mut graph, &config).await
    }

    /// Run every phase on `graph`, which may already hold nodes from an
    /// earlier run. Statuses are re-seeded, so skips from a previous run do
    /// not carry over.
    pub async fn run_with(
        &self,
        graph: &mut Graph,
        config: &GraphConfig,
    ) -> OrchestratorResult<RunReport> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = obs::run_span(&run_id);
        let started = Instant::now();

        async {
            obs::emit_run_started(&run_id, config.execution.max_concurrency);
            self.events.publish(OrchestratorEvent::RunStarted {
                run_id: run_id.clone(),
            });

            let outcome = self.run_phases(&run_id, graph, config, started).await;
            match &outcome {
                Ok(report) => obs::emit_run_finished(
                    &run_id,
                    report.duration_ms,
                    report.execution.failed_count(),
                    report.success,
                ),
                Err(e) => obs::emit_run_aborted(&run_id, e),
            }
            self.events.publish(OrchestratorEvent::RunFinished {
                run_id: run_id.clone(),
                success: outcome.as_ref().is_ok_and(|r| r.success),
            });
            outcome
        }
        .instrument(span)
        .await
    }

    /// Build, resolve, repair and plan without executing anything.
    #[instrument(skip_all)]
    pub async fn prepare(
        &self,
        graph: &mut Graph,
        config: &GraphConfig,
    ) -> OrchestratorResult<PreparedGraph> {
        config.validate()?;

        let phase = self.begin(Phase::Build);
        let build = GraphBuilder::build(graph, config);
        if graph.is_empty() {
            return Err(OrchestratorError::EmptyGraph);
        }
        self.end(Phase::Build, phase);

        let phase = self.begin(Phase::Resolve);
        let mut resolver = Resolver::new(config.resolver.clone());
        let mut repairer = Repairer::new();
        resolver.resolve_all(graph, None).await?;
        let cycle_repairs = repair_cycles(&mut repairer, graph, config.max_repair_rounds)?;
        repairer.auto_repair_all(graph, Some(NodeKind::File))?;
        resolver.resolve_all(graph, Some(NodeKind::File)).await?;
        self.end(Phase::Resolve, phase);

        let phase = self.begin(Phase::Optimize);
        let plan = Optimizer::plan(graph)?;
        self.end(Phase::Optimize, phase);

        Ok(PreparedGraph {
            build,
            resolution: resolver.statistics(),
            repairs: repairer.statistics(),
            cycle_repairs,
            plan,
        })
    }

    async fn run_phases(
        &self,
        run_id: &str,
        graph: &mut Graph,
        config: &GraphConfig,
        started: Instant,
    ) -> OrchestratorResult<RunReport> {
        let prepared = self.prepare(graph, config).await?;

        let phase = self.begin(Phase::Execute);
        let executor = Executor::new(
            config.execution.clone(),
            self.registry.clone(),
            self.events.clone(),
        );
        let execution = executor.execute(graph, &prepared.plan, &self.cancel).await?;
        self.end(Phase::Execute, phase);

        let phase = self.begin(Phase::Visualize);
        let visualization = Visualizer::layout(graph)?;
        let statistics = graph.statistics();
        let report = Visualizer::render_report(&statistics);
        self.end(Phase::Visualize, phase);

        let success = execution.failed_count() == 0;
        Ok(RunReport {
            run_id: run_id.to_string(),
            build: prepared.build,
            resolution: prepared.resolution,
            repairs: prepared.repairs,
            cycle_repairs: prepared.cycle_repairs,
            plan: prepared.plan,
            execution,
            visualization,
            statistics,
            report,
            snapshot: graph.snapshot()?,
            duration_ms: started.elapsed().as_millis() as u64,
            success,
        })
    }

    fn begin(&self, phase: Phase) -> Instant {
        self.events.publish(OrchestratorEvent::PhaseStarted { phase });
        Instant::now()
    }

    fn end(&self, phase: Phase, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        obs::emit_phase_completed(phase.as_str(), elapsed_ms);
        self.events
            .publish(OrchestratorEvent::PhaseCompleted { phase, elapsed_ms });
    }
}

/// Detect and break cycles until none remain, at most `max_rounds` times.
fn repair_cycles(
    repairer: &mut Repairer,
    graph: &mut Graph,
    max_rounds: usize,
) -> OrchestratorResult<Vec<CycleRepair>> {
    let mut all = Vec::new();
    for round in 0..max_rounds {
        let cycles = Repairer::detect_cycles(graph);
        if cycles.is_empty() {
            return Ok(all);
        }
        info!(round = round, cycles = cycles.len(), "breaking dependency cycles");
        let repairs = repairer.repair_cycles(graph, &cycles)?;
        let progressed = repairs.iter().any(CycleRepair::is_repaired);
        all.extend(repairs);
        if !progressed {
            break;
        }
    }

    match Repairer::detect_cycles(graph).into_iter().next() {
        Some(nodes) => {
            warn!(cycle = ?nodes, "cycle survived repair");
            Err(OrchestratorError::CyclicGraph { nodes })
        }
        None => Ok(all),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::StaticSource;
    use crate::config::EntityDescriptor;
    use crate::executor::NodeTask;
    use crate::graph::{Node, NodeStatus};
    use async_trait::async_trait;

    struct Ok200;

    #[async_trait]
    impl NodeTask for Ok200 {
        async fn run(&self, _node: &Node) -> OrchestratorResult<serde_json::Value> {
            Ok(serde_json::json!(200))
        }
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            TaskRegistry::new().with_fallback(Ok200),
            EventBus::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_empty_config_is_fatal() {
        let err = orchestrator()
            .run(&StaticSource::new(GraphConfig::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::EmptyGraph));
        assert!(err.is_run_fatal());
    }

    #[tokio::test]
    async fn test_invalid_execution_config_is_rejected() {
        let mut config = GraphConfig::default();
        config.pipelines.push(EntityDescriptor::new("p", "org"));
        config.execution.max_concurrency = 0;
        let err = orchestrator()
            .run(&StaticSource::new(config))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_cycle_is_repaired_before_planning() {
        let mut config = GraphConfig::default();
        config.pipelines = vec![
            EntityDescriptor::new("a", "org").depends_on(&["c"]),
            EntityDescriptor::new("b", "org").depends_on(&["a"]),
            EntityDescriptor::new("c", "org").depends_on(&["b"]),
        ];
        let report = orchestrator()
            .run(&StaticSource::new(config))
            .await
            .unwrap();

        assert_eq!(report.cycle_repairs.len(), 1);
        assert!(report.cycle_repairs[0].is_repaired());
        assert_eq!(report.plan.waves.len(), 3);
        assert!(report.success);
        assert_eq!(report.execution.stats.completed, 3);
    }

    #[tokio::test]
    async fn test_zero_repair_rounds_leaves_cycle_fatal() {
        let mut config = GraphConfig::default();
        config.max_repair_rounds = 0;
        config.agents = vec![
            EntityDescriptor::new("x", "org").depends_on(&["y"]),
            EntityDescriptor::new("y", "org").depends_on(&["x"]),
        ];
        let err = orchestrator()
            .run(&StaticSource::new(config))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::CyclicGraph { .. }));
    }

    #[tokio::test]
    async fn test_rerun_on_same_graph_reseeds_statuses() {
        let mut config = GraphConfig::default();
        config.clusters.push(EntityDescriptor::new("c1", "org"));
        let orch = orchestrator();
        let mut graph = Graph::new();

        let first = orch.run_with(&mut graph, &config).await.unwrap();
        let second = orch.run_with(&mut graph, &config).await.unwrap();
        assert!(first.success && second.success);
        assert_ne!(first.run_id, second.run_id);
        assert_eq!(second.build.nodes_existing, 1);
        assert_eq!(graph.node("c1").unwrap().status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn test_phase_events_are_published_in_order() {
        let mut config = GraphConfig::default();
        config.pipelines.push(EntityDescriptor::new("p", "org"));
        let orch = orchestrator();
        let mut rx = orch.events().subscribe();
        orch.run(&StaticSource::new(config)).await.unwrap();

        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let OrchestratorEvent::PhaseCompleted { phase, .. } = event {
                phases.push(phase);
            }
        }
        assert_eq!(
            phases,
            vec![
                Phase::Build,
                Phase::Resolve,
                Phase::Optimize,
                Phase::Execute,
                Phase::Visualize
            ]
        );
    }
}
