//! Wave-by-wave node execution.
//!
//! Each wave runs at most `max_concurrency` tasks at once and is fully
//! settled, retries included, before the next wave starts. Tasks receive a
//! clone of their node; every graph mutation happens on the control loop, so
//! concurrent tasks never touch the graph.
//!
//! A node runs only once every dependency has completed. Otherwise it is
//! skipped, which propagates a permanent failure to all transitive
//! dependents. The cancellation token is checked between waves only: the
//! wave in flight finishes, every later node is skipped with `run cancelled`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ExecutionConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{EventBus, OrchestratorEvent};
use crate::graph::{Graph, Node, NodeKind, NodeStatus};
use crate::obs;
use crate::optimizer::{ExecutionPlan, Wave};

/// Reason recorded on nodes that never started because the run was cancelled.
pub const CANCELLED_REASON: &str = "run cancelled";

/// Work performed for one node. Implemented by the collaborating subsystem.
#[async_trait]
pub trait NodeTask: Send + Sync {
    async fn run(&self, node: &Node) -> OrchestratorResult<serde_json::Value>;
}

/// Node kind to task lookup, with an optional catch-all.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<NodeKind, Arc<dyn NodeTask>>,
    fallback: Option<Arc<dyn NodeTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: NodeKind, task: impl NodeTask + 'static) -> Self {
        self.tasks.insert(kind, Arc::new(task));
        self
    }

    /// Task used for kinds without a dedicated registration.
    pub fn with_fallback(mut self, task: impl NodeTask + 'static) -> Self {
        self.fallback = Some(Arc::new(task));
        self
    }

    pub fn task_for(&self, kind: NodeKind) -> Option<Arc<dyn NodeTask>> {
        self.tasks
            .get(&kind)
            .or(self.fallback.as_ref())
            .map(Arc::clone)
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("kinds", &self.tasks.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Final record for one node in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionResult {
    pub node_id: String,
    pub status: NodeStatus,
    /// Time spent inside task attempts, retries included. Queueing for a
    /// concurrency slot is not counted. `0` if never launched.
    pub duration_ms: u64,
    pub attempts: u32,
    pub error: Option<String>,
    pub output: Option<serde_json::Value>,
}

/// Point-in-time counters, readable while a run is in flight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Attempts currently holding a concurrency slot.
    pub running: u64,
    /// Completed over settled nodes, `0.0` before anything settles.
    pub success_rate: f64,
    /// Mean duration of nodes that were launched, `0.0` if none were.
    pub average_duration_ms: f64,
}

/// Lock-free counters backing [`ExecutionStats`].
#[derive(Debug, Default)]
pub struct ExecutionMonitor {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    running: AtomicU64,
    timed_nodes: AtomicU64,
    busy_ms: AtomicU64,
}

impl ExecutionMonitor {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            running: AtomicU64::new(0),
            timed_nodes: AtomicU64::new(0),
            busy_ms: AtomicU64::new(0),
        }
    }

    fn reset(&self, total: usize) {
        self.total.store(total as u64, Ordering::Relaxed);
        for counter in [
            &self.completed,
            &self.failed,
            &self.skipped,
            &self.running,
            &self.timed_nodes,
            &self.busy_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn attempt_started(&self) {
        self.running.fetch_add(1, Ordering::Relaxed);
    }

    fn attempt_finished(&self) {
        self.running.fetch_sub(1, Ordering::Relaxed);
    }

    fn record(&self, status: NodeStatus, duration_ms: Option<u64>) {
        let counter = match status {
            NodeStatus::Completed => &self.completed,
            NodeStatus::Failed => &self.failed,
            NodeStatus::Skipped => &self.skipped,
            NodeStatus::Pending | NodeStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(ms) = duration_ms {
            self.timed_nodes.fetch_add(1, Ordering::Relaxed);
            self.busy_ms.fetch_add(ms, Ordering::Relaxed);
        }
        tracing::trace!(metric = status.as_str(), "counter incremented");
    }

    pub fn snapshot(&self) -> ExecutionStats {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let skipped = self.skipped.load(Ordering::Relaxed);
        let settled = completed + failed + skipped;
        let timed = self.timed_nodes.load(Ordering::Relaxed);
        ExecutionStats {
            total: self.total.load(Ordering::Relaxed),
            completed,
            failed,
            skipped,
            running: self.running.load(Ordering::Relaxed),
            success_rate: if settled == 0 {
                0.0
            } else {
                completed as f64 / settled as f64
            },
            average_duration_ms: if timed == 0 {
                0.0
            } else {
                self.busy_ms.load(Ordering::Relaxed) as f64 / timed as f64
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// One record per planned node, in plan order.
    pub results: Vec<NodeExecutionResult>,
    pub stats: ExecutionStats,
    pub waves_run: usize,
    pub cancelled: bool,
}

impl ExecutionReport {
    pub fn result(&self, id: &str) -> Option<&NodeExecutionResult> {
        self.results.iter().find(|r| r.node_id == id)
    }

    pub fn failed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == NodeStatus::Failed)
            .count()
    }
}

struct AttemptOutcome {
    node_id: String,
    elapsed_ms: u64,
    result: Result<serde_json::Value, String>,
}

pub struct Executor {
    config: ExecutionConfig,
    registry: TaskRegistry,
    events: EventBus,
    monitor: Arc<ExecutionMonitor>,
}

impl Executor {
    pub fn new(config: ExecutionConfig, registry: TaskRegistry, events: EventBus) -> Self {
        Self {
            config,
            registry,
            events,
            monitor: Arc::new(ExecutionMonitor::new()),
        }
    }

    /// Shared handle to the live counters.
    pub fn monitor(&self) -> Arc<ExecutionMonitor> {
        Arc::clone(&self.monitor)
    }

    /// Run `plan` against `graph`.
    ///
    /// Every node is reset to `pending` first, so each call produces a fresh
    /// set of statuses. Task failures never surface as `Err`; an `Err` means
    /// the plan and graph disagree or the configuration is invalid.
    #[instrument(skip_all, fields(waves = plan.waves.len(), max_concurrency = self.config.max_concurrency))]
    pub async fn execute(
        &self,
        graph: &mut Graph,
        plan: &ExecutionPlan,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<ExecutionReport> {
        self.config.validate()?;
        for id in graph.node_ids() {
            graph.reset_status(&id)?;
        }
        graph.set_max_concurrency(self.config.max_concurrency);
        self.monitor.reset(plan.total_nodes());

        let mut results: HashMap<String, NodeExecutionResult> = HashMap::new();
        let mut cancelled = false;
        let mut waves_run = 0;

        for wave in &plan.waves {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                info!(wave = wave.index, "cancellation requested, skipping remaining waves");
            }
            if cancelled {
                for id in &wave.nodes {
                    self.skip(graph, id, CANCELLED_REASON.to_string(), &mut results)?;
                }
                continue;
            }

            self.run_wave(graph, wave, &mut results).await?;
            waves_run += 1;
            self.events.publish(OrchestratorEvent::WaveCompleted {
                index: wave.index,
                size: wave.nodes.len(),
            });
            debug!(wave = wave.index, size = wave.nodes.len(), "wave settled");
        }

        let ordered: Vec<NodeExecutionResult> = plan
            .waves
            .iter()
            .flat_map(|w| w.nodes.iter())
            .filter_map(|id| results.remove(id))
            .collect();

        Ok(ExecutionReport {
            results: ordered,
            stats: self.monitor.snapshot(),
            waves_run,
            cancelled,
        })
    }

    async fn run_wave(
        &self,
        graph: &mut Graph,
        wave: &Wave,
        results: &mut HashMap<String, NodeExecutionResult>,
    ) -> OrchestratorResult<()> {
        let slots = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut in_flight: JoinSet<AttemptOutcome> = JoinSet::new();
        let mut queue: VecDeque<(String, Arc<dyn NodeTask>)> = VecDeque::new();
        let mut spent_ms: HashMap<String, u64> = HashMap::new();

        for id in &wave.nodes {
            let node = graph
                .node(id)
                .ok_or_else(|| OrchestratorError::unknown_node(id))?;

            // Dependencies from earlier waves are settled by now; anything
            // else means the plan is out of date with the graph.
            let blocker = node.dependencies.iter().find(|dep| {
                graph
                    .node(dep)
                    .is_some_and(|d| d.status != NodeStatus::Completed)
            });
            if let Some(blocker) = blocker {
                let reason = format!("dependency {blocker} did not complete");
                self.skip(graph, id, reason, results)?;
                continue;
            }

            let Some(task) = self.registry.task_for(node.kind) else {
                let reason = OrchestratorError::TaskFailure {
                    node: id.clone(),
                    reason: format!("no task registered for kind {}", node.kind),
                }
                .to_string();
                graph.mark_node_running(id)?;
                graph.mark_node_failed(id, reason.clone())?;
                self.settle(graph, id, Some(reason), None, Some(0), results);
                continue;
            };

            queue.push_back((id.clone(), task));
        }

        loop {
            while !queue.is_empty() {
                let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
                    break;
                };
                if let Some((id, task)) = queue.pop_front() {
                    self.launch(graph, &id, task, permit, &mut in_flight)?;
                }
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let AttemptOutcome {
                node_id,
                elapsed_ms,
                result,
            } = joined.map_err(|e| OrchestratorError::TaskFailure {
                node: "unknown".to_string(),
                reason: e.to_string(),
            })?;
            let spent = spent_ms.entry(node_id.clone()).or_default();
            *spent += elapsed_ms;
            let spent = *spent;

            match result {
                Ok(output) => {
                    graph.mark_node_completed(&node_id, Some(output.clone()))?;
                    self.settle(graph, &node_id, None, Some(output), Some(spent), results);
                }
                Err(error) => {
                    graph.mark_node_failed(&node_id, error.clone())?;
                    let failures = graph
                        .node(&node_id)
                        .map_or(u32::MAX, |n| n.execution.retry_count);
                    let task = graph
                        .node(&node_id)
                        .and_then(|n| self.registry.task_for(n.kind));

                    match task {
                        Some(task) if failures <= self.config.retry_limit => {
                            debug!(node_id = %node_id, failures = failures, error = %error, "retrying node");
                            queue.push_back((node_id, task));
                        }
                        _ => {
                            self.settle(graph, &node_id, Some(error), None, Some(spent), results);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Start one attempt on a slot the caller already holds.
    fn launch(
        &self,
        graph: &mut Graph,
        id: &str,
        task: Arc<dyn NodeTask>,
        permit: OwnedSemaphorePermit,
        in_flight: &mut JoinSet<AttemptOutcome>,
    ) -> OrchestratorResult<()> {
        graph.mark_node_running(id)?;
        let node = graph
            .node(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::unknown_node(id))?;
        self.events.publish(OrchestratorEvent::NodeStatusChanged {
            node_id: node.id.clone(),
            status: NodeStatus::Running,
            attempt: node.execution.retry_count + 1,
        });

        let monitor = Arc::clone(&self.monitor);
        let timeout = self.config.task_timeout();
        in_flight.spawn(async move {
            monitor.attempt_started();
            let started = Instant::now();
            let result = run_attempt(task.as_ref(), &node, timeout).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            monitor.attempt_finished();
            drop(permit);
            AttemptOutcome {
                node_id: node.id,
                elapsed_ms,
                result,
            }
        });
        Ok(())
    }

    fn skip(
        &self,
        graph: &mut Graph,
        id: &str,
        reason: String,
        results: &mut HashMap<String, NodeExecutionResult>,
    ) -> OrchestratorResult<()> {
        graph.mark_node_skipped(id, Some(reason.clone()))?;
        self.settle(graph, id, Some(reason), None, None, results);
        Ok(())
    }

    /// Record a node's final outcome for this run.
    fn settle(
        &self,
        graph: &Graph,
        id: &str,
        error: Option<String>,
        output: Option<serde_json::Value>,
        duration_ms: Option<u64>,
        results: &mut HashMap<String, NodeExecutionResult>,
    ) {
        let (status, failures) = graph
            .node(id)
            .map_or((NodeStatus::Failed, 0), |n| (n.status, n.execution.retry_count));
        let attempts = match (status, duration_ms) {
            (NodeStatus::Skipped, _) | (_, None) => 0,
            (NodeStatus::Completed, _) => failures + 1,
            _ => failures,
        };

        self.monitor.record(status, duration_ms);
        self.events.publish(OrchestratorEvent::NodeStatusChanged {
            node_id: id.to_string(),
            status,
            attempt: attempts,
        });
        obs::emit_node_finished(id, status, attempts, duration_ms.unwrap_or(0));

        results.insert(
            id.to_string(),
            NodeExecutionResult {
                node_id: id.to_string(),
                status,
                duration_ms: duration_ms.unwrap_or(0),
                attempts,
                error,
                output,
            },
        );
    }
}

/// One task invocation. Timeouts and panics come back as failures.
async fn run_attempt(
    task: &dyn NodeTask,
    node: &Node,
    timeout: Option<Duration>,
) -> Result<serde_json::Value, String> {
    let call = AssertUnwindSafe(task.run(node)).catch_unwind();
    let caught = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(caught) => caught,
            Err(_) => {
                warn!(node_id = %node.id, timeout_ms = limit.as_millis() as u64, "task timed out");
                return Err(format!("timed out after {}ms", limit.as_millis()));
            }
        },
        None => call.await,
    };

    match caught {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("task panicked: {message}"))
        }
    }
}
