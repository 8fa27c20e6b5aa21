//! Wave planning.
//!
//! A wave holds every node whose longest dependency chain has the same
//! length, so each node's dependencies sit in strictly earlier waves. Within
//! a wave nodes are ordered by descending priority, then by id. Planning does
//! not touch the graph and the same graph always yields the same plan.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::OrchestratorResult;
use crate::graph::{compute_layers, Graph};

/// Nodes that may run concurrently once every earlier wave has settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wave {
    /// 0-based position in the plan.
    pub index: usize,
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub waves: Vec<Wave>,
}

impl ExecutionPlan {
    /// Plan as plain id groups, one per wave.
    pub fn groups(&self) -> Vec<Vec<String>> {
        self.waves.iter().map(|w| w.nodes.clone()).collect()
    }

    /// Index of the wave containing `id`.
    pub fn wave_of(&self, id: &str) -> Option<usize> {
        self.waves
            .iter()
            .find(|w| w.nodes.iter().any(|n| n == id))
            .map(|w| w.index)
    }

    pub fn total_nodes(&self) -> usize {
        self.waves.iter().map(|w| w.nodes.len()).sum()
    }

    /// Size of the widest wave.
    pub fn max_parallelism(&self) -> usize {
        self.waves.iter().map(|w| w.nodes.len()).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }
}

pub struct Optimizer;

impl Optimizer {
    /// Group the graph into dependency-ordered waves.
    ///
    /// Fails with [`crate::OrchestratorError::CyclicGraph`] if a cycle is
    /// still present; cycles are expected to be repaired beforehand.
    #[instrument(skip_all, fields(nodes = graph.node_count()))]
    pub fn plan(graph: &Graph) -> OrchestratorResult<ExecutionPlan> {
        let layers = compute_layers(graph)?;

        let mut grouped: BTreeMap<usize, Vec<(i32, &str)>> = BTreeMap::new();
        for (id, layer) in &layers {
            let priority = graph.node(id).map_or(0, |n| n.priority);
            grouped.entry(*layer).or_default().push((priority, id.as_str()));
        }

        let waves: Vec<Wave> = grouped
            .into_values()
            .enumerate()
            .map(|(index, mut members)| {
                members.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
                Wave {
                    index,
                    nodes: members.into_iter().map(|(_, id)| id.to_string()).collect(),
                }
            })
            .collect();

        debug!(waves = waves.len(), "execution plan computed");
        Ok(ExecutionPlan { waves })
    }
}
