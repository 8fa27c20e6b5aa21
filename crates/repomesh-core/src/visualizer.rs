//! Layered layout payload and a plain-text statistics report.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorResult;
use crate::graph::{compute_layers, Graph, GraphStatistics, NodeKind, NodeStatus};

/// Horizontal distance between layers.
pub const LAYER_SPACING: f64 = 200.0;
/// Vertical distance between nodes of the same layer.
pub const NODE_SPACING: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePosition {
    pub id: String,
    pub kind: NodeKind,
    pub status: NodeStatus,
    pub layer: usize,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeView {
    pub source: String,
    pub target: String,
    pub critical: bool,
}

/// Layout consumed by external renderers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Visualization {
    pub nodes: Vec<NodePosition>,
    pub edges: Vec<EdgeView>,
    pub layer_count: usize,
}

impl Visualization {
    pub fn position(&self, id: &str) -> Option<&NodePosition> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

pub struct Visualizer;

impl Visualizer {
    /// Place each node at `x = layer * LAYER_SPACING`, `y = slot * NODE_SPACING`,
    /// where `slot` is the node's index within its layer in id order.
    pub fn layout(graph: &Graph) -> OrchestratorResult<Visualization> {
        let layers = compute_layers(graph)?;
        let layer_count = layers.values().max().map_or(0, |max| max + 1);

        let mut slots = vec![0usize; layer_count];
        let nodes = graph
            .nodes()
            .filter_map(|node| {
                let layer = *layers.get(&node.id)?;
                let slot = slots[layer];
                slots[layer] += 1;
                Some(NodePosition {
                    id: node.id.clone(),
                    kind: node.kind,
                    status: node.status,
                    layer,
                    x: layer as f64 * LAYER_SPACING,
                    y: slot as f64 * NODE_SPACING,
                })
            })
            .collect();

        let edges = graph
            .edges()
            .iter()
            .map(|e| EdgeView {
                source: e.source.clone(),
                target: e.target.clone(),
                critical: e.critical,
            })
            .collect();

        Ok(Visualization {
            nodes,
            edges,
            layer_count,
        })
    }

    /// Human-readable summary of graph statistics.
    pub fn render_report(stats: &GraphStatistics) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Graph report");
        let _ = writeln!(out, "  nodes: {}", stats.total_nodes);
        let _ = writeln!(out, "  edges: {}", stats.total_edges);
        let _ = writeln!(out, "  completion rate: {:.1}%", stats.completion_rate() * 100.0);
        let _ = writeln!(out, "  average compliance: {:.1}", stats.average_compliance);

        let _ = writeln!(out, "By type:");
        for (kind, count) in &stats.by_kind {
            let _ = writeln!(out, "  {kind}: {count}");
        }
        let _ = writeln!(out, "By organization:");
        for (org, count) in &stats.by_organization {
            let _ = writeln!(out, "  {org}: {count}");
        }
        let _ = writeln!(out, "By status:");
        for (status, count) in &stats.by_status {
            let _ = writeln!(out, "  {status}: {count}");
        }
        out
    }
}
