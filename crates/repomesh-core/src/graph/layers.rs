//! Longest-path layering shared by the optimizer and the visualizer.
//!
//! `layer(n) = 0` when `n` has no dependencies, otherwise
//! `1 + max(layer(d))` over its dependencies. Each node is computed exactly
//! once per call; the traversal is iterative so deep chains cannot overflow
//! the stack. Dependency ids that are not in the graph are ignored.

use std::collections::{BTreeMap, HashSet};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::graph::Graph;

/// Compute the layer index of every node.
///
/// Returns [`OrchestratorError::CyclicGraph`] with the offending cycle in
/// flow order (each id is a dependency of the next, first id repeated at the
/// end) if the graph is not acyclic.
pub fn compute_layers(graph: &Graph) -> OrchestratorResult<BTreeMap<String, usize>> {
    let mut layers: BTreeMap<String, usize> = BTreeMap::new();

    for root in graph.nodes() {
        if layers.contains_key(&root.id) {
            continue;
        }

        let mut stack: Vec<(&str, bool)> = vec![(root.id.as_str(), false)];
        let mut path: Vec<&str> = Vec::new();
        let mut on_path: HashSet<&str> = HashSet::new();

        while let Some((id, expanded)) = stack.pop() {
            let Some(node) = graph.node(id) else {
                continue;
            };

            if expanded {
                let layer = node
                    .dependencies
                    .iter()
                    .filter_map(|d| layers.get(d))
                    .map(|l| l + 1)
                    .max()
                    .unwrap_or(0);
                layers.insert(id.to_string(), layer);
                on_path.remove(id);
                path.pop();
                continue;
            }

            if layers.contains_key(id) {
                continue;
            }
            if on_path.contains(id) {
                return Err(cycle_error(&path, id));
            }

            on_path.insert(id);
            path.push(id);
            stack.push((id, true));

            // Reverse so the lexically smallest dependency is visited first.
            for dep in node.dependencies.iter().rev() {
                if layers.contains_key(dep) || !graph.contains(dep) {
                    continue;
                }
                if on_path.contains(dep.as_str()) {
                    return Err(cycle_error(&path, dep));
                }
                stack.push((dep.as_str(), false));
            }
        }
    }

    Ok(layers)
}

/// Build the flow-ordered cycle closed by `back_to`, which is already on `path`.
///
/// `path` runs from dependents down to dependencies, so the cycle is the
/// reversed tail starting at `back_to`.
fn cycle_error(path: &[&str], back_to: &str) -> OrchestratorError {
    let start = path.iter().position(|id| *id == back_to).unwrap_or(0);
    let mut nodes: Vec<String> = path[start..].iter().rev().map(|s| s.to_string()).collect();
    if let Some(first) = nodes.first().cloned() {
        nodes.push(first);
    }
    OrchestratorError::CyclicGraph { nodes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, EdgeKind, Node, NodeKind};

    fn graph(ids: &[&str], deps: &[(&str, &str)]) -> Graph {
        let mut g = Graph::new();
        for id in ids {
            g.add_node(Node::new(*id, NodeKind::Pipeline, "org"));
        }
        for (dependent, dependency) in deps {
            g.add_edge(Edge::new(*dependent, *dependency, EdgeKind::Dependency))
                .unwrap();
        }
        g
    }

    #[test]
    fn test_layers_follow_longest_path() {
        // d depends on a and c, c depends on b, b depends on a
        let g = graph(
            &["a", "b", "c", "d"],
            &[("b", "a"), ("c", "b"), ("d", "a"), ("d", "c")],
        );
        let layers = compute_layers(&g).unwrap();
        assert_eq!(layers["a"], 0);
        assert_eq!(layers["b"], 1);
        assert_eq!(layers["c"], 2);
        assert_eq!(layers["d"], 3);
    }

    #[test]
    fn test_ignores_dangling_dependencies() {
        let mut g = graph(&["a"], &[]);
        g.declare_dependency("a", "ghost").unwrap();
        let layers = compute_layers(&g).unwrap();
        assert_eq!(layers["a"], 0);
    }

    #[test]
    fn test_cycle_is_reported_in_flow_order() {
        // b depends on a, c depends on b, a depends on c
        let g = graph(&["a", "b", "c"], &[("b", "a"), ("c", "b"), ("a", "c")]);
        let err = compute_layers(&g).unwrap_err();
        let OrchestratorError::CyclicGraph { nodes } = err else {
            panic!("expected CyclicGraph");
        };
        assert_eq!(nodes.len(), 4);
        assert_eq!(nodes.first(), nodes.last());
        for pair in nodes.windows(2) {
            let next = g.node(&pair[1]).unwrap();
            assert!(next.dependencies.contains(&pair[0]));
        }
    }

    #[test]
    fn test_deep_chain_does_not_overflow() {
        let ids: Vec<String> = (0..5_000).map(|i| format!("n{i:05}")).collect();
        let mut g = Graph::new();
        for id in &ids {
            g.add_node(Node::new(id.as_str(), NodeKind::File, "org"));
        }
        for pair in ids.windows(2) {
            // Each node depends on the next, so the first root walks the whole chain.
            g.add_edge(Edge::new(pair[0].as_str(), pair[1].as_str(), EdgeKind::Import))
                .unwrap();
        }
        let layers = compute_layers(&g).unwrap();
        assert_eq!(layers[&ids[0]], 4_999);
        assert_eq!(layers[&ids[4_999]], 0);
    }
}
