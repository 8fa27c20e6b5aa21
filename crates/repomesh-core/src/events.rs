//! Progress notifications published while a run is in flight.
//!
//! Consumers call [`EventBus::subscribe`] and receive from the channel; the
//! orchestrator and executor only ever publish.

use serde::{Deserialize, Serialize};

use crate::graph::NodeStatus;

/// Pipeline phase of an orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Build,
    Resolve,
    Optimize,
    Execute,
    Visualize,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Build => "build",
            Phase::Resolve => "resolve",
            Phase::Optimize => "optimize",
            Phase::Execute => "execute",
            Phase::Visualize => "visualize",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event broadcast to all subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    RunStarted { run_id: String },
    PhaseStarted { phase: Phase },
    PhaseCompleted { phase: Phase, elapsed_ms: u64 },
    NodeStatusChanged {
        node_id: String,
        status: NodeStatus,
        attempt: u32,
    },
    /// A wave settled; `index` is 0-based.
    WaveCompleted { index: usize, size: usize },
    RunFinished { run_id: String, success: bool },
}

/// Event bus using a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: OrchestratorEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(OrchestratorEvent::PhaseStarted {
            phase: Phase::Build,
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            OrchestratorEvent::PhaseStarted {
                phase: Phase::Build
            }
        );
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::default();
        bus.publish(OrchestratorEvent::RunFinished {
            run_id: "r".to_string(),
            success: true,
        });
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(OrchestratorEvent::WaveCompleted { index: 0, size: 3 })
            .unwrap();
        assert_eq!(json["type"], "wave_completed");
        assert_eq!(json["size"], 3);
    }
}
