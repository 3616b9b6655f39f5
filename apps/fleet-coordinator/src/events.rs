//! Lifecycle notifications fanned out to the session coordinator and to any
//! external observers (UI, exporters).

use async_trait::async_trait;
use fleet_wire::CommandKind;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::error::FailureReason;
use crate::registry::ConnectionState;
use crate::session::SessionState;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    SessionStateChanged {
        session_id: Uuid,
        old: SessionState,
        new: SessionState,
        details: String,
    },
    SessionNodeLost {
        session_id: Uuid,
        node_id: String,
        #[serde(flatten)]
        reason: FailureReason,
    },
    NodeStateChanged {
        node_id: String,
        /// `None` the first time a node is seen.
        old: Option<ConnectionState>,
        new: ConnectionState,
    },
    NodeRemoved {
        node_id: String,
    },
    CommandTimeout {
        node_id: String,
        kind: CommandKind,
        command_id: u64,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoordinatorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: CoordinatorEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.tx.subscribe()
    }
}

/// Callback-style consumer of lifecycle events.
#[async_trait]
pub trait LifecycleObserver: Send + Sync + 'static {
    async fn on_session_state_changed(
        &self,
        _session_id: Uuid,
        _old: SessionState,
        _new: SessionState,
        _details: &str,
    ) {
    }

    async fn on_node_state_changed(
        &self,
        _node_id: &str,
        _old: Option<ConnectionState>,
        _new: ConnectionState,
    ) {
    }

    async fn on_event(&self, _event: &CoordinatorEvent) {}
}

/// Drives `observer` from the bus until the bus closes.
pub fn spawn_observer(bus: &EventBus, observer: Arc<dyn LifecycleObserver>) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target = "fleet::events", skipped, "observer lagged behind event bus");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match &event {
                CoordinatorEvent::SessionStateChanged {
                    session_id,
                    old,
                    new,
                    details,
                } => {
                    observer
                        .on_session_state_changed(*session_id, *old, *new, details)
                        .await
                }
                CoordinatorEvent::NodeStateChanged { node_id, old, new } => {
                    observer.on_node_state_changed(node_id, *old, *new).await
                }
                _ => {}
            }
            observer.on_event(&event).await;
        }
    })
}
