//! Authoritative view of every known node.
//!
//! A single actor task owns the node table; everything else talks to it
//! through the cloneable [`NodeRegistry`] handle and reads immutable
//! [`RegistrySnapshot`]s published after each change.

mod actor;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fleet_wire::CommandKind;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::clock::{ClockEstimate, LocalClock};
use crate::config::CoordinatorConfig;
use crate::error::ClockUnavailableError;
use crate::events::EventBus;
use crate::transport::LinkId;

use actor::{RegistryActor, RegistryCommand};

const COMMAND_DEPTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Ready,
    Recording,
    Disconnected,
    Faulted,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Recording => "recording",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Faulted => "faulted",
        }
    }

    /// Connected and heartbeating.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Ready | ConnectionState::Recording
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeIdentity {
    pub node_id: String,
    pub declared_capabilities: BTreeSet<String>,
}

impl NodeIdentity {
    pub fn new(node_id: impl Into<String>, capabilities: impl IntoIterator<Item = String>) -> Self {
        Self {
            node_id: node_id.into(),
            declared_capabilities: capabilities.into_iter().collect(),
        }
    }
}

/// Latest health report a node sent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSample {
    pub received_at_us: i64,
    pub bytes: usize,
    #[serde(skip)]
    pub payload: Bytes,
}

/// Why a node was faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum FaultCause {
    HeartbeatTimeout,
    CommandTimeout { kind: CommandKind },
    ProtocolErrors,
}

/// Requested state change. The registry applies only the moves that make
/// sense from the node's current state and ignores the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    RecordingStarted,
    RecordingStopped,
    Fault(FaultCause),
    /// A node faulted by a command timeout answered a command again.
    Recovered,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeHandle {
    pub identity: NodeIdentity,
    pub connection_state: ConnectionState,
    pub link_id: LinkId,
    pub clock: Option<ClockEstimate>,
    pub clock_stale: bool,
    /// Coordinator time of the last heartbeat.
    pub last_heartbeat_us: i64,
    pub pending_command: Option<u64>,
    pub last_status: Option<StatusSample>,
    pub fault: Option<FaultCause>,
    pub protocol_errors: u32,
}

impl NodeHandle {
    pub fn node_id(&self) -> &str {
        &self.identity.node_id
    }

    pub fn clock_offset_us(&self) -> Option<i64> {
        self.clock.map(|c| c.offset_us)
    }

    pub fn clock_uncertainty_us(&self) -> Option<i64> {
        self.clock.map(|c| c.uncertainty_us)
    }

    /// Fresh estimate, or the reason there is none.
    pub fn clock_estimate(&self) -> Result<ClockEstimate, ClockUnavailableError> {
        match self.clock {
            Some(estimate) if !self.clock_stale => Ok(estimate),
            _ => Err(ClockUnavailableError {
                node_id: self.identity.node_id.clone(),
            }),
        }
    }

    /// Eligible to join a session.
    pub fn is_ready(&self) -> bool {
        self.connection_state == ConnectionState::Ready && self.clock_estimate().is_ok()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrySnapshot {
    pub taken_at_us: i64,
    pub nodes: BTreeMap<String, NodeHandle>,
}

impl RegistrySnapshot {
    pub fn get(&self, node_id: &str) -> Option<&NodeHandle> {
        self.nodes.get(node_id)
    }

    pub fn ready_nodes(&self) -> impl Iterator<Item = &NodeHandle> {
        self.nodes.values().filter(|handle| handle.is_ready())
    }

    pub fn handles(&self) -> Vec<NodeHandle> {
        self.nodes.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    pub heartbeat_timeout: Duration,
    pub clock_staleness: Duration,
    pub sweep_interval: Duration,
    pub removal_grace: Duration,
}

impl From<&CoordinatorConfig> for RegistrySettings {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            heartbeat_timeout: config.heartbeat_timeout,
            clock_staleness: config.clock_staleness,
            sweep_interval: config.sweep_interval,
            removal_grace: config.removal_grace,
        }
    }
}

/// Handle to the registry actor.
#[derive(Clone)]
pub struct NodeRegistry {
    tx: mpsc::Sender<RegistryCommand>,
    snapshots: watch::Receiver<Arc<RegistrySnapshot>>,
}

impl NodeRegistry {
    pub fn spawn(settings: RegistrySettings, clock: LocalClock, events: EventBus) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_DEPTH);
        let (snapshot_tx, snapshots) = watch::channel(Arc::new(RegistrySnapshot::default()));
        let actor = RegistryActor::new(settings, clock, events, snapshot_tx);
        let task = tokio::spawn(actor.run(rx));
        (Self { tx, snapshots }, task)
    }

    /// Adds a node after a successful handshake, or rebinds an existing one
    /// to a new link. Returns `None` only if the actor has stopped.
    pub async fn register(&self, identity: NodeIdentity, link_id: LinkId) -> Option<NodeHandle> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::Register {
            identity,
            link_id,
            reply,
        })
        .await;
        rx.await.ok()
    }

    pub async fn update_state(&self, node_id: &str, transition: Transition) {
        self.send(RegistryCommand::Transition {
            node_id: node_id.to_string(),
            transition,
        })
        .await;
    }

    pub async fn mark_heartbeat(&self, node_id: &str, at: Instant) {
        self.send(RegistryCommand::Heartbeat {
            node_id: node_id.to_string(),
            at,
        })
        .await;
    }

    pub async fn update_clock(&self, node_id: &str, estimate: ClockEstimate) {
        self.send(RegistryCommand::Clock {
            node_id: node_id.to_string(),
            estimate,
        })
        .await;
    }

    pub async fn record_status(&self, node_id: &str, payload: Bytes) {
        self.send(RegistryCommand::Status {
            node_id: node_id.to_string(),
            payload,
        })
        .await;
    }

    pub async fn set_pending_command(&self, node_id: &str, command_id: Option<u64>) {
        self.send(RegistryCommand::PendingCommand {
            node_id: node_id.to_string(),
            command_id,
        })
        .await;
    }

    /// Marks the node disconnected if `link_id` is still its current link.
    pub async fn mark_disconnected(&self, node_id: &str, link_id: LinkId) {
        self.send(RegistryCommand::Disconnected {
            node_id: node_id.to_string(),
            link_id,
        })
        .await;
    }

    /// Returns the node's protocol error count after this one.
    pub async fn record_protocol_error(&self, node_id: &str) -> u32 {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::ProtocolError {
            node_id: node_id.to_string(),
            reply,
        })
        .await;
        rx.await.unwrap_or(0)
    }

    pub async fn remove(&self, node_id: &str) -> Option<NodeHandle> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::Remove {
            node_id: node_id.to_string(),
            reply,
        })
        .await;
        rx.await.ok().flatten()
    }

    /// Latest published snapshot. May trail mutations still queued.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Snapshot taken after every mutation queued before this call.
    pub async fn current(&self) -> Arc<RegistrySnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(RegistryCommand::Snapshot { reply }).await;
        match rx.await {
            Ok(snapshot) => snapshot,
            Err(_) => self.snapshot(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RegistrySnapshot>> {
        self.snapshots.clone()
    }

    async fn send(&self, command: RegistryCommand) {
        if self.tx.send(command).await.is_err() {
            tracing::debug!(target = "fleet::registry", "registry actor stopped; command dropped");
        }
    }
}

#[cfg(test)]
mod tests;
