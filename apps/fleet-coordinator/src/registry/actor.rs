use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{
    ConnectionState, FaultCause, NodeHandle, NodeIdentity, RegistrySettings, RegistrySnapshot,
    StatusSample, Transition,
};
use crate::clock::{ClockEstimate, LocalClock};
use crate::events::{CoordinatorEvent, EventBus};
use crate::metrics;
use crate::transport::LinkId;

pub(super) enum RegistryCommand {
    Register {
        identity: NodeIdentity,
        link_id: LinkId,
        reply: oneshot::Sender<NodeHandle>,
    },
    Transition {
        node_id: String,
        transition: Transition,
    },
    Heartbeat {
        node_id: String,
        at: Instant,
    },
    Clock {
        node_id: String,
        estimate: ClockEstimate,
    },
    Status {
        node_id: String,
        payload: Bytes,
    },
    PendingCommand {
        node_id: String,
        command_id: Option<u64>,
    },
    Disconnected {
        node_id: String,
        link_id: LinkId,
    },
    ProtocolError {
        node_id: String,
        reply: oneshot::Sender<u32>,
    },
    Remove {
        node_id: String,
        reply: oneshot::Sender<Option<NodeHandle>>,
    },
    Snapshot {
        reply: oneshot::Sender<Arc<RegistrySnapshot>>,
    },
}

struct Entry {
    handle: NodeHandle,
    last_heartbeat: Instant,
    clock_updated: Option<Instant>,
    state_since: Instant,
    /// State the node was in when it last faulted.
    faulted_from: Option<ConnectionState>,
}

pub(super) struct RegistryActor {
    settings: RegistrySettings,
    clock: LocalClock,
    events: EventBus,
    snapshots: watch::Sender<Arc<RegistrySnapshot>>,
    nodes: HashMap<String, Entry>,
}

impl RegistryActor {
    pub(super) fn new(
        settings: RegistrySettings,
        clock: LocalClock,
        events: EventBus,
        snapshots: watch::Sender<Arc<RegistrySnapshot>>,
    ) -> Self {
        Self {
            settings,
            clock,
            events,
            snapshots,
            nodes: HashMap::new(),
        }
    }

    pub(super) async fn run(mut self, mut rx: mpsc::Receiver<RegistryCommand>) {
        let mut sweep = tokio::time::interval(self.settings.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let changed = tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = sweep.tick() => self.sweep(Instant::now()),
            };
            if changed {
                self.publish();
            }
        }
        debug!(target = "fleet::registry", "registry actor stopped");
    }

    /// Applies one command; returns whether the snapshot changed.
    fn handle(&mut self, command: RegistryCommand) -> bool {
        match command {
            RegistryCommand::Register {
                identity,
                link_id,
                reply,
            } => {
                let handle = self.register(identity, link_id);
                self.publish();
                let _ = reply.send(handle);
                false
            }
            RegistryCommand::Transition {
                node_id,
                transition,
            } => self.transition(&node_id, transition),
            RegistryCommand::Heartbeat { node_id, at } => self.heartbeat(&node_id, at),
            RegistryCommand::Clock { node_id, estimate } => self.clock_update(&node_id, estimate),
            RegistryCommand::Status { node_id, payload } => {
                let received_at_us = self.clock.now_us();
                match self.nodes.get_mut(&node_id) {
                    Some(entry) => {
                        entry.handle.last_status = Some(StatusSample {
                            received_at_us,
                            bytes: payload.len(),
                            payload,
                        });
                        true
                    }
                    None => false,
                }
            }
            RegistryCommand::PendingCommand {
                node_id,
                command_id,
            } => match self.nodes.get_mut(&node_id) {
                Some(entry) if entry.handle.pending_command != command_id => {
                    entry.handle.pending_command = command_id;
                    true
                }
                _ => false,
            },
            RegistryCommand::Disconnected { node_id, link_id } => {
                let current = self.nodes.get(&node_id).map(|e| e.handle.link_id);
                if current != Some(link_id) {
                    debug!(
                        target = "fleet::registry",
                        node_id = %node_id,
                        link_id,
                        "ignoring closure of superseded link"
                    );
                    return false;
                }
                self.set_state(&node_id, ConnectionState::Disconnected)
            }
            RegistryCommand::ProtocolError { node_id, reply } => {
                let count = match self.nodes.get_mut(&node_id) {
                    Some(entry) => {
                        entry.handle.protocol_errors += 1;
                        entry.handle.protocol_errors
                    }
                    None => 0,
                };
                let _ = reply.send(count);
                count > 0
            }
            RegistryCommand::Remove { node_id, reply } => {
                let removed = self.remove(&node_id);
                let changed = removed.is_some();
                let _ = reply.send(removed);
                changed
            }
            RegistryCommand::Snapshot { reply } => {
                let _ = reply.send(self.build_snapshot());
                false
            }
        }
    }

    fn register(&mut self, identity: NodeIdentity, link_id: LinkId) -> NodeHandle {
        let now = Instant::now();
        let now_us = self.clock.micros_at(now);
        let node_id = identity.node_id.clone();
        let old = match self.nodes.get_mut(&node_id) {
            Some(entry) => {
                let old = entry.handle.connection_state;
                info!(
                    target = "fleet::registry",
                    node_id = %node_id,
                    old_link = entry.handle.link_id,
                    link_id,
                    "node re-registered"
                );
                entry.handle.identity = identity;
                entry.handle.link_id = link_id;
                entry.handle.connection_state = ConnectionState::Connecting;
                entry.handle.clock = None;
                entry.handle.clock_stale = false;
                entry.handle.fault = None;
                entry.handle.protocol_errors = 0;
                entry.handle.last_heartbeat_us = now_us;
                entry.last_heartbeat = now;
                entry.clock_updated = None;
                entry.state_since = now;
                entry.faulted_from = None;
                Some(old)
            }
            None => {
                info!(target = "fleet::registry", node_id = %node_id, link_id, "node registered");
                self.nodes.insert(
                    node_id.clone(),
                    Entry {
                        handle: NodeHandle {
                            identity,
                            connection_state: ConnectionState::Connecting,
                            link_id,
                            clock: None,
                            clock_stale: false,
                            last_heartbeat_us: now_us,
                            pending_command: None,
                            last_status: None,
                            fault: None,
                            protocol_errors: 0,
                        },
                        last_heartbeat: now,
                        clock_updated: None,
                        state_since: now,
                        faulted_from: None,
                    },
                );
                None
            }
        };
        self.emit_transition(&node_id, old, ConnectionState::Connecting);
        self.nodes[&node_id].handle.clone()
    }

    fn transition(&mut self, node_id: &str, transition: Transition) -> bool {
        let Some(entry) = self.nodes.get_mut(node_id) else {
            return false;
        };
        let current = entry.handle.connection_state;
        let target = match (transition, current) {
            (Transition::RecordingStarted, ConnectionState::Ready) => ConnectionState::Recording,
            (Transition::RecordingStopped, ConnectionState::Recording) => ConnectionState::Ready,
            (Transition::RecordingStopped, ConnectionState::Faulted) => {
                // Capture ended while faulted; recover to Ready, not Recording.
                entry.faulted_from = None;
                return false;
            }
            (Transition::Fault(cause), state) if state.is_live() => {
                entry.handle.fault = Some(cause);
                entry.faulted_from = Some(state);
                ConnectionState::Faulted
            }
            (Transition::Recovered, ConnectionState::Faulted)
                if matches!(entry.handle.fault, Some(FaultCause::CommandTimeout { .. })) =>
            {
                entry.handle.fault = None;
                recovery_state(entry)
            }
            (transition, state) => {
                debug!(
                    target = "fleet::registry",
                    node_id,
                    ?transition,
                    state = state.as_str(),
                    "transition not applicable"
                );
                return false;
            }
        };
        self.set_state(node_id, target)
    }

    fn heartbeat(&mut self, node_id: &str, at: Instant) -> bool {
        let at_us = self.clock.micros_at(at);
        let Some(entry) = self.nodes.get_mut(node_id) else {
            return false;
        };
        entry.last_heartbeat = at;
        entry.handle.last_heartbeat_us = at_us;
        if entry.handle.connection_state == ConnectionState::Faulted
            && entry.handle.fault == Some(FaultCause::HeartbeatTimeout)
        {
            let target = recovery_state(entry);
            entry.handle.fault = None;
            info!(target = "fleet::registry", node_id, "heartbeats resumed");
            self.set_state(node_id, target);
        }
        true
    }

    fn clock_update(&mut self, node_id: &str, estimate: ClockEstimate) -> bool {
        let Some(entry) = self.nodes.get_mut(node_id) else {
            return false;
        };
        entry.handle.clock = Some(estimate);
        entry.handle.clock_stale = false;
        entry.clock_updated = Some(Instant::now());
        metrics::CLOCK_UNCERTAINTY_US
            .with_label_values(&[node_id])
            .set(estimate.uncertainty_us);
        if entry.handle.connection_state == ConnectionState::Connecting {
            self.set_state(node_id, ConnectionState::Ready);
        }
        true
    }

    fn remove(&mut self, node_id: &str) -> Option<NodeHandle> {
        let entry = self.nodes.remove(node_id)?;
        let _ = metrics::CLOCK_UNCERTAINTY_US.remove_label_values(&[node_id]);
        info!(target = "fleet::registry", node_id, "node removed");
        self.events.publish(CoordinatorEvent::NodeRemoved {
            node_id: node_id.to_string(),
        });
        Some(entry.handle)
    }

    /// Heartbeat expiry, clock staleness and removal of long-dead nodes.
    fn sweep(&mut self, now: Instant) -> bool {
        let mut changed = false;
        let mut expired = Vec::new();
        let mut removable = Vec::new();

        for (node_id, entry) in self.nodes.iter_mut() {
            let state = entry.handle.connection_state;
            if state.is_live()
                && now.saturating_duration_since(entry.last_heartbeat) > self.settings.heartbeat_timeout
            {
                expired.push(node_id.clone());
            }
            if let Some(updated) = entry.clock_updated {
                let stale = now.saturating_duration_since(updated) > self.settings.clock_staleness;
                if stale != entry.handle.clock_stale {
                    entry.handle.clock_stale = stale;
                    changed = true;
                    if stale {
                        warn!(target = "fleet::registry", node_id = %node_id, "clock estimate went stale");
                    }
                }
            }
            let idle_since = match state {
                ConnectionState::Disconnected => Some(entry.state_since),
                ConnectionState::Faulted => Some(entry.state_since.max(entry.last_heartbeat)),
                _ => None,
            };
            if idle_since.is_some_and(|since| {
                now.saturating_duration_since(since) > self.settings.removal_grace
            }) {
                removable.push(node_id.clone());
            }
        }

        for node_id in expired {
            warn!(target = "fleet::registry", node_id = %node_id, "heartbeat timeout");
            if let Some(entry) = self.nodes.get_mut(&node_id) {
                entry.handle.fault = Some(FaultCause::HeartbeatTimeout);
                entry.faulted_from = Some(entry.handle.connection_state);
            }
            changed |= self.set_state(&node_id, ConnectionState::Faulted);
        }
        for node_id in removable {
            changed |= self.remove(&node_id).is_some();
        }
        changed
    }

    fn set_state(&mut self, node_id: &str, target: ConnectionState) -> bool {
        let Some(entry) = self.nodes.get_mut(node_id) else {
            return false;
        };
        let old = entry.handle.connection_state;
        if old == target {
            return false;
        }
        entry.handle.connection_state = target;
        entry.state_since = Instant::now();
        self.emit_transition(node_id, Some(old), target);
        true
    }

    fn emit_transition(&self, node_id: &str, old: Option<ConnectionState>, new: ConnectionState) {
        info!(
            target = "fleet::registry",
            node_id,
            old = old.map(ConnectionState::as_str).unwrap_or("none"),
            new = new.as_str(),
            "node state changed"
        );
        metrics::NODE_TRANSITIONS.with_label_values(&[new.as_str()]).inc();
        self.events.publish(CoordinatorEvent::NodeStateChanged {
            node_id: node_id.to_string(),
            old,
            new,
        });
    }

    fn build_snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::new(RegistrySnapshot {
            taken_at_us: self.clock.now_us(),
            nodes: self
                .nodes
                .iter()
                .map(|(id, entry)| (id.clone(), entry.handle.clone()))
                .collect(),
        })
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.build_snapshot());
    }
}

/// Where a faulted node goes once it shows signs of life again. A node that
/// faulted mid-capture is still capturing until it acknowledges a Stop.
fn recovery_state(entry: &Entry) -> ConnectionState {
    let handle = &entry.handle;
    if entry.faulted_from == Some(ConnectionState::Recording) {
        ConnectionState::Recording
    } else if handle.clock.is_some() && !handle.clock_stale {
        ConnectionState::Ready
    } else {
        ConnectionState::Connecting
    }
}
