#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fleet_coordinator::agent::{self, AgentConfig, AgentEvent, AgentHandle, SimulatedClock};
use fleet_coordinator::hooks::InMemoryPersistence;
use fleet_coordinator::registry::ConnectionState;
use fleet_coordinator::session::{SessionSnapshot, SessionState};
use fleet_coordinator::transport::memory_pipe;
use fleet_coordinator::{Collaborators, CoordinatorConfig, Fleet};
use tokio::sync::mpsc;

pub const POLL: Duration = Duration::from_millis(10);

/// Short timers so scenarios finish in a few seconds of (paused) time.
pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        heartbeat_interval: Duration::from_millis(250),
        heartbeat_timeout: Duration::from_secs(1),
        sweep_interval: Duration::from_millis(100),
        probe_interval: Duration::from_millis(200),
        probe_timeout: Duration::from_millis(100),
        clock_staleness: Duration::from_secs(5),
        ..CoordinatorConfig::default()
    }
}

pub struct TestFleet {
    pub fleet: Fleet,
    pub outcomes: Arc<InMemoryPersistence>,
}

pub fn start_fleet(config: CoordinatorConfig) -> TestFleet {
    let outcomes = InMemoryPersistence::new();
    let collaborators = Collaborators {
        persistence: outcomes.clone(),
        ..Collaborators::default()
    };
    TestFleet {
        fleet: Fleet::start(config, collaborators),
        outcomes,
    }
}

pub struct TestNode {
    pub node_id: String,
    pub offset_us: i64,
    pub handle: AgentHandle,
    pub events: mpsc::UnboundedReceiver<AgentEvent>,
}

impl TestNode {
    /// Next event matching `pred`, skipping the rest.
    pub async fn next_event(&mut self, pred: impl Fn(&AgentEvent) -> bool) -> AgentEvent {
        loop {
            let event = self.events.recv().await.expect("agent event stream ended");
            if pred(&event) {
                return event;
            }
        }
    }

    /// Every event received so far.
    pub fn drain(&mut self) -> Vec<AgentEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }
}

/// Connects a simulated node whose clock runs `offset_us` ahead of the
/// coordinator's.
pub async fn join(fleet: &Fleet, node_id: &str, offset_us: i64) -> TestNode {
    let (coordinator_side, node_side) = memory_pipe();
    fleet.attach(coordinator_side, format!("mem:{node_id}"));
    let config = AgentConfig {
        heartbeat_interval: fleet.config().heartbeat_interval,
        ..AgentConfig::new(node_id).with_capabilities(["video"])
    };
    let clock = SimulatedClock::new(fleet.clock(), offset_us, 0.0);
    let (handle, events) = agent::connect(node_side, config, clock)
        .await
        .expect("agent handshake");
    TestNode {
        node_id: node_id.to_string(),
        offset_us,
        handle,
        events,
    }
}

pub async fn join_all(fleet: &Fleet, nodes: &[(&str, i64)]) -> Vec<TestNode> {
    let mut joined = Vec::with_capacity(nodes.len());
    for (node_id, offset_us) in nodes {
        joined.push(join(fleet, node_id, *offset_us).await);
    }
    wait_for_state(fleet, nodes.iter().map(|(id, _)| *id), ConnectionState::Ready).await;
    joined
}

pub async fn wait_for_state<'a>(
    fleet: &Fleet,
    nodes: impl IntoIterator<Item = &'a str>,
    state: ConnectionState,
) {
    let nodes: Vec<&str> = nodes.into_iter().collect();
    loop {
        let snapshot = fleet.registry_snapshot().await;
        let reached = nodes.iter().all(|id| {
            snapshot
                .iter()
                .any(|handle| handle.node_id() == *id && handle.connection_state == state)
        });
        if reached {
            return;
        }
        tokio::time::sleep(POLL).await;
    }
}

pub async fn wait_for_session(fleet: &Fleet, pred: impl Fn(&SessionSnapshot) -> bool) -> SessionSnapshot {
    loop {
        if let Some(session) = fleet.session_status().await {
            if pred(&session) {
                return session;
            }
        }
        tokio::time::sleep(POLL).await;
    }
}

pub async fn wait_for_recording(fleet: &Fleet) -> SessionSnapshot {
    wait_for_session(fleet, |session| {
        session.state == SessionState::Recording
            && session
                .per_node_ack
                .values()
                .all(|ack| ack.started_ack_us.is_some())
    })
    .await
}

pub fn is_start(event: &AgentEvent) -> bool {
    matches!(event, AgentEvent::Started { .. })
}

pub fn is_stop(event: &AgentEvent) -> bool {
    matches!(event, AgentEvent::Stopped { .. })
}
