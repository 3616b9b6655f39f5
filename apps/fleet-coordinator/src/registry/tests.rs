use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use super::*;
use crate::events::CoordinatorEvent;

fn settings() -> RegistrySettings {
    RegistrySettings {
        heartbeat_timeout: Duration::from_secs(3),
        clock_staleness: Duration::from_secs(10),
        sweep_interval: Duration::from_millis(250),
        removal_grace: Duration::from_secs(60),
    }
}

fn estimate(offset_us: i64) -> ClockEstimate {
    ClockEstimate {
        offset_us,
        uncertainty_us: 150,
        drift_ppm: 0.0,
        round_trip_us: 300,
        reference_us: 0,
        updated_at_us: 0,
        samples: 1,
    }
}

fn spawn() -> (NodeRegistry, broadcast::Receiver<CoordinatorEvent>) {
    let events = EventBus::new();
    let rx = events.subscribe();
    let (registry, _task) = NodeRegistry::spawn(settings(), LocalClock::new(), events);
    (registry, rx)
}

fn identity(node_id: &str) -> NodeIdentity {
    NodeIdentity::new(node_id, ["imu".to_string()])
}

async fn state_of(registry: &NodeRegistry, node_id: &str) -> ConnectionState {
    registry
        .current()
        .await
        .get(node_id)
        .expect("node present")
        .connection_state
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn first_clock_estimate_makes_node_ready() {
    let (registry, mut events) = spawn();
    let handle = registry.register(identity("cam-1"), 7).await.expect("registered");
    assert_eq!(handle.connection_state, ConnectionState::Connecting);
    assert!(!handle.is_ready());

    registry.update_clock("cam-1", estimate(1_200)).await;
    let snapshot = registry.current().await;
    let node = snapshot.get("cam-1").expect("node");
    assert!(node.is_ready());
    assert_eq!(node.clock_offset_us(), Some(1_200));
    assert_eq!(snapshot.ready_nodes().count(), 1);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CoordinatorEvent::NodeStateChanged { old, new, .. } = event {
            seen.push((old, new));
        }
    }
    assert_eq!(
        seen,
        vec![
            (None, ConnectionState::Connecting),
            (Some(ConnectionState::Connecting), ConnectionState::Ready),
        ]
    );
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn silent_node_faults_and_recovers_on_heartbeat() {
    let (registry, _events) = spawn();
    registry.register(identity("cam-1"), 1).await.expect("registered");
    registry.update_clock("cam-1", estimate(0)).await;

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    registry.mark_heartbeat("cam-1", Instant::now()).await;
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(state_of(&registry, "cam-1").await, ConnectionState::Ready);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    let snapshot = registry.current().await;
    let node = snapshot.get("cam-1").expect("node");
    assert_eq!(node.connection_state, ConnectionState::Faulted);
    assert_eq!(node.fault, Some(FaultCause::HeartbeatTimeout));

    registry.mark_heartbeat("cam-1", Instant::now()).await;
    assert_eq!(state_of(&registry, "cam-1").await, ConnectionState::Ready);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn command_fault_waits_for_explicit_recovery() {
    let (registry, _events) = spawn();
    registry.register(identity("cam-1"), 1).await.expect("registered");
    registry.update_clock("cam-1", estimate(0)).await;
    registry
        .update_state(
            "cam-1",
            Transition::Fault(FaultCause::CommandTimeout {
                kind: fleet_wire::CommandKind::Arm,
            }),
        )
        .await;

    registry.mark_heartbeat("cam-1", Instant::now()).await;
    assert_eq!(state_of(&registry, "cam-1").await, ConnectionState::Faulted);

    registry.update_state("cam-1", Transition::Recovered).await;
    assert_eq!(state_of(&registry, "cam-1").await, ConnectionState::Ready);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn closure_of_replaced_link_is_ignored() {
    let (registry, _events) = spawn();
    registry.register(identity("cam-1"), 1).await.expect("registered");
    registry.update_clock("cam-1", estimate(0)).await;

    let rebound = registry.register(identity("cam-1"), 2).await.expect("re-registered");
    assert_eq!(rebound.link_id, 2);
    assert_eq!(rebound.connection_state, ConnectionState::Connecting);
    assert!(rebound.clock.is_none());

    registry.mark_disconnected("cam-1", 1).await;
    assert_eq!(state_of(&registry, "cam-1").await, ConnectionState::Connecting);

    registry.mark_disconnected("cam-1", 2).await;
    assert_eq!(state_of(&registry, "cam-1").await, ConnectionState::Disconnected);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn recording_transitions_require_ready() {
    let (registry, _events) = spawn();
    registry.register(identity("cam-1"), 1).await.expect("registered");

    registry.update_state("cam-1", Transition::RecordingStarted).await;
    assert_eq!(state_of(&registry, "cam-1").await, ConnectionState::Connecting);

    registry.update_clock("cam-1", estimate(0)).await;
    registry.update_state("cam-1", Transition::RecordingStarted).await;
    assert_eq!(state_of(&registry, "cam-1").await, ConnectionState::Recording);
    registry.update_state("cam-1", Transition::RecordingStopped).await;
    assert_eq!(state_of(&registry, "cam-1").await, ConnectionState::Ready);
}

#[test_timeout::tokio_timeout_test(120, paused)]
async fn stale_clock_and_removal_grace() {
    let (registry, mut events) = spawn();
    registry.register(identity("cam-1"), 1).await.expect("registered");
    registry.update_clock("cam-1", estimate(0)).await;

    // Keep heartbeating so only the clock ages.
    for _ in 0..11 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        registry.mark_heartbeat("cam-1", Instant::now()).await;
    }
    let snapshot = registry.current().await;
    let node = snapshot.get("cam-1").expect("node");
    assert!(node.clock_stale);
    assert!(!node.is_ready());
    assert!(node.clock_estimate().is_err());

    registry.mark_disconnected("cam-1", 1).await;
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(registry.current().await.get("cam-1").is_none());

    let removed = std::iter::from_fn(|| events.try_recv().ok())
        .any(|event| matches!(event, CoordinatorEvent::NodeRemoved { ref node_id } if node_id == "cam-1"));
    assert!(removed);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn protocol_errors_accumulate_per_node() {
    let (registry, _events) = spawn();
    registry.register(identity("cam-1"), 1).await.expect("registered");
    assert_eq!(registry.record_protocol_error("cam-1").await, 1);
    assert_eq!(registry.record_protocol_error("cam-1").await, 2);
    assert_eq!(registry.record_protocol_error("ghost").await, 0);
    assert_eq!(
        registry.current().await.get("cam-1").map(|n| n.protocol_errors),
        Some(2)
    );
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn node_faulted_mid_capture_recovers_as_recording() {
    let (registry, _events) = spawn();
    registry.register(identity("cam-1"), 1).await.expect("registered");
    registry.update_clock("cam-1", estimate(0)).await;
    registry.update_state("cam-1", Transition::RecordingStarted).await;

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(state_of(&registry, "cam-1").await, ConnectionState::Faulted);

    // Acks do not clear a heartbeat fault.
    registry.update_state("cam-1", Transition::Recovered).await;
    assert_eq!(state_of(&registry, "cam-1").await, ConnectionState::Faulted);

    registry.mark_heartbeat("cam-1", Instant::now()).await;
    assert_eq!(state_of(&registry, "cam-1").await, ConnectionState::Recording);
    registry.update_state("cam-1", Transition::RecordingStopped).await;
    assert_eq!(state_of(&registry, "cam-1").await, ConnectionState::Ready);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn stop_acked_while_faulted_recovers_as_ready() {
    let (registry, _events) = spawn();
    registry.register(identity("cam-1"), 1).await.expect("registered");
    registry.update_clock("cam-1", estimate(0)).await;
    registry.update_state("cam-1", Transition::RecordingStarted).await;

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(state_of(&registry, "cam-1").await, ConnectionState::Faulted);
    registry.update_state("cam-1", Transition::RecordingStopped).await;
    assert_eq!(state_of(&registry, "cam-1").await, ConnectionState::Faulted);

    registry.mark_heartbeat("cam-1", Instant::now()).await;
    assert_eq!(state_of(&registry, "cam-1").await, ConnectionState::Ready);
}
