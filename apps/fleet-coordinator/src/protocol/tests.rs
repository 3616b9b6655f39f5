use std::time::Duration;

use bytes::Bytes;
use fleet_wire::{AckStatus, CommandBody, CommandKind, Envelope, Message};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::*;
use crate::clock::{ClockEstimate, LocalClock};
use crate::events::{CoordinatorEvent, EventBus};
use crate::registry::{ConnectionState, NodeIdentity, NodeRegistry, RegistrySettings};
use crate::transport::{Inbound, Link, Router, memory_pipe, spawn_link};

struct Harness {
    dispatcher: CommandDispatcher,
    registry: NodeRegistry,
    events: broadcast::Receiver<CoordinatorEvent>,
    clock: LocalClock,
    node_inbound: Inbound,
    _node_link: Link,
}

fn settings() -> DispatchSettings {
    DispatchSettings {
        ack_timeout: Duration::from_millis(500),
        retry_count: 3,
        retry_backoff: Duration::from_millis(100),
    }
}

async fn harness(node_id: &str) -> Harness {
    let clock = LocalClock::new();
    let bus = EventBus::new();
    let events = bus.subscribe();
    let (registry, _) = NodeRegistry::spawn(
        RegistrySettings {
            heartbeat_timeout: Duration::from_secs(600),
            clock_staleness: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(1),
            removal_grace: Duration::from_secs(600),
        },
        clock,
        bus.clone(),
    );
    let router = Router::new();
    let (ours, theirs) = memory_pipe();
    let (link, _inbound) = spawn_link(ours, node_id, Duration::from_secs(1));
    let (node_link, node_inbound) = spawn_link(theirs, "coordinator", Duration::from_secs(1));
    registry
        .register(NodeIdentity::new(node_id, Vec::new()), link.id())
        .await
        .expect("registered");
    registry
        .update_clock(
            node_id,
            ClockEstimate {
                offset_us: 0,
                uncertainty_us: 10,
                drift_ppm: 0.0,
                round_trip_us: 20,
                reference_us: 0,
                updated_at_us: 0,
                samples: 1,
            },
        )
        .await;
    router.bind(node_id, link);
    let (dispatcher, _) = CommandDispatcher::spawn(settings(), router, registry.clone(), bus, clock);
    Harness {
        dispatcher,
        registry,
        events,
        clock,
        node_inbound,
        _node_link: node_link,
    }
}

async fn next_command(inbound: &mut Inbound) -> (u64, u32, CommandBody) {
    let envelope: Envelope = inbound.recv().await.expect("open").expect("decoded");
    match envelope.message {
        Message::Command { deadline_ms, body } => (envelope.id, deadline_ms, body),
        other => panic!("expected command, got {other:?}"),
    }
}

fn config_update(tag: &'static [u8]) -> CommandBody {
    CommandBody::ConfigUpdate {
        payload: Bytes::from_static(tag),
    }
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn at_most_one_active_command_per_kind() {
    let mut h = harness("cam-1").await;
    let session_id = Uuid::new_v4();

    let first = h.dispatcher.issue("cam-1", config_update(b"gain=1")).await.expect("issue");
    let arm = h.dispatcher.issue("cam-1", CommandBody::Arm { session_id }).await.expect("issue");
    let second = h.dispatcher.issue("cam-1", config_update(b"gain=2")).await.expect("issue");
    assert!(first.command_id < arm.command_id && arm.command_id < second.command_id);

    let active = h.dispatcher.active_commands().await;
    assert_eq!(active.len(), 2);
    for kind in [CommandKind::ConfigUpdate, CommandKind::Arm] {
        assert_eq!(active.iter().filter(|c| c.kind == kind).count(), 1);
    }
    let config_ids: Vec<u64> = active
        .iter()
        .filter(|c| c.kind == CommandKind::ConfigUpdate)
        .map(|c| c.command_id)
        .collect();
    assert_eq!(config_ids, vec![second.command_id]);

    let superseded_by = second.command_id;
    match first.result().await {
        Err(CommandError::Superseded { by, kind, .. }) => {
            assert_eq!(by, superseded_by);
            assert_eq!(kind, CommandKind::ConfigUpdate);
        }
        other => panic!("expected superseded, got {other:?}"),
    }

    // The node saw all three frames, in issue order.
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(next_command(&mut h.node_inbound).await.0);
    }
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    let snapshot = h.registry.current().await;
    assert_eq!(
        snapshot.get("cam-1").and_then(|n| n.pending_command),
        Some(superseded_by)
    );
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn config_update_supersedes_and_ignores_stale_ack() {
    let h = harness("cam-1").await;
    let first = h.dispatcher.issue("cam-1", config_update(b"a")).await.expect("issue");
    let second = h.dispatcher.issue("cam-1", config_update(b"b")).await.expect("issue");
    let (first_id, second_id) = (first.command_id, second.command_id);

    let now = h.clock.now_us();
    h.dispatcher
        .ack("cam-1", first_id, CommandKind::ConfigUpdate, AckStatus::Accepted, None, now)
        .await;
    let active = h.dispatcher.active_commands().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].command_id, second_id);

    h.dispatcher
        .ack("cam-1", second_id, CommandKind::ConfigUpdate, AckStatus::Accepted, None, now)
        .await;
    let ack = second.result().await.expect("acked");
    assert_eq!(ack.command_id, second_id);
    assert_eq!(ack.attempts, 1);
    assert!(matches!(first.result().await, Err(CommandError::Superseded { .. })));
    assert!(h.dispatcher.active_commands().await.is_empty());
    assert_eq!(h.registry.current().await.get("cam-1").and_then(|n| n.pending_command), None);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn unacknowledged_command_retries_then_faults_node() {
    let mut h = harness("cam-1").await;
    let started = tokio::time::Instant::now();
    let ticket = h.dispatcher.issue("cam-1", CommandBody::Ping).await.expect("issue");

    let mut deadlines = Vec::new();
    for _ in 0..4 {
        let (id, deadline_ms, body) = next_command(&mut h.node_inbound).await;
        assert_eq!(id, ticket.command_id);
        assert_eq!(body, CommandBody::Ping);
        deadlines.push(deadline_ms);
    }
    assert_eq!(deadlines, vec![500, 600, 700, 900]);

    let command_id = ticket.command_id;
    match ticket.result().await {
        Err(CommandError::TimedOut { attempts, kind, .. }) => {
            assert_eq!(attempts, 4);
            assert_eq!(kind, CommandKind::Ping);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(2_700));

    let snapshot = h.registry.current().await;
    assert_eq!(
        snapshot.get("cam-1").map(|n| n.connection_state),
        Some(ConnectionState::Faulted)
    );
    let timed_out = std::iter::from_fn(|| h.events.try_recv().ok()).any(|event| {
        matches!(event, CoordinatorEvent::CommandTimeout { command_id: id, .. } if id == command_id)
    });
    assert!(timed_out);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn late_ack_on_retry_resolves_with_attempt_count() {
    let mut h = harness("cam-1").await;
    let ticket = h.dispatcher.issue("cam-1", CommandBody::Ping).await.expect("issue");
    next_command(&mut h.node_inbound).await;
    let (id, _, _) = next_command(&mut h.node_inbound).await;

    h.dispatcher
        .ack("cam-1", id, CommandKind::Ping, AckStatus::Accepted, None, h.clock.now_us())
        .await;
    let ack = ticket.result().await.expect("acked");
    assert_eq!(ack.attempts, 2);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn negative_ack_resolves_as_rejected() {
    let h = harness("cam-1").await;
    let session_id = Uuid::new_v4();
    let ticket = h.dispatcher.issue("cam-1", CommandBody::Arm { session_id }).await.expect("issue");
    h.dispatcher
        .ack(
            "cam-1",
            ticket.command_id,
            CommandKind::Arm,
            AckStatus::Rejected("disk full".into()),
            None,
            h.clock.now_us(),
        )
        .await;
    match ticket.result().await {
        Err(CommandError::Rejected { reason, .. }) => assert_eq!(reason, "disk full"),
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn unknown_node_is_unreachable() {
    let h = harness("cam-1").await;
    let ticket = h.dispatcher.issue("cam-9", CommandBody::Ping).await.expect("issue");
    assert!(matches!(
        ticket.result().await,
        Err(CommandError::Unreachable { .. })
    ));
    assert!(h.dispatcher.active_commands().await.is_empty());
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn cancel_all_resolves_every_kind() {
    let h = harness("cam-1").await;
    let session_id = Uuid::new_v4();
    let arm = h.dispatcher.issue("cam-1", CommandBody::Arm { session_id }).await.expect("issue");
    let ping = h.dispatcher.issue("cam-1", CommandBody::Ping).await.expect("issue");

    assert_eq!(h.dispatcher.cancel_all(["cam-1"]).await, 2);
    assert!(matches!(arm.result().await, Err(CommandError::Cancelled { .. })));
    assert!(matches!(ping.result().await, Err(CommandError::Cancelled { .. })));
    assert!(!h.dispatcher.cancel("cam-1", CommandKind::Arm).await);
}

#[test_timeout::timeout]
fn attempt_windows_grow_with_backoff() {
    let settings = settings();
    let windows: Vec<u64> = (1..=4).map(|a| settings.attempt_window(a).as_millis() as u64).collect();
    assert_eq!(windows, vec![500, 600, 700, 900]);
    assert_eq!(settings.lifetime(), Duration::from_millis(2700));
}
