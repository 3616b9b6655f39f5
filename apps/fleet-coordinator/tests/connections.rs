mod support;

use std::sync::Arc;

use bytes::Bytes;
use fleet_coordinator::agent::{self, AgentConfig, AgentError, AgentEvent, SimulatedClock};
use fleet_coordinator::hooks::RequiredCapabilities;
use fleet_coordinator::registry::ConnectionState;
use fleet_coordinator::transport::memory_pipe;
use fleet_coordinator::{Collaborators, Fleet};
use support::*;

#[test_timeout::tokio_timeout_test(30, paused)]
async fn node_missing_required_capability_is_rejected() {
    let collaborators = Collaborators {
        negotiator: Arc::new(RequiredCapabilities::new(["lidar"])),
        ..Collaborators::default()
    };
    let fleet = Fleet::start(test_config(), collaborators);

    let (coordinator_side, node_side) = memory_pipe();
    fleet.attach(coordinator_side, "mem:cam-a");
    let result = agent::connect(
        node_side,
        AgentConfig::new("cam-a").with_capabilities(["video"]),
        SimulatedClock::exact(fleet.clock()),
    )
    .await;
    match result {
        Err(AgentError::Rejected(reason)) => assert!(reason.contains("lidar"), "{reason}"),
        Err(other) => panic!("expected rejection, got {other}"),
        Ok(_) => panic!("node without lidar was admitted"),
    }
    assert!(fleet.registry_snapshot().await.is_empty());
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn reconnecting_node_replaces_its_link() {
    let t = start_fleet(test_config());
    let mut first = join(&t.fleet, "cam-a", 0).await;
    wait_for_state(&t.fleet, ["cam-a"], ConnectionState::Ready).await;
    let first_link = t.fleet.registry_snapshot().await[0].link_id;

    let _second = join(&t.fleet, "cam-a", 0).await;
    first.next_event(|event| matches!(event, AgentEvent::Disconnected)).await;
    loop {
        let nodes = t.fleet.registry_snapshot().await;
        assert_eq!(nodes.len(), 1);
        if nodes[0].link_id != first_link && nodes[0].connection_state == ConnectionState::Ready {
            break;
        }
        tokio::time::sleep(POLL).await;
    }
    // The old link's closure must not mark the live node disconnected.
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    assert_eq!(
        t.fleet.registry_snapshot().await[0].connection_state,
        ConnectionState::Ready
    );
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn ping_and_config_update_round_trip() {
    let t = start_fleet(test_config());
    let mut nodes = join_all(&t.fleet, &[("cam-a", 12_000)]).await;

    t.fleet.ping("cam-a").await.expect("ping");
    let ack = t
        .fleet
        .update_node_config("cam-a", Bytes::from_static(b"{\"gain\":3}"))
        .await
        .expect("config update");
    assert_eq!(ack.attempts, 1);
    assert_eq!(
        nodes[0]
            .next_event(|event| matches!(event, AgentEvent::ConfigApplied { .. }))
            .await,
        AgentEvent::ConfigApplied { bytes: 10 }
    );

    assert!(t.fleet.ping("cam-zz").await.is_err());
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn removed_node_is_forgotten() {
    let t = start_fleet(test_config());
    let mut nodes = join_all(&t.fleet, &[("cam-a", 0), ("cam-b", 0)]).await;

    let removed = t.fleet.remove_node("cam-a").await.expect("known node");
    assert_eq!(removed.node_id(), "cam-a");
    nodes[0]
        .next_event(|event| matches!(event, AgentEvent::Disconnected))
        .await;

    let remaining: Vec<String> = t
        .fleet
        .registry_snapshot()
        .await
        .iter()
        .map(|node| node.node_id().to_string())
        .collect();
    assert_eq!(remaining, vec!["cam-b"]);
}
