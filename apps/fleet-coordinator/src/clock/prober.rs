use std::collections::HashMap;
use std::time::Duration;

use fleet_wire::{Envelope, Message};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::{ClockEstimator, ClockSample, LocalClock, SampleOutcome};
use crate::config::CoordinatorConfig;
use crate::error::TransportError;
use crate::metrics;
use crate::registry::NodeRegistry;
use crate::transport::Link;

#[derive(Debug, Clone, Copy)]
pub struct ProberConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub window_size: usize,
    pub reset_threshold: Duration,
}

impl From<&CoordinatorConfig> for ProberConfig {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            interval: config.probe_interval,
            timeout: config.probe_timeout,
            window_size: config.probe_window_size,
            reset_threshold: config.clock_reset_threshold,
        }
    }
}

/// A probe reply stamped with its coordinator receive time (`t3_us`).
#[derive(Debug, Clone, Copy)]
pub struct ProbeReply {
    pub probe_id: u64,
    pub t0_us: i64,
    pub t1_us: i64,
    pub t2_us: i64,
    pub t3_us: i64,
}

struct Outstanding {
    t0_us: i64,
    sent_at: Instant,
}

/// Probes one node until its link closes or `replies` is dropped.
pub fn spawn_prober(
    node_id: String,
    link: Link,
    clock: LocalClock,
    registry: NodeRegistry,
    mut replies: mpsc::Receiver<ProbeReply>,
    config: ProberConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut estimator = ClockEstimator::new(config.window_size, config.reset_threshold);
        let mut outstanding: HashMap<u64, Outstanding> = HashMap::new();
        let mut next_probe_id: u64 = 1;
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    outstanding.retain(|probe_id, probe| {
                        let alive = now.saturating_duration_since(probe.sent_at) <= config.timeout;
                        if !alive {
                            trace!(target = "fleet::clock", node_id = %node_id, probe_id, "probe expired");
                            metrics::CLOCK_SAMPLES.with_label_values(&["lost"]).inc();
                        }
                        alive
                    });

                    let probe_id = next_probe_id;
                    next_probe_id += 1;
                    let t0_us = clock.micros_at(now);
                    let probe = Envelope::new(node_id.as_str(), probe_id, Message::ClockProbe { t0_us });
                    match link.send(&probe).await {
                        Ok(()) => {
                            outstanding.insert(probe_id, Outstanding { t0_us, sent_at: now });
                        }
                        Err(TransportError::Timeout) => {
                            metrics::CLOCK_SAMPLES.with_label_values(&["lost"]).inc();
                        }
                        Err(err) => {
                            debug!(target = "fleet::clock", node_id = %node_id, error = %err, "probe send failed; prober exiting");
                            break;
                        }
                    }
                }
                reply = replies.recv() => {
                    let Some(reply) = reply else { break };
                    let Some(probe) = outstanding.remove(&reply.probe_id) else {
                        trace!(target = "fleet::clock", node_id = %node_id, probe_id = reply.probe_id, "unmatched probe reply");
                        metrics::CLOCK_SAMPLES.with_label_values(&["unmatched"]).inc();
                        continue;
                    };
                    if probe.t0_us != reply.t0_us {
                        metrics::CLOCK_SAMPLES.with_label_values(&["unmatched"]).inc();
                        continue;
                    }
                    if Instant::now().saturating_duration_since(probe.sent_at) > config.timeout {
                        metrics::CLOCK_SAMPLES.with_label_values(&["late"]).inc();
                        continue;
                    }
                    let sample = ClockSample {
                        t0_us: reply.t0_us,
                        t1_us: reply.t1_us,
                        t2_us: reply.t2_us,
                        t3_us: reply.t3_us,
                    };
                    match estimator.observe(sample) {
                        SampleOutcome::Accepted(estimate) => {
                            metrics::CLOCK_SAMPLES.with_label_values(&["accepted"]).inc();
                            registry.update_clock(&node_id, estimate).await;
                        }
                        SampleOutcome::Reset(estimate) => {
                            warn!(
                                target = "fleet::clock",
                                node_id = %node_id,
                                offset_us = estimate.offset_us,
                                "clock step detected; estimation restarted"
                            );
                            metrics::CLOCK_RESETS.inc();
                            metrics::CLOCK_SAMPLES.with_label_values(&["reset"]).inc();
                            registry.update_clock(&node_id, estimate).await;
                        }
                        SampleOutcome::Rejected(reason) => {
                            debug!(target = "fleet::clock", node_id = %node_id, ?reason, "sample rejected");
                            metrics::CLOCK_SAMPLES.with_label_values(&[reason.as_str()]).inc();
                        }
                    }
                }
            }
        }
        debug!(target = "fleet::clock", node_id = %node_id, "prober stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::registry::{ConnectionState, NodeIdentity, RegistrySettings};
    use crate::transport::{memory_pipe, spawn_link};

    const NODE_OFFSET_US: i64 = 40_000;

    #[test_timeout::tokio_timeout_test(20, paused)]
    async fn answered_probes_make_node_ready() {
        let clock = LocalClock::new();
        let settings = RegistrySettings {
            heartbeat_timeout: Duration::from_secs(30),
            clock_staleness: Duration::from_secs(10),
            sweep_interval: Duration::from_millis(250),
            removal_grace: Duration::from_secs(60),
        };
        let (registry, _task) = NodeRegistry::spawn(settings, clock, EventBus::new());

        let (ours, theirs) = memory_pipe();
        let (link, _inbound) = spawn_link(ours, "node", Duration::from_secs(1));
        let (node_link, mut node_inbound) = spawn_link(theirs, "coordinator", Duration::from_secs(1));
        registry
            .register(NodeIdentity::new("cam-1", Vec::new()), link.id())
            .await
            .expect("registered");

        let (reply_tx, reply_rx) = mpsc::channel(8);
        let config = ProberConfig {
            interval: Duration::from_millis(500),
            timeout: Duration::from_millis(200),
            window_size: 8,
            reset_threshold: Duration::from_millis(50),
        };
        let _prober = spawn_prober("cam-1".into(), link, clock, registry.clone(), reply_rx, config);

        // Answer probes as a node running NODE_OFFSET_US ahead, with a
        // symmetric 1ms path in each direction.
        for _ in 0..3 {
            let envelope = node_inbound.recv().await.expect("open").expect("decoded");
            let Message::ClockProbe { t0_us } = envelope.message else {
                panic!("expected probe, got {:?}", envelope.message);
            };
            tokio::time::sleep(Duration::from_millis(1)).await;
            let t1_us = clock.now_us() + NODE_OFFSET_US;
            tokio::time::sleep(Duration::from_millis(1)).await;
            let t3_us = clock.now_us();
            reply_tx
                .send(ProbeReply {
                    probe_id: envelope.id,
                    t0_us,
                    t1_us,
                    t2_us: t1_us,
                    t3_us,
                })
                .await
                .expect("prober alive");
        }
        drop(node_link);

        let node = loop {
            let snapshot = registry.current().await;
            match snapshot.get("cam-1") {
                Some(node) if node.clock.is_some_and(|c| c.samples == 3) => break node.clone(),
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };
        assert_eq!(node.connection_state, ConnectionState::Ready);
        let estimate = node.clock.expect("estimate");
        assert_eq!(estimate.offset_us, NODE_OFFSET_US);
        assert_eq!(estimate.round_trip_us, 2_000);
    }
}
