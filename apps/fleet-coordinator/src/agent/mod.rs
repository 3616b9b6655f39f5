//! Node-side agent speaking the coordinator protocol.
//!
//! The agent answers clock probes from a [`SimulatedClock`], sends
//! heartbeats, and executes commands against an in-memory recorder. A
//! [`FaultPlan`] can be swapped in at any time to withhold acks, reject
//! commands or go quiet, which is how the integration tests script node
//! failures.

mod clock;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use fleet_wire::{AckStatus, CommandBody, CommandKind, Envelope, Message, PROTOCOL_VERSION};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ProtocolError, TransportError};
use crate::transport::{CloseOnDrop, Inbound, Link, spawn_link};

pub use clock::SimulatedClock;

/// Acks remembered for re-acknowledging retried commands.
const ACK_CACHE: usize = 64;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_id: String,
    pub capabilities: BTreeSet<String>,
    pub heartbeat_interval: Duration,
    /// Periodic status report; `None` disables it.
    pub status_interval: Option<Duration>,
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
}

impl AgentConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            capabilities: BTreeSet::new(),
            heartbeat_interval: Duration::from_secs(1),
            status_interval: None,
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }
}

/// Scripted misbehaviour.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Commands of these kinds are received but never acknowledged.
    pub withhold_acks: BTreeSet<CommandKind>,
    /// Commands of these kinds are refused with the given reason.
    pub reject: BTreeMap<CommandKind, String>,
    pub mute_heartbeats: bool,
    pub mute_probes: bool,
}

impl FaultPlan {
    pub fn withhold(kind: CommandKind) -> Self {
        Self {
            withhold_acks: BTreeSet::from([kind]),
            ..Self::default()
        }
    }

    pub fn silent() -> Self {
        Self {
            withhold_acks: CommandKind::ALL.into_iter().collect(),
            mute_heartbeats: true,
            mute_probes: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    CommandReceived {
        kind: CommandKind,
        command_id: u64,
        duplicate: bool,
        withheld: bool,
    },
    Armed {
        session_id: Uuid,
    },
    /// `local_start_us` is the node-clock instant capture begins.
    Started {
        session_id: Uuid,
        local_start_us: i64,
    },
    Stopped {
        session_id: Uuid,
        final_local_us: i64,
    },
    ConfigApplied {
        bytes: usize,
    },
    Disconnected,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("coordinator rejected the node: {0}")]
    Rejected(String),
    #[error("no handshake ack before the deadline")]
    HandshakeTimeout,
    #[error("connection closed during handshake")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Capture {
    pub session_id: Uuid,
    pub local_start_us: i64,
}

#[derive(Debug, Default, Serialize)]
struct Recorder {
    armed: Option<Uuid>,
    capture: Option<Capture>,
    config_bytes: usize,
}

/// Handle to a connected agent. Dropping it closes the connection.
pub struct AgentHandle {
    node_id: String,
    link: CloseOnDrop,
    faults: watch::Sender<FaultPlan>,
    clock: Arc<Mutex<SimulatedClock>>,
    task: JoinHandle<()>,
}

impl AgentHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn set_faults(&self, plan: FaultPlan) {
        self.faults.send_replace(plan);
    }

    pub fn update_faults(&self, update: impl FnOnce(&mut FaultPlan)) {
        self.faults.send_modify(update);
    }

    pub fn step_clock(&self, delta_us: i64) {
        self.clock.lock().step(delta_us);
    }

    pub fn now_us(&self) -> i64 {
        self.clock.lock().now_us()
    }

    /// Drops the connection without any goodbye, as a crashed node would.
    pub fn disconnect(&self) {
        self.link.0.close();
    }

    pub fn is_connected(&self) -> bool {
        !self.link.0.is_closed()
    }

    /// Waits for the agent loop to end.
    pub async fn closed(self) {
        let AgentHandle { link, task, .. } = self;
        let _ = task.await;
        drop(link);
    }
}

/// Handshakes over `stream` and spawns the agent loop.
pub async fn connect<S>(
    stream: S,
    config: AgentConfig,
    clock: SimulatedClock,
) -> Result<(AgentHandle, mpsc::UnboundedReceiver<AgentEvent>), AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (link, mut inbound) = spawn_link(stream, "coordinator", config.write_timeout);
    let guard = CloseOnDrop(link.clone());

    let hello = Envelope::new(
        config.node_id.as_str(),
        0,
        Message::Handshake {
            protocol_version: PROTOCOL_VERSION,
            capabilities: config.capabilities.clone(),
        },
    );
    link.send(&hello).await?;
    let reply = match tokio::time::timeout(config.handshake_timeout, inbound.recv()).await {
        Err(_) => return Err(AgentError::HandshakeTimeout),
        Ok(None) => return Err(AgentError::Closed),
        Ok(Some(reply)) => reply?,
    };
    match reply.message {
        Message::HandshakeAck { accepted: true, .. } => {}
        Message::HandshakeAck { accepted: false, reason } => {
            return Err(AgentError::Rejected(reason.unwrap_or_default()));
        }
        other => {
            return Err(AgentError::Protocol(ProtocolError::Unexpected {
                node_id: config.node_id.clone(),
                message: other.message_type().as_str(),
            }));
        }
    }
    info!(target = "fleet::agent", node_id = %config.node_id, "connected to coordinator");

    let (faults, faults_rx) = watch::channel(FaultPlan::default());
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let clock = Arc::new(Mutex::new(clock));
    let agent = Agent {
        node_id: config.node_id.clone(),
        link: link.clone(),
        clock: clock.clone(),
        faults: faults_rx,
        events: events_tx,
        recorder: Recorder::default(),
        acks: VecDeque::with_capacity(ACK_CACHE),
        sequence: 0,
    };
    let task = tokio::spawn(agent.run(inbound, config.heartbeat_interval, config.status_interval));
    Ok((
        AgentHandle {
            node_id: config.node_id,
            link: guard,
            faults,
            clock,
            task,
        },
        events_rx,
    ))
}

struct Agent {
    node_id: String,
    link: Link,
    clock: Arc<Mutex<SimulatedClock>>,
    faults: watch::Receiver<FaultPlan>,
    events: mpsc::UnboundedSender<AgentEvent>,
    recorder: Recorder,
    /// Recently sent acks keyed by command id.
    acks: VecDeque<(u64, Message)>,
    sequence: u64,
}

impl Agent {
    async fn run(mut self, mut inbound: Inbound, heartbeat_interval: Duration, status_interval: Option<Duration>) {
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut status = tokio::time::interval(status_interval.unwrap_or(Duration::from_secs(3600)));
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                item = inbound.recv() => match item {
                    Some(Ok(envelope)) => self.handle(envelope).await,
                    Some(Err(err)) => warn!(target = "fleet::agent", node_id = %self.node_id, error = %err, "bad frame from coordinator"),
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if !self.faults.borrow().mute_heartbeats {
                        let node_time_us = self.now_us();
                        self.send_next(Message::Heartbeat { node_time_us }).await;
                    }
                }
                _ = status.tick(), if status_interval.is_some() => {
                    match serde_json::to_vec(&self.recorder) {
                        Ok(payload) => self.send_next(Message::StatusReport { payload: payload.into() }).await,
                        Err(err) => debug!(target = "fleet::agent", error = %err, "failed to encode status"),
                    }
                }
            }
        }
        info!(target = "fleet::agent", node_id = %self.node_id, "disconnected from coordinator");
        let _ = self.events.send(AgentEvent::Disconnected);
    }

    fn now_us(&self) -> i64 {
        self.clock.lock().now_us()
    }

    async fn send_next(&mut self, message: Message) {
        self.sequence += 1;
        self.send(self.sequence, message).await;
    }

    async fn send(&self, id: u64, message: Message) {
        let envelope = Envelope::new(self.node_id.as_str(), id, message);
        if let Err(err) = self.link.send(&envelope).await {
            debug!(target = "fleet::agent", node_id = %self.node_id, error = %err, "send failed");
        }
    }

    async fn handle(&mut self, envelope: Envelope) {
        match envelope.message {
            Message::ClockProbe { t0_us } => {
                if self.faults.borrow().mute_probes {
                    return;
                }
                let t1_us = self.now_us();
                let t2_us = self.now_us();
                self.send(envelope.id, Message::ClockProbeReply { t0_us, t1_us, t2_us })
                    .await;
            }
            Message::Command { body, .. } => self.command(envelope.id, body).await,
            other => {
                debug!(
                    target = "fleet::agent",
                    node_id = %self.node_id,
                    message = other.message_type().as_str(),
                    "ignoring unexpected message"
                );
            }
        }
    }

    async fn command(&mut self, command_id: u64, body: CommandBody) {
        let kind = body.kind();
        let (withheld, rejection) = {
            let plan = self.faults.borrow();
            (plan.withhold_acks.contains(&kind), plan.reject.get(&kind).cloned())
        };
        let cached = self
            .acks
            .iter()
            .find(|(id, _)| *id == command_id)
            .map(|(_, ack)| ack.clone());
        let _ = self.events.send(AgentEvent::CommandReceived {
            kind,
            command_id,
            duplicate: cached.is_some(),
            withheld,
        });
        if withheld {
            debug!(target = "fleet::agent", node_id = %self.node_id, command_id, kind = kind.as_str(), "withholding ack");
            return;
        }
        if let Some(ack) = cached {
            self.send(command_id, ack).await;
            return;
        }

        let (status, final_local_us) = match rejection {
            Some(reason) => (AckStatus::Rejected(reason), None),
            None => self.apply(body),
        };
        let ack = Message::CommandAck {
            kind,
            status,
            final_local_us,
        };
        if self.acks.len() == ACK_CACHE {
            self.acks.pop_front();
        }
        self.acks.push_back((command_id, ack.clone()));
        self.send(command_id, ack).await;
    }

    fn apply(&mut self, body: CommandBody) -> (AckStatus, Option<i64>) {
        match body {
            CommandBody::Arm { session_id } => {
                if let Some(capture) = self.recorder.capture {
                    return (
                        AckStatus::Rejected(format!("still recording session {}", capture.session_id)),
                        None,
                    );
                }
                self.recorder.armed = Some(session_id);
                let _ = self.events.send(AgentEvent::Armed { session_id });
                (AckStatus::Accepted, None)
            }
            CommandBody::Start {
                session_id,
                start_at_us,
                node_offset_us,
            } => {
                if self.recorder.armed != Some(session_id) {
                    return (AckStatus::Rejected(format!("not armed for session {session_id}")), None);
                }
                let local_start_us = start_at_us + node_offset_us;
                self.recorder.capture = Some(Capture {
                    session_id,
                    local_start_us,
                });
                info!(target = "fleet::agent", node_id = %self.node_id, %session_id, local_start_us, "capture scheduled");
                let _ = self.events.send(AgentEvent::Started {
                    session_id,
                    local_start_us,
                });
                (AckStatus::Accepted, None)
            }
            CommandBody::Stop { session_id } => {
                let final_local_us = self.now_us();
                if self.recorder.armed == Some(session_id) {
                    self.recorder.armed = None;
                }
                if self.recorder.capture.is_some_and(|c| c.session_id == session_id) {
                    self.recorder.capture = None;
                }
                let _ = self.events.send(AgentEvent::Stopped {
                    session_id,
                    final_local_us,
                });
                (AckStatus::Accepted, Some(final_local_us))
            }
            CommandBody::ConfigUpdate { payload } => {
                self.recorder.config_bytes = payload.len();
                let _ = self.events.send(AgentEvent::ConfigApplied { bytes: payload.len() });
                (AckStatus::Accepted, None)
            }
            CommandBody::Ping => (AckStatus::Accepted, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::LocalClock;
    use crate::transport::memory_pipe;

    struct Peer {
        link: Link,
        inbound: Inbound,
    }

    impl Peer {
        async fn expect(&mut self) -> Envelope {
            self.inbound.recv().await.expect("open").expect("decoded")
        }

        async fn command(&self, id: u64, body: CommandBody) {
            let envelope = Envelope::new(
                "coordinator",
                id,
                Message::Command {
                    deadline_ms: 500,
                    body,
                },
            );
            self.link.send(&envelope).await.expect("send");
        }
    }

    async fn connected(clock: SimulatedClock) -> (AgentHandle, mpsc::UnboundedReceiver<AgentEvent>, Peer) {
        let (ours, theirs) = memory_pipe();
        let (link, mut inbound) = spawn_link(theirs, "agent", Duration::from_secs(1));
        let accept = tokio::spawn(async move {
            let hello = inbound.recv().await.expect("open").expect("decoded");
            assert!(matches!(hello.message, Message::Handshake { protocol_version: PROTOCOL_VERSION, .. }));
            link.send(&Envelope::new(
                hello.node_id,
                hello.id,
                Message::HandshakeAck {
                    accepted: true,
                    reason: None,
                },
            ))
            .await
            .expect("ack");
            Peer { link, inbound }
        });
        let config = AgentConfig {
            heartbeat_interval: Duration::from_secs(3600),
            ..AgentConfig::new("cam-1")
        };
        let (handle, events) = connect(ours, config, clock).await.expect("connect");
        let mut peer = accept.await.expect("peer");
        // The first heartbeat tick fires immediately.
        assert!(matches!(peer.expect().await.message, Message::Heartbeat { .. }));
        (handle, events, peer)
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn probe_replies_read_the_simulated_clock() {
        let base = LocalClock::new();
        let (_handle, _events, mut peer) = connected(SimulatedClock::new(base, 25_000, 0.0)).await;
        let t0_us = base.now_us();
        peer.link
            .send(&Envelope::new("coordinator", 7, Message::ClockProbe { t0_us }))
            .await
            .expect("probe");
        let reply = peer.expect().await;
        assert_eq!(reply.id, 7);
        match reply.message {
            Message::ClockProbeReply { t0_us: echoed, t1_us, .. } => {
                assert_eq!(echoed, t0_us);
                assert_eq!(t1_us - base.now_us(), 25_000);
            }
            other => panic!("expected probe reply, got {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn retried_command_is_acked_once_and_replayed() {
        let base = LocalClock::new();
        let (_handle, mut events, mut peer) = connected(SimulatedClock::exact(base)).await;
        let session_id = Uuid::new_v4();

        for _ in 0..2 {
            peer.command(3, CommandBody::Arm { session_id }).await;
            let ack = peer.expect().await;
            assert_eq!(ack.id, 3);
            assert!(matches!(
                ack.message,
                Message::CommandAck {
                    kind: CommandKind::Arm,
                    status: AckStatus::Accepted,
                    ..
                }
            ));
        }

        let mut armed = 0;
        let mut duplicates = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                AgentEvent::Armed { .. } => armed += 1,
                AgentEvent::CommandReceived { duplicate: true, .. } => duplicates += 1,
                _ => {}
            }
        }
        assert_eq!((armed, duplicates), (1, 1));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn start_without_arm_is_rejected_and_stop_reports_final_time() {
        let base = LocalClock::new();
        let (_handle, _events, mut peer) = connected(SimulatedClock::new(base, 1_000, 0.0)).await;
        let session_id = Uuid::new_v4();

        peer.command(
            1,
            CommandBody::Start {
                session_id,
                start_at_us: 0,
                node_offset_us: 0,
            },
        )
        .await;
        assert!(matches!(
            peer.expect().await.message,
            Message::CommandAck {
                status: AckStatus::Rejected(_),
                ..
            }
        ));

        peer.command(2, CommandBody::Arm { session_id }).await;
        peer.expect().await;
        peer.command(
            3,
            CommandBody::Start {
                session_id,
                start_at_us: 500_000,
                node_offset_us: 1_000,
            },
        )
        .await;
        peer.expect().await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        peer.command(4, CommandBody::Stop { session_id }).await;
        match peer.expect().await.message {
            Message::CommandAck {
                kind: CommandKind::Stop,
                status: AckStatus::Accepted,
                final_local_us: Some(final_local_us),
            } => assert_eq!(final_local_us, base.now_us() + 1_000),
            other => panic!("expected stop ack, got {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn fault_plan_withholds_and_rejects() {
        let base = LocalClock::new();
        let (handle, _events, mut peer) = connected(SimulatedClock::exact(base)).await;
        let session_id = Uuid::new_v4();

        handle.set_faults(FaultPlan {
            reject: BTreeMap::from([(CommandKind::Arm, "disk full".to_string())]),
            ..FaultPlan::withhold(CommandKind::Ping)
        });
        peer.command(1, CommandBody::Ping).await;
        peer.command(2, CommandBody::Arm { session_id }).await;
        match peer.expect().await {
            Envelope {
                id: 2,
                message: Message::CommandAck {
                    status: AckStatus::Rejected(reason),
                    ..
                },
                ..
            } => assert_eq!(reason, "disk full"),
            other => panic!("expected rejected arm, got {other:?}"),
        }

        // Once the fault clears, the retried Ping is answered.
        handle.set_faults(FaultPlan::default());
        peer.command(1, CommandBody::Ping).await;
        assert_eq!(peer.expect().await.id, 1);
    }
}
