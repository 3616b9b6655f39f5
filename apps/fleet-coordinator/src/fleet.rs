//! Wires the components together and serves node connections.
//!
//! One task per connection runs the handshake, binds the link in the
//! [`Router`], starts the node's clock prober and then routes inbound frames:
//! probe replies to the prober, acks to the dispatcher, heartbeats and status
//! reports straight to the registry.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fleet_wire::{CommandBody, Envelope, Message, PROTOCOL_VERSION};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::clock::{LocalClock, ProbeReply, ProberConfig, spawn_prober};
use crate::config::CoordinatorConfig;
use crate::error::{ArmError, CommandError, ProtocolError, StopError};
use crate::events::{CoordinatorEvent, EventBus, LifecycleObserver, spawn_observer};
use crate::hooks::{
    AcceptAll, CapabilityNegotiator, JsonDirectoryPersistence, Negotiation, NoopPersistence,
    PersistenceHook, RequiredCapabilities,
};
use crate::metrics;
use crate::protocol::{CommandAck, CommandDispatcher, DispatchSettings};
use crate::registry::{FaultCause, NodeHandle, NodeIdentity, NodeRegistry, RegistrySettings, Transition};
use crate::session::{
    ArmReport, ArmRequest, SessionHandle, SessionOutcome, SessionSettings, SessionSnapshot,
    spawn_coordinator,
};
use crate::transport::{CloseOnDrop, Inbound, Link, Router, spawn_link};

const PROBE_REPLY_DEPTH: usize = 16;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// External collaborators plugged into the coordinator.
#[derive(Clone)]
pub struct Collaborators {
    pub negotiator: Arc<dyn CapabilityNegotiator>,
    pub persistence: Arc<dyn PersistenceHook>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            negotiator: Arc::new(AcceptAll),
            persistence: Arc::new(NoopPersistence),
        }
    }
}

impl Collaborators {
    /// Collaborators implied by `required_capabilities` and `persistence_dir`.
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        let mut collaborators = Self::default();
        if !config.required_capabilities.is_empty() {
            collaborators.negotiator = Arc::new(RequiredCapabilities::new(
                config.required_capabilities.iter().cloned(),
            ));
        }
        if let Some(dir) = &config.persistence_dir {
            collaborators.persistence = Arc::new(JsonDirectoryPersistence::new(dir.clone()));
        }
        collaborators
    }
}

/// Handle to a running coordinator.
#[derive(Clone)]
pub struct Fleet {
    inner: Arc<FleetInner>,
}

struct FleetInner {
    config: CoordinatorConfig,
    clock: LocalClock,
    events: EventBus,
    router: Router,
    registry: NodeRegistry,
    dispatcher: CommandDispatcher,
    sessions: SessionHandle,
    negotiator: Arc<dyn CapabilityNegotiator>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

enum HandshakeFailure {
    Protocol(ProtocolError),
    Rejected(String),
    Closed,
}

impl Fleet {
    /// Spawns the registry, dispatcher and session actors. Must be called
    /// from within a tokio runtime.
    pub fn start(config: CoordinatorConfig, collaborators: Collaborators) -> Self {
        let clock = LocalClock::new();
        let events = EventBus::new();
        let router = Router::new();
        let (registry, registry_task) =
            NodeRegistry::spawn(RegistrySettings::from(&config), clock, events.clone());
        let dispatch = DispatchSettings::from(&config);
        if config.arming_timeout >= dispatch.lifetime() {
            warn!(
                target = "fleet::server",
                arming_timeout_ms = config.arming_timeout.as_millis() as u64,
                command_lifetime_ms = dispatch.lifetime().as_millis() as u64,
                "arming outlives command retries; silent nodes surface as command timeouts"
            );
        }
        let (dispatcher, dispatcher_task) = CommandDispatcher::spawn(
            dispatch,
            router.clone(),
            registry.clone(),
            events.clone(),
            clock,
        );
        let (sessions, session_task) = spawn_coordinator(
            SessionSettings::from(&config),
            clock,
            registry.clone(),
            dispatcher.clone(),
            events.clone(),
            collaborators.persistence,
        );
        info!(
            target = "fleet::server",
            listen_addr = %config.listen_addr,
            heartbeat_timeout_ms = config.heartbeat_timeout.as_millis() as u64,
            "coordinator started"
        );
        Self {
            inner: Arc::new(FleetInner {
                config,
                clock,
                events,
                router,
                registry,
                dispatcher,
                sessions,
                negotiator: collaborators.negotiator,
                tasks: Mutex::new(vec![registry_task, dispatcher_task, session_task]),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> LocalClock {
        self.inner.clock
    }

    /// Serves one node connection over any byte stream.
    pub fn attach<S>(&self, stream: S, peer: impl Into<String>) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let inner = self.inner.clone();
        let peer = peer.into();
        tokio::spawn(async move { inner.serve_connection(stream, peer).await })
    }

    /// Accepts node connections until the coordinator shuts down.
    pub fn listen(&self, listener: TcpListener) {
        let fleet = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if let Err(err) = stream.set_nodelay(true) {
                            debug!(target = "fleet::server", peer = %addr, error = %err, "failed to set nodelay");
                        }
                        debug!(target = "fleet::server", peer = %addr, "node connection accepted");
                        fleet.attach(stream, addr.to_string());
                    }
                    Err(err) => {
                        warn!(target = "fleet::server", error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        });
        self.inner.tasks.lock().push(task);
    }

    pub async fn arm(&self, request: ArmRequest) -> Result<ArmReport, ArmError> {
        self.inner.sessions.arm(request).await
    }

    pub async fn stop(&self) -> Result<SessionOutcome, StopError> {
        self.inner.sessions.stop().await
    }

    pub async fn abort(&self) -> Result<SessionOutcome, StopError> {
        self.inner.sessions.abort().await
    }

    pub async fn session_status(&self) -> Option<SessionSnapshot> {
        self.inner.sessions.status().await
    }

    /// Every known node, ordered by id.
    pub async fn registry_snapshot(&self) -> Vec<NodeHandle> {
        self.inner.registry.current().await.handles()
    }

    /// Round trip of one acknowledged Ping.
    pub async fn ping(&self, node_id: &str) -> Result<Duration, CommandError> {
        let ticket = self.inner.dispatcher.issue(node_id, CommandBody::Ping).await?;
        Ok(ticket.result().await?.round_trip())
    }

    pub async fn update_node_config(&self, node_id: &str, payload: Bytes) -> Result<CommandAck, CommandError> {
        let ticket = self
            .inner
            .dispatcher
            .issue(node_id, CommandBody::ConfigUpdate { payload })
            .await?;
        ticket.result().await
    }

    /// Drops a node: its link is closed and its registry entry removed.
    pub async fn remove_node(&self, node_id: &str) -> Option<NodeHandle> {
        if let Some(link) = self.inner.router.link(node_id) {
            self.inner.router.unbind(node_id, link.id());
            link.close();
        }
        self.inner.registry.remove(node_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    /// Drives `observer` from the lifecycle event stream.
    pub fn observe(&self, observer: Arc<dyn LifecycleObserver>) -> JoinHandle<()> {
        spawn_observer(&self.inner.events, observer)
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.inner.registry
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.inner.dispatcher
    }

    /// Winds down any session, cancels outstanding commands and closes every
    /// node link.
    pub async fn shutdown(&self) {
        info!(target = "fleet::server", "coordinator shutting down");
        self.inner.sessions.shutdown().await;
        self.inner.dispatcher.shutdown().await;
        self.inner.router.close_all();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl FleetInner {
    async fn serve_connection<S>(self: Arc<Self>, stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (link, mut inbound) = spawn_link(stream, peer.clone(), self.config.write_timeout);
        let guard = CloseOnDrop(link.clone());

        let (node_id, capabilities) = match self.handshake(&link, &mut inbound).await {
            Ok(accepted) => accepted,
            Err(HandshakeFailure::Protocol(err)) => {
                metrics::PROTOCOL_ERRORS.with_label_values(&[err.reason()]).inc();
                warn!(target = "fleet::server", peer = %peer, error = %err, "handshake failed");
                let _ = link
                    .send(&Envelope::new(
                        "",
                        0,
                        Message::HandshakeAck {
                            accepted: false,
                            reason: Some(err.to_string()),
                        },
                    ))
                    .await;
                return;
            }
            Err(HandshakeFailure::Rejected(reason)) => {
                info!(target = "fleet::server", peer = %peer, reason = %reason, "node rejected");
                return;
            }
            Err(HandshakeFailure::Closed) => {
                debug!(target = "fleet::server", peer = %peer, "connection closed before handshake");
                return;
            }
        };

        if let Some(previous) = self.router.bind(&node_id, link.clone()) {
            info!(
                target = "fleet::server",
                node_id = %node_id,
                old_link = previous.id(),
                new_link = link.id(),
                "node reconnected; replacing link"
            );
            previous.close();
        }
        self.registry
            .register(NodeIdentity::new(node_id.clone(), capabilities), link.id())
            .await;

        let (probe_tx, probe_rx) = mpsc::channel(PROBE_REPLY_DEPTH);
        let prober = spawn_prober(
            node_id.clone(),
            link.clone(),
            self.clock,
            self.registry.clone(),
            probe_rx,
            ProberConfig::from(&self.config),
        );

        self.route_inbound(&node_id, &link, &mut inbound, probe_tx).await;

        prober.abort();
        self.router.unbind(&node_id, link.id());
        self.registry.mark_disconnected(&node_id, link.id()).await;
        info!(target = "fleet::server", node_id = %node_id, link_id = link.id(), "node link closed");
        drop(guard);
    }

    async fn handshake(
        &self,
        link: &Link,
        inbound: &mut Inbound,
    ) -> Result<(String, BTreeSet<String>), HandshakeFailure> {
        let first = match tokio::time::timeout(self.config.handshake_timeout, inbound.recv()).await {
            Err(_) => return Err(HandshakeFailure::Protocol(ProtocolError::HandshakeTimeout)),
            Ok(None) => return Err(HandshakeFailure::Closed),
            Ok(Some(Err(err))) => return Err(HandshakeFailure::Protocol(err)),
            Ok(Some(Ok(envelope))) => envelope,
        };
        let (protocol_version, declared) = match first.message {
            Message::Handshake {
                protocol_version,
                capabilities,
            } => (protocol_version, capabilities),
            other => {
                return Err(HandshakeFailure::Protocol(ProtocolError::ExpectedHandshake(
                    other.message_type().as_str(),
                )));
            }
        };
        if protocol_version != PROTOCOL_VERSION {
            return Err(HandshakeFailure::Protocol(ProtocolError::UnsupportedVersion(
                protocol_version,
            )));
        }
        let node_id = first.node_id;
        if node_id.is_empty() {
            return Err(HandshakeFailure::Protocol(ProtocolError::EmptyNodeId));
        }

        let (accepted, reason, capabilities) = match self.negotiator.negotiate(&node_id, &declared).await {
            Negotiation::Accept(capabilities) => (true, None, capabilities),
            Negotiation::Reject(reason) => (false, Some(reason), BTreeSet::new()),
        };
        let reply = Envelope::new(
            node_id.as_str(),
            first.id,
            Message::HandshakeAck {
                accepted,
                reason: reason.clone(),
            },
        );
        if link.send(&reply).await.is_err() {
            return Err(HandshakeFailure::Closed);
        }
        match reason {
            Some(reason) => Err(HandshakeFailure::Rejected(reason)),
            None => {
                info!(
                    target = "fleet::server",
                    node_id = %node_id,
                    peer = link.peer(),
                    capabilities = ?capabilities,
                    "node handshake complete"
                );
                Ok((node_id, capabilities))
            }
        }
    }

    async fn route_inbound(
        &self,
        node_id: &str,
        link: &Link,
        inbound: &mut Inbound,
        probes: mpsc::Sender<ProbeReply>,
    ) {
        while let Some(item) = inbound.recv().await {
            let envelope = match item {
                Ok(envelope) => envelope,
                Err(err) => {
                    self.protocol_error(node_id, link, err).await;
                    continue;
                }
            };
            if envelope.node_id != node_id {
                let err = ProtocolError::NodeMismatch {
                    bound: node_id.to_string(),
                    claimed: envelope.node_id,
                };
                self.protocol_error(node_id, link, err).await;
                continue;
            }
            match envelope.message {
                Message::ClockProbeReply { t0_us, t1_us, t2_us } => {
                    let reply = ProbeReply {
                        probe_id: envelope.id,
                        t0_us,
                        t1_us,
                        t2_us,
                        t3_us: self.clock.now_us(),
                    };
                    if probes.try_send(reply).is_err() {
                        trace!(target = "fleet::clock", node_id, probe_id = envelope.id, "probe reply dropped");
                    }
                }
                Message::CommandAck {
                    kind,
                    status,
                    final_local_us,
                } => {
                    self.dispatcher
                        .ack(node_id, envelope.id, kind, status, final_local_us, self.clock.now_us())
                        .await;
                }
                Message::Heartbeat { .. } => {
                    self.registry.mark_heartbeat(node_id, Instant::now()).await;
                }
                Message::StatusReport { payload } => {
                    self.registry.record_status(node_id, payload).await;
                }
                other => {
                    let err = ProtocolError::Unexpected {
                        node_id: node_id.to_string(),
                        message: other.message_type().as_str(),
                    };
                    self.protocol_error(node_id, link, err).await;
                }
            }
        }
    }

    async fn protocol_error(&self, node_id: &str, link: &Link, err: ProtocolError) {
        metrics::PROTOCOL_ERRORS.with_label_values(&[err.reason()]).inc();
        let count = self.registry.record_protocol_error(node_id).await;
        warn!(target = "fleet::server", node_id, error = %err, count, "dropped invalid frame");
        if count >= self.config.max_protocol_errors {
            warn!(target = "fleet::server", node_id, count, "too many protocol errors; dropping link");
            self.registry
                .update_state(node_id, Transition::Fault(FaultCause::ProtocolErrors))
                .await;
            link.close();
        }
    }
}
