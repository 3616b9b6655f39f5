use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use fleet_wire::{CommandBody, CommandKind};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    AckState, ArmReport, ArmRequest, Session, SessionOutcome, SessionSnapshot, SessionState,
    StopCause, StopRecord,
};
use crate::clock::LocalClock;
use crate::config::CoordinatorConfig;
use crate::error::{ArmError, FailureReason, NodeFailure, StopError};
use crate::events::{CoordinatorEvent, EventBus};
use crate::hooks::PersistenceHook;
use crate::metrics;
use crate::protocol::{CommandDispatcher, CommandResolution};
use crate::registry::{ConnectionState, NodeRegistry, Transition};

const REQUEST_DEPTH: usize = 64;
const IDLE_WAKE: Duration = Duration::from_secs(3600);
/// Slack for float rounding when comparing node fractions.
const FRACTION_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub arming_timeout: Duration,
    pub stop_timeout: Duration,
    pub start_lead_time: Duration,
    pub min_quorum_fraction: Option<f64>,
    pub min_live_fraction: Option<f64>,
}

impl From<&CoordinatorConfig> for SessionSettings {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            arming_timeout: config.arming_timeout,
            stop_timeout: config.stop_timeout,
            start_lead_time: config.start_lead_time,
            min_quorum_fraction: config.min_quorum_fraction,
            min_live_fraction: config.min_live_fraction,
        }
    }
}

/// Smallest node count meeting `fraction` of `total`, never below one.
fn required_nodes(fraction: f64, total: usize) -> usize {
    ((fraction * total as f64) - FRACTION_EPSILON).ceil().max(1.0) as usize
}

enum SessionRequest {
    Arm {
        request: ArmRequest,
        reply: oneshot::Sender<Result<ArmReport, ArmError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<SessionOutcome, StopError>>,
    },
    Abort {
        reply: oneshot::Sender<Result<SessionOutcome, StopError>>,
    },
    Status {
        reply: oneshot::Sender<Option<SessionSnapshot>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the session coordinator actor.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionRequest>,
}

impl SessionHandle {
    /// Arms the requested nodes and, once every participant acknowledges,
    /// schedules a common start. Resolves when recording has been scheduled
    /// or the session aborted.
    pub async fn arm(&self, request: ArmRequest) -> Result<ArmReport, ArmError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionRequest::Arm { request, reply })
            .await
            .map_err(|_| ArmError::CoordinatorClosed)?;
        rx.await.unwrap_or(Err(ArmError::CoordinatorClosed))
    }

    /// Stops the active session and resolves with its outcome once every
    /// live participant acknowledged or the stop timeout elapsed.
    pub async fn stop(&self) -> Result<SessionOutcome, StopError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionRequest::Stop { reply })
            .await
            .map_err(|_| StopError::CoordinatorClosed)?;
        rx.await.unwrap_or(Err(StopError::CoordinatorClosed))
    }

    /// Ends the active session immediately without waiting for stop acks.
    pub async fn abort(&self) -> Result<SessionOutcome, StopError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionRequest::Abort { reply })
            .await
            .map_err(|_| StopError::CoordinatorClosed)?;
        rx.await.unwrap_or(Err(StopError::CoordinatorClosed))
    }

    /// The active session, or the most recent finished one.
    pub async fn status(&self) -> Option<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(SessionRequest::Status { reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    /// Winds down any active session, then stops the actor.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(SessionRequest::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

pub fn spawn_coordinator(
    settings: SessionSettings,
    clock: LocalClock,
    registry: NodeRegistry,
    dispatcher: CommandDispatcher,
    events: EventBus,
    persistence: Arc<dyn PersistenceHook>,
) -> (SessionHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(REQUEST_DEPTH);
    let node_events = events.subscribe();
    let coordinator = SessionCoordinator {
        settings,
        clock,
        registry,
        dispatcher,
        events,
        persistence,
        active: None,
        last: None,
        shutdown: None,
    };
    (SessionHandle { tx }, tokio::spawn(coordinator.run(rx, node_events)))
}

struct Active {
    session: Session,
    waiters: FuturesUnordered<BoxFuture<'static, CommandResolution>>,
    /// Arming or stop timeout, depending on the state.
    phase_deadline: Option<Instant>,
    record_until: Option<Instant>,
    arm_reply: Option<oneshot::Sender<Result<ArmReport, ArmError>>>,
    stop_replies: Vec<oneshot::Sender<Result<SessionOutcome, StopError>>>,
}

impl Active {
    fn next_deadline(&self) -> Option<Instant> {
        match (self.phase_deadline, self.record_until) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

struct SessionCoordinator {
    settings: SessionSettings,
    clock: LocalClock,
    registry: NodeRegistry,
    dispatcher: CommandDispatcher,
    events: EventBus,
    persistence: Arc<dyn PersistenceHook>,
    active: Option<Active>,
    last: Option<Session>,
    shutdown: Option<oneshot::Sender<()>>,
}

async fn next_resolution(active: &mut Option<Active>) -> Option<CommandResolution> {
    match active {
        Some(active) if !active.waiters.is_empty() => active.waiters.next().await,
        _ => std::future::pending().await,
    }
}

impl SessionCoordinator {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<SessionRequest>,
        mut node_events: broadcast::Receiver<CoordinatorEvent>,
    ) {
        let mut events_open = true;
        loop {
            let deadline = self.active.as_ref().and_then(Active::next_deadline);
            let wake = deadline.unwrap_or_else(|| Instant::now() + IDLE_WAKE);
            tokio::select! {
                request = rx.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                event = node_events.recv(), if events_open => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target = "fleet::session", skipped, "node events lagged; reconciling against registry");
                        self.reconcile().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => events_open = false,
                },
                Some(resolution) = next_resolution(&mut self.active) => {
                    self.handle_resolution(resolution).await;
                }
                _ = tokio::time::sleep_until(wake), if deadline.is_some() => {
                    self.handle_deadline(Instant::now()).await;
                }
            }

            if self.active.is_none() {
                if let Some(reply) = self.shutdown.take() {
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!(target = "fleet::session", "session coordinator stopped");
    }

    async fn handle_request(&mut self, request: SessionRequest) {
        match request {
            SessionRequest::Arm { request, reply } => self.arm(request, reply).await,
            SessionRequest::Stop { reply } => {
                let Some(active) = self.active.as_mut() else {
                    let _ = reply.send(Err(StopError::NoActiveSession));
                    return;
                };
                active.stop_replies.push(reply);
                match active.session.state {
                    SessionState::Arming => self.abort(StopCause::Requested, Vec::new()).await,
                    SessionState::Recording => self.begin_stopping(StopCause::Requested).await,
                    _ => {}
                }
            }
            SessionRequest::Abort { reply } => {
                let Some(active) = self.active.as_mut() else {
                    let _ = reply.send(Err(StopError::NoActiveSession));
                    return;
                };
                active.stop_replies.push(reply);
                self.abort(StopCause::AbortRequested, Vec::new()).await;
            }
            SessionRequest::Status { reply } => {
                let snapshot = self
                    .active
                    .as_ref()
                    .map(|active| active.session.clone())
                    .or_else(|| self.last.clone());
                let _ = reply.send(snapshot);
            }
            SessionRequest::Shutdown { reply } => {
                self.shutdown = Some(reply);
                let state = self.active.as_ref().map(|active| active.session.state);
                match state {
                    Some(SessionState::Arming) => self.abort(StopCause::Shutdown, Vec::new()).await,
                    Some(SessionState::Recording) => self.begin_stopping(StopCause::Shutdown).await,
                    _ => {}
                }
            }
        }
    }

    async fn arm(&mut self, request: ArmRequest, reply: oneshot::Sender<Result<ArmReport, ArmError>>) {
        if let Some(active) = &self.active {
            let _ = reply.send(Err(ArmError::SessionActive {
                session_id: active.session.session_id,
            }));
            return;
        }
        if self.shutdown.is_some() {
            let _ = reply.send(Err(ArmError::CoordinatorClosed));
            return;
        }

        let mut requested: Vec<String> = Vec::with_capacity(request.nodes.len());
        for node in request.nodes {
            if !requested.contains(&node) {
                requested.push(node);
            }
        }
        if requested.is_empty() {
            let _ = reply.send(Err(ArmError::EmptyRequest));
            return;
        }

        let snapshot = self.registry.current().await;
        let mut eligible = BTreeSet::new();
        let mut rejected = Vec::new();
        for node_id in &requested {
            let reason = match snapshot.get(node_id) {
                None => Some(FailureReason::NotConnected),
                Some(handle) => match handle.connection_state {
                    ConnectionState::Disconnected => Some(FailureReason::NotConnected),
                    ConnectionState::Ready if handle.clock_estimate().is_err() => {
                        Some(FailureReason::ClockUnavailable)
                    }
                    ConnectionState::Ready => None,
                    state => Some(FailureReason::NotReady { state }),
                },
            };
            match reason {
                Some(reason) => {
                    info!(target = "fleet::session", node_id = %node_id, ?reason, "node excluded from session");
                    rejected.push(NodeFailure::new(node_id.clone(), reason));
                }
                None => {
                    eligible.insert(node_id.clone());
                }
            }
        }

        if let Some(fraction) = self.settings.min_quorum_fraction {
            let required = required_nodes(fraction, requested.len());
            if eligible.len() < required {
                warn!(
                    target = "fleet::session",
                    requested = requested.len(),
                    eligible = eligible.len(),
                    required,
                    "quorum not met"
                );
                let _ = reply.send(Err(ArmError::QuorumNotMet {
                    requested: requested.len(),
                    eligible: eligible.len(),
                    required,
                    rejected,
                }));
                return;
            }
        }
        if eligible.is_empty() {
            let _ = reply.send(Err(ArmError::NoEligibleNodes { rejected }));
            return;
        }

        let session_id = Uuid::new_v4();
        let session = Session::new(
            session_id,
            eligible.clone(),
            rejected,
            self.clock.now_us(),
            request.duration,
        );
        self.active = Some(Active {
            session,
            waiters: FuturesUnordered::new(),
            phase_deadline: Some(Instant::now() + self.settings.arming_timeout),
            record_until: None,
            arm_reply: Some(reply),
            stop_replies: Vec::new(),
        });
        self.set_state(
            SessionState::Arming,
            format!("arming {} of {} requested nodes", eligible.len(), requested.len()),
        );

        let mut failures = Vec::new();
        for node_id in &eligible {
            match self.dispatcher.issue(node_id, CommandBody::Arm { session_id }).await {
                Ok(ticket) => self.track(ticket.wait().boxed()),
                Err(err) => failures.push(NodeFailure::new(node_id.clone(), FailureReason::from(&err))),
            }
        }
        if !failures.is_empty() {
            self.abort(StopCause::ArmingFailed, failures).await;
        }
    }

    fn track(&mut self, waiter: BoxFuture<'static, CommandResolution>) {
        if let Some(active) = self.active.as_mut() {
            active.waiters.push(waiter);
        }
    }

    async fn handle_resolution(&mut self, resolution: CommandResolution) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let state = active.session.state;
        let now_us = self.clock.now_us();
        let CommandResolution {
            node_id,
            kind,
            command_id,
            result,
        } = resolution;

        match (kind, result, state) {
            (CommandKind::Arm, Ok(_), SessionState::Arming) => {
                active.session.record_armed(&node_id, now_us);
                debug!(target = "fleet::session", node_id = %node_id, command_id, "node armed");
                if active.session.awaiting(AckState::Armed).is_empty() {
                    self.begin_recording().await;
                }
            }
            (CommandKind::Arm, Err(err), SessionState::Arming) => {
                warn!(target = "fleet::session", node_id = %node_id, error = %err, "arm failed");
                let failure = NodeFailure::new(node_id, FailureReason::from(&err));
                self.abort(StopCause::ArmingFailed, vec![failure]).await;
            }
            (CommandKind::Start, Ok(_), _) => {
                if active.session.record_started(&node_id, now_us) {
                    self.registry
                        .update_state(&node_id, Transition::RecordingStarted)
                        .await;
                }
            }
            (CommandKind::Start, Err(err), SessionState::Recording | SessionState::Stopping) => {
                warn!(target = "fleet::session", node_id = %node_id, error = %err, "start not acknowledged");
                self.node_lost(&node_id, FailureReason::from(&err)).await;
            }
            (CommandKind::Stop, Ok(ack), SessionState::Stopping) => {
                let snapshot = self.registry.snapshot();
                let clock = snapshot.get(&node_id).and_then(|handle| handle.clock);
                let record = StopRecord {
                    acked_at_us: ack.received_at_us,
                    final_local_us: ack.final_local_us,
                    final_coordinator_us: match (ack.final_local_us, clock) {
                        (Some(local), Some(clock)) => Some(clock.to_coordinator_time(local)),
                        _ => None,
                    },
                    offset_us: clock.map(|c| c.offset_at(ack.received_at_us)),
                    drift_ppm: clock.map(|c| c.drift_ppm),
                };
                if active.session.record_stopped(&node_id, record) {
                    self.registry
                        .update_state(&node_id, Transition::RecordingStopped)
                        .await;
                }
                self.finish_if_stopped().await;
            }
            (CommandKind::Stop, Err(err), SessionState::Stopping) => {
                warn!(target = "fleet::session", node_id = %node_id, error = %err, "stop not acknowledged");
                self.node_lost(&node_id, FailureReason::from(&err)).await;
            }
            (kind, result, state) => {
                debug!(
                    target = "fleet::session",
                    node_id = %node_id,
                    kind = kind.as_str(),
                    ok = result.is_ok(),
                    state = state.as_str(),
                    "resolution no longer relevant"
                );
            }
        }
    }

    async fn handle_event(&mut self, event: CoordinatorEvent) {
        if let CoordinatorEvent::NodeStateChanged { node_id, new, .. } = event {
            if matches!(new, ConnectionState::Faulted | ConnectionState::Disconnected) {
                self.participant_down(&node_id, new).await;
            }
        }
    }

    /// Catches up on node failures missed while the event receiver lagged.
    async fn reconcile(&mut self) {
        if self.active.is_none() {
            return;
        }
        let snapshot = self.registry.current().await;
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let down: Vec<(String, ConnectionState)> = active
            .session
            .live_nodes()
            .filter_map(|node_id| {
                let state = snapshot
                    .get(node_id)
                    .map(|handle| handle.connection_state)
                    .unwrap_or(ConnectionState::Disconnected);
                (!state.is_live()).then(|| (node_id.to_string(), state))
            })
            .collect();
        for (node_id, state) in down {
            self.participant_down(&node_id, state).await;
        }
    }

    async fn participant_down(&mut self, node_id: &str, state: ConnectionState) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        if !active.session.is_participant(node_id) {
            return;
        }
        let reason = FailureReason::Lost { state };
        match active.session.state {
            SessionState::Arming => {
                self.abort(StopCause::ArmingFailed, vec![NodeFailure::new(node_id, reason)])
                    .await
            }
            SessionState::Recording | SessionState::Stopping => self.node_lost(node_id, reason).await,
            _ => {}
        }
    }

    async fn node_lost(&mut self, node_id: &str, reason: FailureReason) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let now_us = self.clock.now_us();
        if !active.session.mark_lost(node_id, reason.clone(), now_us) {
            return;
        }
        let session_id = active.session.session_id;
        let state = active.session.state;
        warn!(
            target = "fleet::session",
            session_id = %session_id,
            node_id,
            ?reason,
            state = state.as_str(),
            "participant lost"
        );
        self.events.publish(CoordinatorEvent::SessionNodeLost {
            session_id,
            node_id: node_id.to_string(),
            reason,
        });

        match state {
            SessionState::Recording => {
                let total = active.session.participating_nodes.len();
                let live = active.session.live_nodes().count();
                let below_floor = self
                    .settings
                    .min_live_fraction
                    .is_some_and(|fraction| live < required_nodes(fraction, total));
                if live == 0 || below_floor {
                    // begin_stopping can lose nodes in turn.
                    Box::pin(self.begin_stopping(StopCause::InsufficientLiveNodes)).await;
                }
            }
            SessionState::Stopping => self.finish_if_stopped().await,
            _ => {}
        }
    }

    async fn begin_recording(&mut self) {
        let start_at_us = self.clock.now_us() + self.settings.start_lead_time.as_micros() as i64;
        let snapshot = self.registry.current().await;
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let session_id = active.session.session_id;
        let participants: Vec<String> = active.session.live_nodes().map(str::to_string).collect();

        let mut starts = Vec::with_capacity(participants.len());
        for node_id in participants {
            let handle = snapshot.get(&node_id);
            let estimate = match handle.map(|h| h.clock_estimate()) {
                Some(Ok(estimate)) => Some(estimate),
                Some(Err(err)) => {
                    warn!(target = "fleet::session", node_id = %node_id, error = %err, "starting with last known offset");
                    handle.and_then(|h| h.clock)
                }
                None => None,
            };
            let node_offset_us = estimate.map(|e| e.offset_at(start_at_us)).unwrap_or(0);
            active.session.record_local_start(&node_id, start_at_us + node_offset_us);
            starts.push((node_id, node_offset_us));
        }

        active.session.started_at_us = Some(start_at_us);
        active.phase_deadline = None;
        active.record_until = active.session.duration_ms.map(|ms| {
            self.clock.instant_at(start_at_us) + Duration::from_millis(ms)
        });
        let report = ArmReport {
            session_id,
            participants: starts.iter().map(|(node, _)| node.clone()).collect(),
            rejected: active.session.rejected.clone(),
            start_at_us,
        };
        let arm_reply = active.arm_reply.take();
        self.set_state(SessionState::Recording, format!("start scheduled at {start_at_us}us"));

        for (node_id, node_offset_us) in starts {
            let body = CommandBody::Start {
                session_id,
                start_at_us,
                node_offset_us,
            };
            match self.dispatcher.issue(&node_id, body).await {
                Ok(ticket) => self.track(ticket.wait().boxed()),
                Err(err) => self.node_lost(&node_id, FailureReason::from(&err)).await,
            }
        }
        if let Some(reply) = arm_reply {
            let _ = reply.send(Ok(report));
        }
    }

    async fn begin_stopping(&mut self, cause: StopCause) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.session.state != SessionState::Recording {
            return;
        }
        active.session.stop_cause = Some(cause);
        active.record_until = None;
        active.phase_deadline = Some(Instant::now() + self.settings.stop_timeout);
        let session_id = active.session.session_id;
        let targets = active.session.awaiting(AckState::Stopped);
        let lost = active.session.lost_while_capturing();
        self.set_state(SessionState::Stopping, cause.as_str().to_string());

        for node_id in targets {
            match self.dispatcher.issue(&node_id, CommandBody::Stop { session_id }).await {
                Ok(ticket) => self.track(ticket.wait().boxed()),
                Err(err) => self.node_lost(&node_id, FailureReason::from(&err)).await,
            }
        }
        if !lost.is_empty() {
            self.dispatcher.cancel_all(lost.iter().cloned()).await;
            self.stop_best_effort(session_id, lost).await;
        }
        self.finish_if_stopped().await;
    }

    async fn finish_if_stopped(&mut self) {
        let done = self.active.as_ref().is_some_and(|active| {
            active.session.state == SessionState::Stopping
                && active.session.awaiting(AckState::Stopped).is_empty()
        });
        if done {
            self.close(SessionState::Finalized, "all live participants stopped".into())
                .await;
        }
    }

    async fn handle_deadline(&mut self, now: Instant) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let state = active.session.state;
        if state == SessionState::Recording && active.record_until.is_some_and(|until| until <= now) {
            self.begin_stopping(StopCause::DurationElapsed).await;
            return;
        }
        if !active.phase_deadline.is_some_and(|deadline| deadline <= now) {
            return;
        }
        match state {
            SessionState::Arming => {
                let failures = active
                    .session
                    .awaiting(AckState::Armed)
                    .into_iter()
                    .map(|node_id| NodeFailure::new(node_id, FailureReason::Timeout))
                    .collect();
                warn!(target = "fleet::session", "arming timed out");
                self.abort(StopCause::ArmingFailed, failures).await;
            }
            SessionState::Stopping => {
                let stragglers = active.session.awaiting(AckState::Stopped);
                for node_id in stragglers {
                    self.node_lost(&node_id, FailureReason::Timeout).await;
                }
                // Losing the last straggler normally finalizes; this covers an
                // empty straggler list.
                self.finish_if_stopped().await;
            }
            _ => {
                if let Some(active) = self.active.as_mut() {
                    active.phase_deadline = None;
                }
            }
        }
    }

    /// Aborts the active session after recording `failures` as lost. Nodes
    /// that already armed or started get a best-effort Stop.
    async fn abort(&mut self, cause: StopCause, failures: Vec<NodeFailure>) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.session.state.is_terminal() {
            return;
        }
        let session_id = active.session.session_id;
        let now_us = self.clock.now_us();
        for failure in failures {
            if active.session.mark_lost(&failure.node_id, failure.reason.clone(), now_us) {
                self.events.publish(CoordinatorEvent::SessionNodeLost {
                    session_id,
                    node_id: failure.node_id,
                    reason: failure.reason,
                });
            }
        }
        active.session.stop_cause = Some(cause);
        let participants: Vec<String> = active.session.participating_nodes.iter().cloned().collect();
        let mut rollback: Vec<String> = active
            .session
            .per_node_ack
            .iter()
            .filter(|(_, ack)| matches!(ack.state, AckState::Armed | AckState::Started))
            .map(|(node, _)| node.clone())
            .collect();
        rollback.extend(active.session.lost_while_capturing());

        self.dispatcher.cancel_all(participants).await;
        self.stop_best_effort(session_id, rollback).await;
        self.close(SessionState::Aborted, cause.as_str().to_string()).await;
    }

    /// Sends Stop outside the session's ack accounting. An ack hands the
    /// node back to the registry as no longer recording.
    async fn stop_best_effort(&mut self, session_id: Uuid, nodes: Vec<String>) {
        for node_id in nodes {
            match self.dispatcher.issue(&node_id, CommandBody::Stop { session_id }).await {
                Ok(ticket) => {
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        let resolution = ticket.wait().await;
                        if resolution.result.is_ok() {
                            registry
                                .update_state(&resolution.node_id, Transition::RecordingStopped)
                                .await;
                        }
                    });
                }
                Err(err) => {
                    debug!(target = "fleet::session", node_id = %node_id, error = %err, "best-effort stop not sent")
                }
            }
        }
    }

    /// Enters the terminal `state`, persists the outcome and answers waiters.
    async fn close(&mut self, state: SessionState, details: String) {
        if let Some(active) = self.active.as_mut() {
            active.session.stopped_at_us = Some(self.clock.now_us());
        }
        self.set_state(state, details);
        let Some(mut active) = self.active.take() else {
            return;
        };
        let session = active.session.clone();
        if state == SessionState::Finalized {
            // Best-effort stops to lost nodes stay in flight.
            let (lost, clean): (Vec<String>, Vec<String>) = session
                .participating_nodes
                .iter()
                .cloned()
                .partition(|node_id| session.ack_state(node_id) == Some(AckState::Lost));
            self.dispatcher.cancel_all(clean).await;
            for node_id in lost {
                self.dispatcher.cancel(&node_id, CommandKind::Start).await;
            }
        }

        let outcome = session.outcome();
        match tokio::time::timeout(self.settings.stop_timeout, self.persistence.session_closed(&outcome)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(target = "fleet::session", session_id = %session.session_id, error = %err, "failed to persist session outcome")
            }
            Err(_) => {
                error!(target = "fleet::session", session_id = %session.session_id, "persisting session outcome timed out")
            }
        }

        if let Some(reply) = active.arm_reply.take() {
            let _ = reply.send(Err(ArmError::Aborted {
                session_id: session.session_id,
                failures: outcome.lost_nodes.clone(),
            }));
        }
        for reply in active.stop_replies.drain(..) {
            let _ = reply.send(Ok(outcome.clone()));
        }
        info!(
            target = "fleet::session",
            session_id = %session.session_id,
            state = state.as_str(),
            clean = outcome.clean_nodes.len(),
            lost = outcome.lost_nodes.len(),
            "session closed"
        );
        self.last = Some(session);
    }

    fn set_state(&mut self, next: SessionState, details: String) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let session_id = active.session.session_id;
        match active.session.transition(next) {
            Ok(old) => {
                info!(
                    target = "fleet::session",
                    session_id = %session_id,
                    old = old.as_str(),
                    new = next.as_str(),
                    details = %details,
                    "session state changed"
                );
                metrics::SESSION_TRANSITIONS.with_label_values(&[next.as_str()]).inc();
                self.events.publish(CoordinatorEvent::SessionStateChanged {
                    session_id,
                    old,
                    new: next,
                    details,
                });
            }
            Err(err) => {
                error!(target = "fleet::session", session_id = %session_id, error = %err, "rejected session transition");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::required_nodes;

    #[test_timeout::timeout]
    fn required_nodes_rounds_up() {
        assert_eq!(required_nodes(0.75, 4), 3);
        assert_eq!(required_nodes(0.5, 3), 2);
        assert_eq!(required_nodes(1.0, 3), 3);
        assert_eq!(required_nodes(0.01, 3), 1);
        assert_eq!(required_nodes(0.3, 10), 3);
    }
}
