use std::collections::HashMap;
use std::time::Duration;

use fleet_wire::{AckStatus, CommandBody, CommandKind, Envelope, Message};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ActiveCommand, CommandAck, CommandTicket, DispatchSettings};
use crate::clock::LocalClock;
use crate::error::{CommandError, TransportError};
use crate::events::{CoordinatorEvent, EventBus};
use crate::metrics;
use crate::registry::{FaultCause, NodeRegistry, Transition};
use crate::transport::Router;

const REQUEST_DEPTH: usize = 1024;
const IDLE_WAKE: Duration = Duration::from_secs(3600);

enum DispatchRequest {
    Issue {
        node_id: String,
        body: CommandBody,
        reply: oneshot::Sender<CommandTicket>,
    },
    Ack {
        node_id: String,
        command_id: u64,
        kind: CommandKind,
        status: AckStatus,
        final_local_us: Option<i64>,
        received_at_us: i64,
    },
    Cancel {
        node_id: String,
        kind: CommandKind,
        reply: oneshot::Sender<bool>,
    },
    CancelAll {
        node_ids: Vec<String>,
        reply: oneshot::Sender<usize>,
    },
    Active {
        reply: oneshot::Sender<Vec<ActiveCommand>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the dispatcher actor.
#[derive(Clone)]
pub struct CommandDispatcher {
    tx: mpsc::Sender<DispatchRequest>,
}

impl CommandDispatcher {
    pub fn spawn(
        settings: DispatchSettings,
        router: Router,
        registry: NodeRegistry,
        events: EventBus,
        clock: LocalClock,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(REQUEST_DEPTH);
        let actor = DispatcherActor {
            settings,
            router,
            registry,
            events,
            clock,
            pending: HashMap::new(),
            next_ids: HashMap::new(),
        };
        (Self { tx }, tokio::spawn(actor.run(rx)))
    }

    /// Sends `body` to `node_id`, superseding any active command of the same
    /// kind. Delivery failures surface through the returned ticket.
    pub async fn issue(&self, node_id: &str, body: CommandBody) -> Result<CommandTicket, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DispatchRequest::Issue {
                node_id: node_id.to_string(),
                body,
                reply,
            })
            .await
            .map_err(|_| CommandError::DispatcherClosed)?;
        rx.await.map_err(|_| CommandError::DispatcherClosed)
    }

    pub async fn ack(
        &self,
        node_id: &str,
        command_id: u64,
        kind: CommandKind,
        status: AckStatus,
        final_local_us: Option<i64>,
        received_at_us: i64,
    ) {
        let request = DispatchRequest::Ack {
            node_id: node_id.to_string(),
            command_id,
            kind,
            status,
            final_local_us,
            received_at_us,
        };
        if self.tx.send(request).await.is_err() {
            debug!(target = "fleet::protocol", node_id, command_id, "dispatcher stopped; ack dropped");
        }
    }

    pub async fn cancel(&self, node_id: &str, kind: CommandKind) -> bool {
        let (reply, rx) = oneshot::channel();
        let request = DispatchRequest::Cancel {
            node_id: node_id.to_string(),
            kind,
            reply,
        };
        if self.tx.send(request).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Cancels every active command addressed to any of `node_ids`.
    pub async fn cancel_all<I, S>(&self, node_ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (reply, rx) = oneshot::channel();
        let request = DispatchRequest::CancelAll {
            node_ids: node_ids.into_iter().map(Into::into).collect(),
            reply,
        };
        if self.tx.send(request).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn active_commands(&self) -> Vec<ActiveCommand> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(DispatchRequest::Active { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Cancels everything still active and stops the actor.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(DispatchRequest::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct Pending {
    command_id: u64,
    body: CommandBody,
    attempts: u32,
    sent_at_us: i64,
    deadline: Instant,
    reply: oneshot::Sender<Result<CommandAck, CommandError>>,
}

type PendingKey = (String, CommandKind);

struct DispatcherActor {
    settings: DispatchSettings,
    router: Router,
    registry: NodeRegistry,
    events: EventBus,
    clock: LocalClock,
    pending: HashMap<PendingKey, Pending>,
    /// Next id per node. Never reset, so ids stay unique across reconnects.
    next_ids: HashMap<String, u64>,
}

impl DispatcherActor {
    async fn run(mut self, mut rx: mpsc::Receiver<DispatchRequest>) {
        loop {
            let next_deadline = self.pending.values().map(|p| p.deadline).min();
            let wake = next_deadline.unwrap_or_else(|| Instant::now() + IDLE_WAKE);
            tokio::select! {
                request = rx.recv() => match request {
                    Some(DispatchRequest::Shutdown { reply }) => {
                        let cancelled = self.cancel_where(|_| true).await;
                        info!(target = "fleet::protocol", cancelled, "dispatcher shutting down");
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(wake), if next_deadline.is_some() => {
                    self.expire(Instant::now()).await;
                }
            }
        }
    }

    async fn handle(&mut self, request: DispatchRequest) {
        match request {
            DispatchRequest::Issue {
                node_id,
                body,
                reply,
            } => {
                let ticket = self.issue(node_id, body).await;
                let _ = reply.send(ticket);
            }
            DispatchRequest::Ack {
                node_id,
                command_id,
                kind,
                status,
                final_local_us,
                received_at_us,
            } => {
                self.ack(node_id, command_id, kind, status, final_local_us, received_at_us)
                    .await
            }
            DispatchRequest::Cancel {
                node_id,
                kind,
                reply,
            } => {
                let cancelled = self
                    .cancel_where(|key| key.0 == node_id && key.1 == kind)
                    .await;
                let _ = reply.send(cancelled > 0);
            }
            DispatchRequest::CancelAll { node_ids, reply } => {
                let cancelled = self.cancel_where(|key| node_ids.contains(&key.0)).await;
                let _ = reply.send(cancelled);
            }
            DispatchRequest::Active { reply } => {
                let mut active: Vec<ActiveCommand> = self
                    .pending
                    .iter()
                    .map(|((node_id, kind), pending)| ActiveCommand {
                        node_id: node_id.clone(),
                        kind: *kind,
                        command_id: pending.command_id,
                        attempts: pending.attempts,
                    })
                    .collect();
                active.sort_by(|a, b| (&a.node_id, a.command_id).cmp(&(&b.node_id, b.command_id)));
                let _ = reply.send(active);
            }
            DispatchRequest::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn issue(&mut self, node_id: String, body: CommandBody) -> CommandTicket {
        let kind = body.kind();
        let next = self.next_ids.entry(node_id.clone()).or_insert(1);
        let command_id = *next;
        *next += 1;

        let (reply, outcome) = oneshot::channel();
        let ticket = CommandTicket {
            node_id: node_id.clone(),
            kind,
            command_id,
            outcome,
        };

        let key = (node_id.clone(), kind);
        if let Some(previous) = self.pending.remove(&key) {
            info!(
                target = "fleet::protocol",
                node_id = %node_id,
                kind = kind.as_str(),
                superseded = previous.command_id,
                command_id,
                "command superseded"
            );
            let _ = previous.reply.send(Err(CommandError::Superseded {
                node_id: node_id.clone(),
                kind,
                by: command_id,
            }));
        }

        let now = Instant::now();
        match self.transmit(&node_id, command_id, &body, 1).await {
            Err(err @ (TransportError::UnknownNode(_) | TransportError::Disconnected)) => {
                debug!(target = "fleet::protocol", node_id = %node_id, command_id, error = %err, "command undeliverable");
                let _ = reply.send(Err(CommandError::Unreachable {
                    node_id: node_id.clone(),
                    source: err,
                }));
            }
            // A slow or failed write counts as a missed attempt; the retry
            // schedule takes it from here.
            _ => {
                self.pending.insert(
                    key,
                    Pending {
                        command_id,
                        body,
                        attempts: 1,
                        sent_at_us: self.clock.micros_at(now),
                        deadline: now + self.settings.attempt_window(1),
                        reply,
                    },
                );
            }
        }
        self.sync_pending(&node_id).await;
        ticket
    }

    async fn ack(
        &mut self,
        node_id: String,
        command_id: u64,
        kind: CommandKind,
        status: AckStatus,
        final_local_us: Option<i64>,
        received_at_us: i64,
    ) {
        let key = (node_id, kind);
        let ignored = match self.pending.get(&key) {
            Some(pending) if pending.command_id == command_id => None,
            Some(pending) if command_id < pending.command_id => Some("superseded"),
            None if self
                .next_ids
                .get(&key.0)
                .is_some_and(|next| command_id < *next) =>
            {
                Some("stale")
            }
            _ => Some("unknown"),
        };
        if let Some(reason) = ignored {
            debug!(
                target = "fleet::protocol",
                node_id = %key.0,
                kind = kind.as_str(),
                command_id,
                reason,
                "ignoring ack"
            );
            metrics::ACKS_IGNORED.with_label_values(&[reason]).inc();
            return;
        }
        let Some(pending) = self.pending.remove(&key) else {
            return;
        };
        let (node_id, kind) = key;
        let result = match status {
            AckStatus::Accepted => {
                debug!(
                    target = "fleet::protocol",
                    node_id = %node_id,
                    kind = kind.as_str(),
                    command_id,
                    attempts = pending.attempts,
                    "command acknowledged"
                );
                self.registry.update_state(&node_id, Transition::Recovered).await;
                Ok(CommandAck {
                    node_id: node_id.clone(),
                    kind,
                    command_id,
                    attempts: pending.attempts,
                    sent_at_us: pending.sent_at_us,
                    received_at_us,
                    final_local_us,
                })
            }
            AckStatus::Rejected(reason) => {
                warn!(
                    target = "fleet::protocol",
                    node_id = %node_id,
                    kind = kind.as_str(),
                    command_id,
                    reason = %reason,
                    "command rejected"
                );
                Err(CommandError::Rejected {
                    node_id: node_id.clone(),
                    kind,
                    reason,
                })
            }
        };
        let _ = pending.reply.send(result);
        self.sync_pending(&node_id).await;
    }

    /// Resends or times out every command whose current attempt has lapsed.
    async fn expire(&mut self, now: Instant) {
        let due: Vec<PendingKey> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in due {
            let Some(mut pending) = self.pending.remove(&key) else {
                continue;
            };
            let (node_id, kind) = &key;

            if pending.attempts > self.settings.retry_count {
                warn!(
                    target = "fleet::protocol",
                    node_id = %node_id,
                    kind = kind.as_str(),
                    command_id = pending.command_id,
                    attempts = pending.attempts,
                    "command timed out"
                );
                metrics::COMMAND_TIMEOUTS.with_label_values(&[kind.as_str()]).inc();
                let _ = pending.reply.send(Err(CommandError::TimedOut {
                    node_id: node_id.clone(),
                    kind: *kind,
                    attempts: pending.attempts,
                }));
                self.registry
                    .update_state(node_id, Transition::Fault(FaultCause::CommandTimeout { kind: *kind }))
                    .await;
                self.events.publish(CoordinatorEvent::CommandTimeout {
                    node_id: node_id.clone(),
                    kind: *kind,
                    command_id: pending.command_id,
                });
                self.sync_pending(node_id).await;
                continue;
            }

            let attempt = pending.attempts + 1;
            metrics::COMMAND_RETRIES.with_label_values(&[kind.as_str()]).inc();
            match self
                .transmit(node_id, pending.command_id, &pending.body, attempt)
                .await
            {
                Err(err @ (TransportError::UnknownNode(_) | TransportError::Disconnected)) => {
                    let _ = pending.reply.send(Err(CommandError::Unreachable {
                        node_id: node_id.clone(),
                        source: err,
                    }));
                    self.sync_pending(node_id).await;
                }
                _ => {
                    let sent = Instant::now();
                    pending.attempts = attempt;
                    pending.sent_at_us = self.clock.micros_at(sent);
                    pending.deadline = sent + self.settings.attempt_window(attempt);
                    self.pending.insert(key, pending);
                }
            }
        }
    }

    async fn transmit(
        &self,
        node_id: &str,
        command_id: u64,
        body: &CommandBody,
        attempt: u32,
    ) -> Result<(), TransportError> {
        let kind = body.kind();
        let window = self.settings.attempt_window(attempt);
        let envelope = Envelope::new(
            node_id,
            command_id,
            Message::Command {
                deadline_ms: u32::try_from(window.as_millis()).unwrap_or(u32::MAX),
                body: body.clone(),
            },
        );
        let result = self.router.send(node_id, &envelope).await;
        match &result {
            Ok(()) => {
                metrics::COMMANDS_SENT.with_label_values(&[kind.as_str()]).inc();
                debug!(
                    target = "fleet::protocol",
                    node_id,
                    kind = kind.as_str(),
                    command_id,
                    attempt,
                    "command sent"
                );
            }
            Err(err) => {
                debug!(
                    target = "fleet::protocol",
                    node_id,
                    kind = kind.as_str(),
                    command_id,
                    attempt,
                    error = %err,
                    "command send failed"
                );
            }
        }
        result
    }

    async fn cancel_where<F>(&mut self, mut matches: F) -> usize
    where
        F: FnMut(&PendingKey) -> bool,
    {
        let keys: Vec<PendingKey> = self.pending.keys().filter(|key| matches(key)).cloned().collect();
        let mut nodes = Vec::new();
        for key in &keys {
            if let Some(pending) = self.pending.remove(key) {
                let _ = pending.reply.send(Err(CommandError::Cancelled {
                    node_id: key.0.clone(),
                    kind: key.1,
                }));
                if !nodes.contains(&key.0) {
                    nodes.push(key.0.clone());
                }
            }
        }
        for node_id in nodes {
            self.sync_pending(&node_id).await;
        }
        keys.len()
    }

    /// Mirrors the newest active command id for `node_id` into the registry.
    async fn sync_pending(&self, node_id: &str) {
        let newest = self
            .pending
            .iter()
            .filter(|((node, _), _)| node == node_id)
            .map(|(_, pending)| pending.command_id)
            .max();
        self.registry.set_pending_command(node_id, newest).await;
    }
}
