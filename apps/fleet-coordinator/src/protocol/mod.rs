//! Command issue, retry and acknowledgement tracking.
//!
//! At most one command per `(node, kind)` is active: issuing a new one
//! supersedes the old. Unacknowledged commands are resent with the same
//! `command_id` until retries run out, at which point the node is faulted and
//! a [`CoordinatorEvent::CommandTimeout`](crate::events::CoordinatorEvent) is
//! published.

mod dispatcher;

use std::time::Duration;

use fleet_wire::CommandKind;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::config::CoordinatorConfig;
use crate::error::CommandError;

pub use dispatcher::CommandDispatcher;

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub ack_timeout: Duration,
    pub retry_count: u32,
    pub retry_backoff: Duration,
}

impl DispatchSettings {
    /// Wait after attempt `attempt` (1-based) before it counts as missed.
    pub fn attempt_window(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.ack_timeout;
        }
        let exponent = (attempt - 2).min(16);
        self.ack_timeout + self.retry_backoff.saturating_mul(1u32 << exponent)
    }

    /// Worst-case time a command stays pending before it is declared lost.
    pub fn lifetime(&self) -> Duration {
        (1..=self.retry_count + 1).map(|attempt| self.attempt_window(attempt)).sum()
    }
}

impl From<&CoordinatorConfig> for DispatchSettings {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            ack_timeout: config.command_ack_timeout,
            retry_count: config.command_retry_count,
            retry_backoff: config.command_retry_backoff,
        }
    }
}

/// Successful acknowledgement of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandAck {
    pub node_id: String,
    pub kind: CommandKind,
    pub command_id: u64,
    pub attempts: u32,
    /// Coordinator time the acknowledged attempt was written.
    pub sent_at_us: i64,
    pub received_at_us: i64,
    pub final_local_us: Option<i64>,
}

impl CommandAck {
    pub fn round_trip(&self) -> Duration {
        Duration::from_micros((self.received_at_us - self.sent_at_us).max(0) as u64)
    }
}

/// How a command ended, as delivered to whoever issued it.
#[derive(Debug, Clone)]
pub struct CommandResolution {
    pub node_id: String,
    pub kind: CommandKind,
    pub command_id: u64,
    pub result: Result<CommandAck, CommandError>,
}

/// Handle to one issued command.
#[derive(Debug)]
pub struct CommandTicket {
    pub node_id: String,
    pub kind: CommandKind,
    pub command_id: u64,
    outcome: oneshot::Receiver<Result<CommandAck, CommandError>>,
}

impl CommandTicket {
    pub async fn wait(self) -> CommandResolution {
        let result = self
            .outcome
            .await
            .unwrap_or(Err(CommandError::DispatcherClosed));
        CommandResolution {
            node_id: self.node_id,
            kind: self.kind,
            command_id: self.command_id,
            result,
        }
    }

    pub async fn result(self) -> Result<CommandAck, CommandError> {
        self.wait().await.result
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveCommand {
    pub node_id: String,
    pub kind: CommandKind,
    pub command_id: u64,
    pub attempts: u32,
}

#[cfg(test)]
mod tests;
