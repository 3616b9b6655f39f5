//! Wire definitions shared by the coordinator and the recording nodes.
//!
//! Every message travels as one length-prefixed frame:
//!
//! ```text
//! ┌──────────────────┬───────────────────────────────────────────────┐
//! │ Length (4 bytes) │ Envelope                                      │
//! │ Big-endian u32   │ header | node_id | id | message payload       │
//! └──────────────────┴───────────────────────────────────────────────┘
//! ```
//!
//! The header byte packs the protocol version into the top three bits and the
//! message type into the low five. Integers are LEB128 varints (signed values
//! zig-zag encoded), strings are varint-length-prefixed UTF-8 and session ids
//! are sixteen raw bytes. Sensor payloads (`ConfigUpdate`, `StatusReport`) are
//! opaque to this crate.

mod codec;
mod frame;

use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use codec::{decode_envelope, encode_envelope};
pub use frame::{encode_frame, frame_len, FRAME_HEADER_LEN, MAX_FRAME_LEN};

pub const PROTOCOL_VERSION: u8 = 1;

/// Longest node identifier accepted on the wire.
pub const MAX_NODE_ID_LEN: usize = 128;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("invalid protocol version: {0}")]
    InvalidVersion(u8),
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),
    #[error("unknown command kind: {0}")]
    UnknownCommandKind(u8),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("varint overflow")]
    VarIntOverflow,
    #[error("node id too long: {0} bytes")]
    NodeIdTooLong(usize),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("invalid data: {0}")]
    InvalidData(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Arm,
    Start,
    Stop,
    ConfigUpdate,
    Ping,
}

impl CommandKind {
    pub const ALL: [CommandKind; 5] = [
        CommandKind::Arm,
        CommandKind::Start,
        CommandKind::Stop,
        CommandKind::ConfigUpdate,
        CommandKind::Ping,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Arm => "arm",
            CommandKind::Start => "start",
            CommandKind::Stop => "stop",
            CommandKind::ConfigUpdate => "config_update",
            CommandKind::Ping => "ping",
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            CommandKind::Arm => 0,
            CommandKind::Start => 1,
            CommandKind::Stop => 2,
            CommandKind::ConfigUpdate => 3,
            CommandKind::Ping => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(CommandKind::Arm),
            1 => Ok(CommandKind::Start),
            2 => Ok(CommandKind::Stop),
            3 => Ok(CommandKind::ConfigUpdate),
            4 => Ok(CommandKind::Ping),
            other => Err(WireError::UnknownCommandKind(other)),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific command payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBody {
    /// Pre-allocate capture resources without starting.
    Arm { session_id: Uuid },
    /// Begin capture at `start_at_us` on the coordinator clock. The node's own
    /// clock reads `start_at_us + node_offset_us` at that instant.
    Start {
        session_id: Uuid,
        start_at_us: i64,
        node_offset_us: i64,
    },
    Stop { session_id: Uuid },
    ConfigUpdate { payload: Bytes },
    Ping,
}

impl CommandBody {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandBody::Arm { .. } => CommandKind::Arm,
            CommandBody::Start { .. } => CommandKind::Start,
            CommandBody::Stop { .. } => CommandKind::Stop,
            CommandBody::ConfigUpdate { .. } => CommandKind::ConfigUpdate,
            CommandBody::Ping => CommandKind::Ping,
        }
    }

    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            CommandBody::Arm { session_id }
            | CommandBody::Start { session_id, .. }
            | CommandBody::Stop { session_id } => Some(*session_id),
            CommandBody::ConfigUpdate { .. } | CommandBody::Ping => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckStatus {
    Accepted,
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Handshake,
    HandshakeAck,
    ClockProbe,
    ClockProbeReply,
    Command,
    CommandAck,
    Heartbeat,
    StatusReport,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Handshake => "handshake",
            MessageType::HandshakeAck => "handshake_ack",
            MessageType::ClockProbe => "clock_probe",
            MessageType::ClockProbeReply => "clock_probe_reply",
            MessageType::Command => "command",
            MessageType::CommandAck => "command_ack",
            MessageType::Heartbeat => "heartbeat",
            MessageType::StatusReport => "status_report",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake {
        protocol_version: u8,
        capabilities: BTreeSet<String>,
    },
    HandshakeAck {
        accepted: bool,
        reason: Option<String>,
    },
    /// `t0_us` is the coordinator's send time.
    ClockProbe { t0_us: i64 },
    /// Echoes `t0_us` and adds the node's receive (`t1_us`) and send (`t2_us`)
    /// times, both on the node clock.
    ClockProbeReply { t0_us: i64, t1_us: i64, t2_us: i64 },
    Command {
        deadline_ms: u32,
        body: CommandBody,
    },
    CommandAck {
        kind: CommandKind,
        status: AckStatus,
        /// Node-local timestamp of the last captured sample (Stop acks only).
        final_local_us: Option<i64>,
    },
    Heartbeat { node_time_us: i64 },
    StatusReport { payload: Bytes },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Handshake { .. } => MessageType::Handshake,
            Message::HandshakeAck { .. } => MessageType::HandshakeAck,
            Message::ClockProbe { .. } => MessageType::ClockProbe,
            Message::ClockProbeReply { .. } => MessageType::ClockProbeReply,
            Message::Command { .. } => MessageType::Command,
            Message::CommandAck { .. } => MessageType::CommandAck,
            Message::Heartbeat { .. } => MessageType::Heartbeat,
            Message::StatusReport { .. } => MessageType::StatusReport,
        }
    }
}

/// One discrete record on a node connection.
///
/// `id` carries the command id for `Command`/`CommandAck`, the probe id for
/// `ClockProbe`/`ClockProbeReply` and a sender-chosen sequence otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub node_id: String,
    pub id: u64,
    pub message: Message,
}

impl Envelope {
    pub fn new(node_id: impl Into<String>, id: u64, message: Message) -> Self {
        Self {
            node_id: node_id.into(),
            id,
            message,
        }
    }
}
