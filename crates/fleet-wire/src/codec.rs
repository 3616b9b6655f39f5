use std::collections::BTreeSet;

use bytes::Bytes;
use uuid::Uuid;

use crate::{
    AckStatus, CommandBody, CommandKind, Envelope, Message, WireError, MAX_NODE_ID_LEN,
    PROTOCOL_VERSION,
};

const VERSION_BITS: u8 = 3;
const VERSION_MASK: u8 = 0b1110_0000;
const TYPE_MASK: u8 = 0b0001_1111;

const KIND_HANDSHAKE: u8 = 0;
const KIND_HANDSHAKE_ACK: u8 = 1;
const KIND_CLOCK_PROBE: u8 = 2;
const KIND_CLOCK_PROBE_REPLY: u8 = 3;
const KIND_COMMAND: u8 = 4;
const KIND_COMMAND_ACK: u8 = 5;
const KIND_HEARTBEAT: u8 = 6;
const KIND_STATUS_REPORT: u8 = 7;

const ACK_ACCEPTED: u8 = 0;
const ACK_REJECTED: u8 = 1;

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    if envelope.node_id.len() > MAX_NODE_ID_LEN {
        return Err(WireError::NodeIdTooLong(envelope.node_id.len()));
    }
    let mut buf = Vec::with_capacity(32 + envelope.node_id.len());
    write_header(&mut buf, message_kind(&envelope.message));
    write_str(&mut buf, &envelope.node_id);
    write_var_u64(&mut buf, envelope.id);

    match &envelope.message {
        Message::Handshake {
            protocol_version,
            capabilities,
        } => {
            buf.push(*protocol_version);
            write_var_u64(&mut buf, capabilities.len() as u64);
            for capability in capabilities {
                write_str(&mut buf, capability);
            }
        }
        Message::HandshakeAck { accepted, reason } => {
            buf.push(*accepted as u8);
            write_opt_str(&mut buf, reason.as_deref());
        }
        Message::ClockProbe { t0_us } => {
            write_var_i64(&mut buf, *t0_us);
        }
        Message::ClockProbeReply {
            t0_us,
            t1_us,
            t2_us,
        } => {
            write_var_i64(&mut buf, *t0_us);
            write_var_i64(&mut buf, *t1_us);
            write_var_i64(&mut buf, *t2_us);
        }
        Message::Command { deadline_ms, body } => {
            buf.push(body.kind().as_u8());
            write_var_u64(&mut buf, *deadline_ms as u64);
            encode_command_body(&mut buf, body);
        }
        Message::CommandAck {
            kind,
            status,
            final_local_us,
        } => {
            buf.push(kind.as_u8());
            match status {
                AckStatus::Accepted => buf.push(ACK_ACCEPTED),
                AckStatus::Rejected(reason) => {
                    buf.push(ACK_REJECTED);
                    write_str(&mut buf, reason);
                }
            }
            buf.push(final_local_us.is_some() as u8);
            if let Some(ts) = final_local_us {
                write_var_i64(&mut buf, *ts);
            }
        }
        Message::Heartbeat { node_time_us } => {
            write_var_i64(&mut buf, *node_time_us);
        }
        Message::StatusReport { payload } => {
            write_bytes(&mut buf, payload);
        }
    }
    Ok(buf)
}

pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, WireError> {
    let mut cursor = Cursor::new(bytes);
    let kind = read_header(&mut cursor)?;
    let node_id = cursor.read_str()?;
    if node_id.len() > MAX_NODE_ID_LEN {
        return Err(WireError::NodeIdTooLong(node_id.len()));
    }
    let id = cursor.read_var_u64()?;

    let message = match kind {
        KIND_HANDSHAKE => {
            let protocol_version = cursor.read_u8()?;
            let count = cursor.read_var_u64()? as usize;
            if count > cursor.remaining() {
                return Err(WireError::UnexpectedEof);
            }
            let mut capabilities = BTreeSet::new();
            for _ in 0..count {
                capabilities.insert(cursor.read_str()?);
            }
            Message::Handshake {
                protocol_version,
                capabilities,
            }
        }
        KIND_HANDSHAKE_ACK => {
            let accepted = cursor.read_bool()?;
            let reason = cursor.read_opt_str()?;
            Message::HandshakeAck { accepted, reason }
        }
        KIND_CLOCK_PROBE => Message::ClockProbe {
            t0_us: cursor.read_var_i64()?,
        },
        KIND_CLOCK_PROBE_REPLY => {
            let t0_us = cursor.read_var_i64()?;
            let t1_us = cursor.read_var_i64()?;
            let t2_us = cursor.read_var_i64()?;
            Message::ClockProbeReply {
                t0_us,
                t1_us,
                t2_us,
            }
        }
        KIND_COMMAND => {
            let kind = CommandKind::from_u8(cursor.read_u8()?)?;
            let deadline_ms = cursor.read_var_u32()?;
            let body = decode_command_body(&mut cursor, kind)?;
            Message::Command { deadline_ms, body }
        }
        KIND_COMMAND_ACK => {
            let kind = CommandKind::from_u8(cursor.read_u8()?)?;
            let status = match cursor.read_u8()? {
                ACK_ACCEPTED => AckStatus::Accepted,
                ACK_REJECTED => AckStatus::Rejected(cursor.read_str()?),
                _ => return Err(WireError::InvalidData("invalid ack status")),
            };
            let final_local_us = if cursor.read_bool()? {
                Some(cursor.read_var_i64()?)
            } else {
                None
            };
            Message::CommandAck {
                kind,
                status,
                final_local_us,
            }
        }
        KIND_HEARTBEAT => Message::Heartbeat {
            node_time_us: cursor.read_var_i64()?,
        },
        KIND_STATUS_REPORT => Message::StatusReport {
            payload: Bytes::copy_from_slice(cursor.read_len_prefixed()?),
        },
        other => return Err(WireError::UnknownMessageType(other)),
    };

    if cursor.remaining() > 0 {
        return Err(WireError::TrailingBytes(cursor.remaining()));
    }
    Ok(Envelope {
        node_id,
        id,
        message,
    })
}

fn message_kind(message: &Message) -> u8 {
    match message {
        Message::Handshake { .. } => KIND_HANDSHAKE,
        Message::HandshakeAck { .. } => KIND_HANDSHAKE_ACK,
        Message::ClockProbe { .. } => KIND_CLOCK_PROBE,
        Message::ClockProbeReply { .. } => KIND_CLOCK_PROBE_REPLY,
        Message::Command { .. } => KIND_COMMAND,
        Message::CommandAck { .. } => KIND_COMMAND_ACK,
        Message::Heartbeat { .. } => KIND_HEARTBEAT,
        Message::StatusReport { .. } => KIND_STATUS_REPORT,
    }
}

fn encode_command_body(buf: &mut Vec<u8>, body: &CommandBody) {
    match body {
        CommandBody::Arm { session_id } | CommandBody::Stop { session_id } => {
            buf.extend_from_slice(session_id.as_bytes());
        }
        CommandBody::Start {
            session_id,
            start_at_us,
            node_offset_us,
        } => {
            buf.extend_from_slice(session_id.as_bytes());
            write_var_i64(buf, *start_at_us);
            write_var_i64(buf, *node_offset_us);
        }
        CommandBody::ConfigUpdate { payload } => write_bytes(buf, payload),
        CommandBody::Ping => {}
    }
}

fn decode_command_body(cursor: &mut Cursor<'_>, kind: CommandKind) -> Result<CommandBody, WireError> {
    let body = match kind {
        CommandKind::Arm => CommandBody::Arm {
            session_id: cursor.read_uuid()?,
        },
        CommandKind::Start => {
            let session_id = cursor.read_uuid()?;
            let start_at_us = cursor.read_var_i64()?;
            let node_offset_us = cursor.read_var_i64()?;
            CommandBody::Start {
                session_id,
                start_at_us,
                node_offset_us,
            }
        }
        CommandKind::Stop => CommandBody::Stop {
            session_id: cursor.read_uuid()?,
        },
        CommandKind::ConfigUpdate => CommandBody::ConfigUpdate {
            payload: Bytes::copy_from_slice(cursor.read_len_prefixed()?),
        },
        CommandKind::Ping => CommandBody::Ping,
    };
    Ok(body)
}

fn write_header(buf: &mut Vec<u8>, kind: u8) {
    let version = PROTOCOL_VERSION & ((1 << VERSION_BITS) - 1);
    buf.push((version << 5) | (kind & TYPE_MASK));
}

fn read_header(cursor: &mut Cursor<'_>) -> Result<u8, WireError> {
    let byte = cursor.read_u8()?;
    let version = (byte & VERSION_MASK) >> 5;
    if version != (PROTOCOL_VERSION & ((1 << VERSION_BITS) - 1)) {
        return Err(WireError::InvalidVersion(version));
    }
    Ok(byte & TYPE_MASK)
}

fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn write_var_i64(buf: &mut Vec<u8>, value: i64) {
    write_var_u64(buf, ((value << 1) ^ (value >> 63)) as u64);
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_var_u64(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn write_str(buf: &mut Vec<u8>, value: &str) {
    write_bytes(buf, value.as_bytes());
}

fn write_opt_str(buf: &mut Vec<u8>, value: Option<&str>) {
    buf.push(value.is_some() as u8);
    if let Some(value) = value {
        write_str(buf, value);
    }
}

#[derive(Clone, Copy)]
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        if self.pos >= self.bytes.len() {
            return Err(WireError::UnexpectedEof);
        }
        let value = self.bytes[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_var_u64(&mut self) -> Result<u64, WireError> {
        let mut result: u64 = 0;
        let mut shift = 0;
        while shift < 64 {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(WireError::VarIntOverflow)
    }

    fn read_var_u32(&mut self) -> Result<u32, WireError> {
        let value = self.read_var_u64()?;
        u32::try_from(value).map_err(|_| WireError::InvalidData("u32 overflow"))
    }

    fn read_var_i64(&mut self) -> Result<i64, WireError> {
        let raw = self.read_var_u64()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    fn read_bool(&mut self) -> Result<bool, WireError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(WireError::InvalidData("invalid boolean")),
        }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if len > self.remaining() {
            return Err(WireError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_len_prefixed(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_var_u64()?;
        let len = usize::try_from(len).map_err(|_| WireError::InvalidData("length overflow"))?;
        self.read_bytes(len)
    }

    fn read_str(&mut self) -> Result<String, WireError> {
        let raw = self.read_len_prefixed()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidData("invalid utf-8"))
    }

    fn read_opt_str(&mut self) -> Result<Option<String>, WireError> {
        if self.read_bool()? {
            Ok(Some(self.read_str()?))
        } else {
            Ok(None)
        }
    }

    fn read_uuid(&mut self) -> Result<Uuid, WireError> {
        let raw = self.read_bytes(16)?;
        Uuid::from_slice(raw).map_err(|_| WireError::InvalidData("invalid session id"))
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }
}
