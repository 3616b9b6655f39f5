use bytes::{BufMut, Bytes, BytesMut};

use crate::{encode_envelope, Envelope, WireError};

pub const FRAME_HEADER_LEN: usize = 4;
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Encodes `envelope` behind its big-endian length prefix.
pub fn encode_frame(envelope: &Envelope) -> Result<Bytes, WireError> {
    let body = encode_envelope(envelope)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(body.len()));
    }
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(&body);
    Ok(buf.freeze())
}

/// Validates a received length prefix and returns the body length.
pub fn frame_len(header: [u8; FRAME_HEADER_LEN]) -> Result<usize, WireError> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    if len == 0 {
        return Err(WireError::InvalidData("empty frame"));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode_envelope, Message};

    #[test_timeout::timeout]
    fn prefix_matches_body_length() {
        let envelope = Envelope::new("node-a", 4, Message::Heartbeat { node_time_us: 99 });
        let frame = encode_frame(&envelope).expect("frame");
        let header: [u8; FRAME_HEADER_LEN] = frame[..FRAME_HEADER_LEN].try_into().expect("header");
        let len = frame_len(header).expect("len");
        assert_eq!(len, frame.len() - FRAME_HEADER_LEN);
        let decoded = decode_envelope(&frame[FRAME_HEADER_LEN..]).expect("decode");
        assert_eq!(decoded, envelope);
    }

    #[test_timeout::timeout]
    fn oversized_prefix_is_rejected() {
        let header = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        assert_eq!(
            frame_len(header).unwrap_err(),
            WireError::FrameTooLarge(MAX_FRAME_LEN + 1)
        );
        assert!(frame_len([0; 4]).is_err());
    }
}
