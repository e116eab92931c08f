use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Discriminant of a replicated log entry. One byte on the wire; the FSM
/// dispatches on it. Values are wire format and must never be reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    RegisterJob = 0,
    DeregisterJob = 1,
    UpsertNode = 2,
    DeregisterNode = 3,
    UpdateNodeStatus = 4,
    UpdateNodeDrain = 5,
    UpsertAllocs = 6,
    UpdateAllocsFromClient = 7,
    UpsertEvals = 8,
    UpdateEval = 9,
    DeleteEval = 10,
    ApplyPlanResults = 11,
    UpsertPeriodicLaunch = 12,
    UpsertNodePools = 13,
    DeleteNodePools = 14,
    UpsertServiceRegistrations = 15,
    DeleteServiceRegistration = 16,
    UpsertAclTokens = 17,
    UpsertVariable = 18,
    DeleteVariable = 19,
}

impl MessageType {
    /// Unknown discriminants decode to `None`; the FSM logs and skips them so
    /// newer servers can replicate entries through older ones.
    pub fn from_u8(value: u8) -> Option<MessageType> {
        match value {
            0 => Some(MessageType::RegisterJob),
            1 => Some(MessageType::DeregisterJob),
            2 => Some(MessageType::UpsertNode),
            3 => Some(MessageType::DeregisterNode),
            4 => Some(MessageType::UpdateNodeStatus),
            5 => Some(MessageType::UpdateNodeDrain),
            6 => Some(MessageType::UpsertAllocs),
            7 => Some(MessageType::UpdateAllocsFromClient),
            8 => Some(MessageType::UpsertEvals),
            9 => Some(MessageType::UpdateEval),
            10 => Some(MessageType::DeleteEval),
            11 => Some(MessageType::ApplyPlanResults),
            12 => Some(MessageType::UpsertPeriodicLaunch),
            13 => Some(MessageType::UpsertNodePools),
            14 => Some(MessageType::DeleteNodePools),
            15 => Some(MessageType::UpsertServiceRegistrations),
            16 => Some(MessageType::DeleteServiceRegistration),
            17 => Some(MessageType::UpsertAclTokens),
            18 => Some(MessageType::UpsertVariable),
            19 => Some(MessageType::DeleteVariable),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("entry truncated: {0}")]
    Truncated(String),
    #[error("entry length mismatch: header says {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Frames a log entry: 1-byte message type, 4-byte big-endian payload length,
/// payload.
pub fn encode_frame(message_type: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 4 + payload.len());
    buf.put_u8(message_type);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Splits a frame into `(message_type, payload)`.
pub fn decode_frame(buf: &[u8]) -> Result<(u8, &[u8]), WireError> {
    if buf.len() < 5 {
        return Err(WireError::Truncated(format!(
            "frame header needs 5 bytes, got {}",
            buf.len()
        )));
    }
    let message_type = buf[0];
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    let payload = &buf[5..];
    if payload.len() != len {
        return Err(WireError::LengthMismatch {
            expected: len,
            actual: payload.len(),
        });
    }
    Ok((message_type, payload))
}

pub fn encode_entry<T: Serialize>(
    message_type: MessageType,
    payload: &T,
) -> Result<Bytes, WireError> {
    let body = bincode::serialize(payload)?;
    Ok(encode_frame(message_type as u8, &body))
}

pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, WireError> {
    Ok(bincode::deserialize(payload)?)
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = encode_frame(MessageType::UpsertNode as u8, b"payload");
        let (message_type, payload) = decode_frame(&frame).unwrap();
        assert_eq!(MessageType::from_u8(message_type), Some(MessageType::UpsertNode));
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn unknown_message_types_are_tolerated() {
        let frame = encode_frame(200, b"future");
        let (message_type, payload) = decode_frame(&frame).unwrap();
        assert_eq!(MessageType::from_u8(message_type), None);
        assert_eq!(payload, b"future");
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let frame = encode_frame(MessageType::UpsertEvals as u8, b"body");
        assert!(decode_frame(&frame[..frame.len() - 1]).is_err());
        assert!(decode_frame(&frame[..3]).is_err());
    }
}
