//! Frame payload encoding
//!
//! Payloads are compact JSON objects carrying a protocol version:
//! `{"v":1,"type":"text","name":"..","seat":"..","content":"..","ts":1700000000000}`

use serde::{Deserialize, Serialize};

use seatlink_core::{FrameKind, MessageFrame};

use crate::error::{Error, Result};

/// Version written into every payload
pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    v: u8,
    #[serde(rename = "type")]
    kind: FrameKind,
    name: String,
    seat: String,
    content: String,
    ts: i64,
}

/// Serialize a frame into payload bytes (without the length prefix)
pub fn encode_payload(frame: &MessageFrame) -> Result<Vec<u8>> {
    let payload = Payload {
        v: PROTOCOL_VERSION,
        kind: frame.kind,
        name: frame.sender_name.clone(),
        seat: frame.sender_seat.clone(),
        content: frame.content.clone(),
        ts: frame.timestamp,
    };
    serde_json::to_vec(&payload)
        .map_err(|e| Error::MalformedFrame(format!("Serialization failed: {}", e)))
}

/// Deserialize payload bytes into a frame
///
/// Newer versions are accepted as long as the fields this version knows are
/// present; unknown fields are ignored.
pub fn decode_payload(bytes: &[u8]) -> Result<MessageFrame> {
    let payload: Payload = serde_json::from_slice(bytes)
        .map_err(|e| Error::MalformedFrame(format!("Invalid JSON: {}", e)))?;

    if payload.v == 0 {
        return Err(Error::MalformedFrame("Protocol version 0".into()));
    }

    Ok(MessageFrame {
        kind: payload.kind,
        sender_name: payload.name,
        sender_seat: payload.seat,
        content: payload.content,
        timestamp: payload.ts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_roundtrip() {
        let frame = MessageFrame::user_info("Pixel7", "12A", "Hello");
        let bytes = encode_payload(&frame).unwrap();
        assert_eq!(decode_payload(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_unknown_type_and_fields_tolerated() {
        let bytes = br#"{"v":2,"type":"sticker","name":"a","seat":"1A","content":"x","ts":5,"extra":true}"#;
        let frame = decode_payload(bytes).unwrap();
        assert_eq!(frame.kind, FrameKind::Unknown);
        assert_eq!(frame.timestamp, 5);
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let bytes = br#"{"v":1,"type":"text","name":"a","content":"x","ts":5}"#;
        assert!(matches!(decode_payload(bytes), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_version_zero_rejected() {
        let bytes = br#"{"v":0,"type":"text","name":"a","seat":"1A","content":"x","ts":5}"#;
        assert!(matches!(decode_payload(bytes), Err(Error::MalformedFrame(_))));
    }
}
