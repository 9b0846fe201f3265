//! Wire message framing (spec §6): a 16-bit message type, a 16-bit declared
//! payload length, and up to 544 bytes of payload. `Message` is the unit the
//! dispatcher (C7) consumes and produces; encoding/decoding of the payload
//! body itself is opcode-specific and lives in `dispatch.rs`.

/// Largest payload the wire format allows (spec §6).
pub const MAX_PAYLOAD_LEN: usize = 544;

/// AES-GCM tag length appended to the payload tail of a GCM-flagged message
/// (spec §4.7 step 2 / §6); the effective payload budget shrinks by this much
/// when `opcode::GCM_FLAG` is set on `message_type`.
pub const GCM_TAG_LEN: usize = 16;

pub const ACK_BYTE: u8 = 0x0B;
pub const NACK_BYTE: u8 = 0x15;
pub const NA_BYTE: u8 = 0x7F;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: u16,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(message_type: u16, payload: Vec<u8>) -> Message {
        Message { message_type, payload }
    }

    pub fn empty(message_type: u16) -> Message {
        Message { message_type, payload: Vec::new() }
    }

    /// Serializes to the on-wire layout: type, declared length, payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.payload.len());
        out.extend_from_slice(&self.message_type.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parses the framing header; does not validate the declared length
    /// against the actual payload span (that's `dispatch::parse`'s job,
    /// spec §4.7 step 1 — a mismatch there is a silent drop, not a decode
    /// error here).
    pub fn from_bytes(bytes: &[u8]) -> Option<(Message, u16)> {
        if bytes.len() < 4 {
            return None;
        }
        let message_type = u16::from_le_bytes([bytes[0], bytes[1]]);
        let declared_len = u16::from_le_bytes([bytes[2], bytes[3]]);
        let payload = bytes[4..].to_vec();
        Some((Message { message_type, payload }, declared_len))
    }
}

/// A one-byte ACK/NACK response mirroring the request's opcode (spec §6:
/// "status response byte layout").
pub fn ack_nack(message_type: u16, ok: bool) -> Message {
    Message::new(message_type, vec![if ok { ACK_BYTE } else { NACK_BYTE }])
}

/// `RETRY` mirrors the opcode back with an empty payload (spec §4.7 step 3,
/// text followed literally over the original firmware's dedicated
/// `HID_CMD_ID_RETRY` message type — see DESIGN.md).
pub fn retry(message_type: u16) -> Message {
    Message::empty(message_type)
}

/// `NA`: a single `NA_BYTE` payload mirroring the incoming opcode, used where
/// the spec calls for "not allowed yet" rather than an ACK/NACK (e.g. a
/// throttled `CHECK_PASSWORD`, spec §8 concrete scenario 2) so the caller can
/// distinguish "too soon" from "wrong".
pub fn na(message_type: u16) -> Message {
    Message::new(message_type, vec![NA_BYTE])
}

/// A response carrying a fixed-size payload, for opcodes that reply with
/// data rather than a status byte.
pub fn empty_response(message_type: u16, size: usize) -> Message {
    Message::new(message_type, vec![0u8; size])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let msg = Message::new(0x0041, vec![1, 2, 3]);
        let bytes = msg.to_bytes();
        let (decoded, declared_len) = Message::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(declared_len as usize, msg.payload.len());
    }

    #[test]
    fn too_short_to_hold_a_header_fails_to_decode() {
        assert_eq!(Message::from_bytes(&[1, 2, 3]), None);
    }

    #[test]
    fn ack_and_nack_use_the_spec_byte_values() {
        assert_eq!(ack_nack(1, true).payload, vec![ACK_BYTE]);
        assert_eq!(ack_nack(1, false).payload, vec![NACK_BYTE]);
    }
}
