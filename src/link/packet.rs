// AutoFollow — Wire Packet
//
// Fixed-format datagram unit: one header byte, one ack byte, then a
// NUL-padded text payload. A node owns exactly one outgoing and one
// incoming instance, each overwritten in place, never queued.

use anyhow::{bail, Result};

use crate::config::LINK_PAYLOAD_LEN;
use crate::events::{AckMessage, Header};

/// Total size of an encoded frame on the air.
pub const FRAME_LEN: usize = 2 + LINK_PAYLOAD_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub ack: AckMessage,
    payload: [u8; LINK_PAYLOAD_LEN],
}

impl Packet {
    pub fn new(header: Header, ack: AckMessage, text: &str) -> Self {
        let mut pkt = Self {
            header,
            ack,
            payload: [0; LINK_PAYLOAD_LEN],
        };
        pkt.set_payload_text(text);
        pkt
    }

    /// Replace the payload with NUL-padded text, truncating if oversized.
    /// The final byte always stays NUL so the text remains terminated.
    pub fn set_payload_text(&mut self, text: &str) {
        self.payload = [0; LINK_PAYLOAD_LEN];
        let take = text.len().min(LINK_PAYLOAD_LEN - 1);
        self.payload[..take].copy_from_slice(&text.as_bytes()[..take]);
    }

    /// Payload text up to the first NUL. Non-UTF8 bytes render lossily.
    pub fn payload_text(&self) -> String {
        let end = self
            .payload
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(LINK_PAYLOAD_LEN);
        String::from_utf8_lossy(&self.payload[..end]).into_owned()
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut frame = [0u8; FRAME_LEN];
        frame[0] = self.header as u8;
        frame[1] = self.ack as u8;
        frame[2..].copy_from_slice(&self.payload);
        frame
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < 2 {
            bail!("frame too short ({} bytes)", frame.len());
        }
        let Some(header) = Header::from_wire(frame[0]) else {
            bail!("unknown header byte {}", frame[0]);
        };
        let Some(ack) = AckMessage::from_wire(frame[1]) else {
            bail!("unknown ack byte {}", frame[1]);
        };
        let mut payload = [0u8; LINK_PAYLOAD_LEN];
        let body = &frame[2..frame.len().min(FRAME_LEN)];
        payload[..body.len()].copy_from_slice(body);
        Ok(Self { header, ack, payload })
    }
}

impl Default for Packet {
    /// First thing either side would exchange: a handshake.
    fn default() -> Self {
        Self::new(
            Header::Handshake,
            AckMessage::ReceivedHandshake,
            "nothing exchanged",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_header_ack_and_text() {
        let pkt = Packet::new(Header::TriggerPing, AckMessage::ReceivedPing, "1480");
        let decoded = Packet::decode(&pkt.encode()).unwrap();
        assert_eq!(decoded.header, Header::TriggerPing);
        assert_eq!(decoded.ack, AckMessage::ReceivedPing);
        assert_eq!(decoded.payload_text(), "1480");
    }

    #[test]
    fn oversized_text_is_truncated_and_terminated() {
        let long = "x".repeat(LINK_PAYLOAD_LEN * 2);
        let pkt = Packet::new(Header::Handshake, AckMessage::ReceivedHandshake, &long);
        assert_eq!(pkt.payload_text().len(), LINK_PAYLOAD_LEN - 1);
    }

    #[test]
    fn rejects_garbage_frames() {
        assert!(Packet::decode(&[1]).is_err());
        assert!(Packet::decode(&[0xFF, b'H', 0, 0]).is_err());
        assert!(Packet::decode(&[11, 0xFF, 0, 0]).is_err());
    }

    #[test]
    fn short_frames_pad_with_nul() {
        let decoded = Packet::decode(&[14, b'G', b'h', b'i']).unwrap();
        assert_eq!(decoded.payload_text(), "hi");
    }
}
