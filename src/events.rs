// AutoFollow — Shared Protocol & Sensor Types

use std::num::NonZeroU32;

// ---------------------------------------------------------------------------
// Device role
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Wearable belt: drives the header sequence and emits ranging pulses.
    Transmitter,
    /// Mobile bot: acknowledges and listens with two rx transducers.
    Receiver,
}

// ---------------------------------------------------------------------------
// Wire enums
// ---------------------------------------------------------------------------

/// Kind of data a packet carries. Values are fixed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Header {
    /// Bare acknowledgement of the previously received message.
    Ack = 10,
    /// Connection establishing message.
    Handshake = 11,
    /// Connection terminating message.
    Wave = 13,
    /// A trigger event is about to happen.
    TriggerPing = 14,
}

impl Header {
    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            10 => Some(Self::Ack),
            11 => Some(Self::Handshake),
            13 => Some(Self::Wave),
            14 => Some(Self::TriggerPing),
            _ => None,
        }
    }
}

/// Kind of data last received by the sending node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckMessage {
    ReceivedHandshake = b'H',
    ReceivedWave = b'W',
    ReceivedPing = b'G',
}

impl AckMessage {
    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            b'H' => Some(Self::ReceivedHandshake),
            b'W' => Some(Self::ReceivedWave),
            b'G' => Some(Self::ReceivedPing),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Sensor identity
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorId {
    /// Transmitter-side ranging transducer.
    TxTransducer,
    /// Receiver left ranging transducer.
    LeftRxTransducer,
    /// Receiver right ranging transducer.
    RightRxTransducer,
    /// Receiver left fixed obstacle sensor.
    LeftObstacle,
    /// Receiver right fixed obstacle sensor.
    RightObstacle,
}

impl SensorId {
    pub fn is_transducer(self) -> bool {
        !matches!(self, Self::LeftObstacle | Self::RightObstacle)
    }
}

// ---------------------------------------------------------------------------
// Task-notification bits: one distinct identity per wake consumer so an
// interrupt-raised signal is never ambiguous about who it was meant for.
// ---------------------------------------------------------------------------
pub mod notify {
    use std::num::NonZeroU32;

    pub const TX_ECHO_READY: u32 = 0x0001;
    pub const TRIGGER_TICK: u32 = 0x0002;
    pub const LINK_RX_READY: u32 = 0x0004;
    pub const LEFT_OBS_READY: u32 = 0x0010;
    pub const RIGHT_OBS_READY: u32 = 0x0020;
    pub const LEFT_ECHO_READY: u32 = 0x0100;
    pub const RIGHT_ECHO_READY: u32 = 0x1000;

    pub fn bits(mask: u32) -> NonZeroU32 {
        NonZeroU32::new(mask).unwrap_or(NonZeroU32::new(1).unwrap())
    }
}

/// Wake bits assigned to a sensor's echo interrupt.
pub fn echo_bits(id: SensorId) -> NonZeroU32 {
    let mask = match id {
        SensorId::TxTransducer => notify::TX_ECHO_READY,
        SensorId::LeftRxTransducer => notify::LEFT_ECHO_READY,
        SensorId::RightRxTransducer => notify::RIGHT_ECHO_READY,
        SensorId::LeftObstacle => notify::LEFT_OBS_READY,
        SensorId::RightObstacle => notify::RIGHT_OBS_READY,
    };
    notify::bits(mask)
}

// ---------------------------------------------------------------------------
// Threshold breach flags
// ---------------------------------------------------------------------------

/// Bitmask describing which detection thresholds a sensor has passed and,
/// for presence, the confidence of the breach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BreachFlags(u8);

impl BreachFlags {
    pub const OBSTACLE: u8 = 0x01;
    pub const PRESENCE: u8 = 0x02;
    pub const WEAK: u8 = 0x04;
    pub const MODERATE: u8 = 0x08;
    pub const STRONG: u8 = 0x10;

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn set(&mut self, mask: u8) {
        self.0 |= mask;
    }

    pub fn contains(self, mask: u8) -> bool {
        self.0 & mask == mask
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn raw(self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for BreachFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let mut first = true;
        for (mask, name) in [
            (Self::OBSTACLE, "obstacle"),
            (Self::PRESENCE, "presence"),
            (Self::WEAK, "weak"),
            (Self::MODERATE, "moderate"),
            (Self::STRONG, "strong"),
        ] {
            if self.contains(mask) {
                if !first {
                    write!(f, "+")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}
