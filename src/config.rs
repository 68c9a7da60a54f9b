// AutoFollow — Hardware & System Configuration
// Targets: ESP32 (4MB) and ESP32-S3 (8MB) boards, selected by feature flag.

use crate::events::Role;

// ---------------------------------------------------------------------------
// Board selection
// ---------------------------------------------------------------------------

/// Which SoC variant this image is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocConfig {
    Esp32_4mb,
    Esp32S3_8mb,
}

pub const SOC_IN_USE: SocConfig = if cfg!(feature = "soc-esp32") {
    SocConfig::Esp32_4mb
} else {
    SocConfig::Esp32S3_8mb
};

/// Role this image plays in the two-node rig.
pub const DEVICE_ROLE: Role = if cfg!(feature = "belt") {
    Role::Transmitter
} else {
    Role::Receiver
};

// ---------------------------------------------------------------------------
// GPIO Pin Assignments
// ---------------------------------------------------------------------------

/// Trigger/echo pin pair of one ultrasonic sensor.
#[derive(Debug, Clone, Copy)]
pub struct PinPair {
    pub trigger: i32,
    pub echo: i32,
}

/// Belt (transmitter) pin table: one tx transducer.
pub struct BeltPins {
    pub transducer: PinPair,
}

/// Bot (receiver) pin table: two rx transducers, two fixed obstacle
/// sensors, and the drive-train PWM pins.
pub struct BotPins {
    pub left_transducer: PinPair,
    pub right_transducer: PinPair,
    pub left_obstacle: PinPair,
    pub right_obstacle: PinPair,
    pub left_motor_pwm: (i32, i32),
    pub right_motor_pwm: (i32, i32),
}

pub const fn belt_pins(soc: SocConfig) -> BeltPins {
    match soc {
        SocConfig::Esp32_4mb => BeltPins {
            transducer: PinPair { trigger: 36, echo: 39 },
        },
        SocConfig::Esp32S3_8mb => BeltPins {
            transducer: PinPair { trigger: 4, echo: 5 },
        },
    }
}

pub const fn bot_pins(soc: SocConfig) -> BotPins {
    match soc {
        SocConfig::Esp32_4mb => BotPins {
            left_transducer: PinPair { trigger: 36, echo: 39 },
            right_transducer: PinPair { trigger: 25, echo: 26 },
            left_obstacle: PinPair { trigger: 34, echo: 35 },
            right_obstacle: PinPair { trigger: 32, echo: 33 },
            left_motor_pwm: (27, 14),
            right_motor_pwm: (17, 16),
        },
        SocConfig::Esp32S3_8mb => BotPins {
            left_transducer: PinPair { trigger: 4, echo: 5 },
            right_transducer: PinPair { trigger: 13, echo: 14 },
            left_obstacle: PinPair { trigger: 6, echo: 7 },
            right_obstacle: PinPair { trigger: 15, echo: 16 },
            left_motor_pwm: (17, 18),
            right_motor_pwm: (40, 41),
        },
    }
}

// ---------------------------------------------------------------------------
// Wireless link
// ---------------------------------------------------------------------------
pub const WIRELESS_CHANNEL: u8 = 6; // Wi-Fi channel the rig communicates on.
pub const LINK_PAYLOAD_LEN: usize = 64; // Packet payload capacity (bytes).

// Station MAC addresses of the paired boards.
pub const DEV_S3_A: [u8; 6] = [0x24, 0xEC, 0x4A, 0x09, 0xC8, 0x00];
pub const DEV_S3_B: [u8; 6] = [0x24, 0xEC, 0x4A, 0x09, 0xC8, 0xC8];
pub const DEV_C: [u8; 6] = [0x10, 0x06, 0x1C, 0x97, 0x94, 0x38];
pub const DEV_D: [u8; 6] = [0x10, 0x06, 0x1C, 0x98, 0x56, 0x28];

/// Peer this image talks to: belt and bot each carry the other's MAC.
pub const fn peer_address(role: Role, soc: SocConfig) -> [u8; 6] {
    match (role, soc) {
        (Role::Transmitter, SocConfig::Esp32S3_8mb) => DEV_S3_A,
        (Role::Receiver, SocConfig::Esp32S3_8mb) => DEV_S3_B,
        (Role::Transmitter, SocConfig::Esp32_4mb) => DEV_C,
        (Role::Receiver, SocConfig::Esp32_4mb) => DEV_D,
    }
}

// ---------------------------------------------------------------------------
// Timing (milliseconds unless noted)
// ---------------------------------------------------------------------------
pub const LINK_CYCLE_DELAY_MS: u64 = 100; // Inter-cycle delay of the comms loop.
pub const ACK_TIMEOUT_MS: u64 = 10_000; // Stale flow-control gate release.
pub const RESTART_GRACE_MS: u64 = 5_000; // Pause before restart on bring-up failure.
pub const US_READ_TIME_MS: u64 = 40; // Max wait for one ultrasonic echo.
pub const TRIGGER_LEAD_MS: u64 = US_READ_TIME_MS - 2; // One-shot delay before pulse emission.
pub const OBSTACLE_POLL_INTERVAL_MS: u64 = (4 * US_READ_TIME_MS) + 10;
pub const PROCESS_WAKE_POLL_MS: u64 = 1_000; // Pause-flag recheck period of the processing task.

// ---------------------------------------------------------------------------
// Task Stack Sizes (bytes)
// ---------------------------------------------------------------------------
pub const STACK_LINK: usize = 8192;
pub const STACK_RANGING: usize = 6000;
pub const STACK_OBSTACLE: usize = 6000;

// ---------------------------------------------------------------------------
// Detection thresholds
// ---------------------------------------------------------------------------
pub const OBSTACLE_LIMIT_IN: f32 = 30.0; // Obstacle detection limit (inches).
pub const PRESENCE_BASELINE_IN: f32 = 10.0; // Presence estimation baseline (inches).
pub const PRESENCE_TRIGGER_RATIO: f32 = 0.02; // Relative deviation that flags presence.
pub const PRESENCE_WEAK_RATIO: f32 = 0.05; // Below this inter-average delta: weak breach.
pub const PRESENCE_STRONG_RATIO: f32 = 0.10; // Above this inter-average delta: strong breach.

/// Round-trip microseconds of sound per inch; distance = width / 2 / 74.
pub const US_ROUND_TRIP_PER_INCH: f32 = 74.0;

/// Distance history window per sensor (readings).
pub const DISTANCE_WINDOW_LEN: usize = 5;
