// AutoFollow — firmware library for the two-node ultrasonic rig.
//
// One binary serves both boards; the `belt` feature selects the
// transmitter role, its absence the bot. The link and ranging cores are
// hardware-free behind capability traits; everything ESP-IDF lives under
// `drivers`.

pub mod config;
#[cfg(target_os = "espidf")]
pub mod device;
#[cfg(target_os = "espidf")]
pub mod drivers;
pub mod events;
pub mod link;
pub mod ranging;
#[cfg(target_os = "espidf")]
pub mod tasks;

#[cfg(target_os = "espidf")]
pub use device::Device;
