// AutoFollow — ESP-IDF bindings for the capability traits used by the
// link and ranging cores.

pub mod espnow;
pub mod gpio;
pub mod motor;
pub mod notify;
pub mod timer;
