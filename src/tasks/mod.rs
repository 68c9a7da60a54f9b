// AutoFollow — long-running task bodies, spawned by the device layer.

pub mod comms;
pub mod ranging;
