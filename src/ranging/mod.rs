// AutoFollow — microsecond ranging pipeline: pulse scheduling, echo
// capture, distance fusion, threshold classification.

pub mod scheduler;
pub mod sensor;
pub mod wake;

pub use scheduler::{FireLatch, OneShotTimer, TriggerScheduler};
pub use sensor::{EchoCapture, RangingSensor, TriggerLine};
pub use wake::WakeListener;
