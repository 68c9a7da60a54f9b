// AutoFollow — ranging task bodies.
//
// Transducer reads are serialized across the whole rig: the trigger
// timer wakes only the head of the chain, and each task passes the baton
// to the next after its own read completes. Two transducers firing into
// the same airspace at once would read each other's pulses.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::{OBSTACLE_POLL_INTERVAL_MS, US_READ_TIME_MS};
use crate::drivers::notify::{TaskWake, WakeSlot};
use crate::events::{notify, BreachFlags, SensorId};
use crate::ranging::{RangingSensor, TriggerLine, WakeListener};

/// Everything one transducer task needs: the sensor itself, the slot its
/// trigger tick arrives on, the slot its echo ISR raises, and optionally
/// the next task's tick slot to chain into.
pub struct TransducerTask<L: TriggerLine> {
    pub sensor: RangingSensor<L>,
    pub tick: Arc<WakeSlot>,
    pub echo: Arc<WakeSlot>,
    pub chain: Option<Arc<WakeSlot>>,
}

pub fn transducer_loop<L: TriggerLine>(
    mut task: TransducerTask<L>,
    mut report: impl FnMut(SensorId, f32, f32, BreachFlags),
) -> ! {
    let wake = TaskWake::new();
    wake.register(&task.tick);
    wake.register(&task.echo);
    task.sensor.bind_consumer();
    let id = task.sensor.id();
    log::info!("{id:?} ranging task up");

    loop {
        let bits = wake.wait_forever();
        if bits.get() & notify::TRIGGER_TICK == 0 {
            // An echo edge with no pending tick; stale, ignore it.
            continue;
        }
        match task
            .sensor
            .read(&wake, Duration::from_millis(US_READ_TIME_MS))
        {
            Ok(Some(inches)) => {
                report(
                    id,
                    inches,
                    task.sensor.window_average(),
                    task.sensor.passed_threshold(),
                );
            }
            Ok(None) => log::debug!("{id:?}: no echo this cycle"),
            Err(e) => log::error!("{id:?}: read failed: {e}"),
        }
        if let Some(next) = &task.chain {
            next.raise();
        }
    }
}

/// Poll the fixed obstacle sensors one after the other. These are
/// self-contained trigger/echo reads with no wireless synchronization,
/// so a plain periodic loop is enough.
pub fn obstacle_loop<L: TriggerLine>(
    mut sensors: Vec<(RangingSensor<L>, Arc<WakeSlot>)>,
    mut report: impl FnMut(SensorId, f32, f32, BreachFlags),
) -> ! {
    let wake = TaskWake::new();
    for (sensor, echo_slot) in &sensors {
        wake.register(echo_slot);
        sensor.bind_consumer();
    }
    log::info!("obstacle watch up ({} sensors)", sensors.len());

    loop {
        for (sensor, _) in sensors.iter_mut() {
            match sensor.read(&wake, Duration::from_millis(US_READ_TIME_MS)) {
                Ok(Some(inches)) => {
                    let flags = sensor.passed_threshold();
                    if !flags.is_empty() {
                        report(sensor.id(), inches, sensor.window_average(), flags);
                    }
                }
                Ok(None) => log::debug!("{:?}: no echo this cycle", sensor.id()),
                Err(e) => log::error!("{:?}: read failed: {e}", sensor.id()),
            }
        }
        thread::sleep(Duration::from_millis(OBSTACLE_POLL_INTERVAL_MS));
    }
}
