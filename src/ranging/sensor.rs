// AutoFollow — Ranging Sensor
//
// One trigger/echo pin pair: emits the standard ultrasonic trigger
// waveform, suspends until the echo ISR captures both edges, converts the
// pulse width to inches, and fuses repeated readings through a short
// history window with hysteresis threshold classification.
//
// Interrupt-context code is confined to `EchoCapture::on_edge`: timestamp
// stores and nothing else. The driver layer raises the task wake on the
// falling edge.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::config::{
    DISTANCE_WINDOW_LEN, PRESENCE_BASELINE_IN, PRESENCE_STRONG_RATIO, PRESENCE_TRIGGER_RATIO,
    PRESENCE_WEAK_RATIO, US_ROUND_TRIP_PER_INCH,
};
use crate::events::{echo_bits, BreachFlags, SensorId};
use crate::ranging::wake::WakeListener;

// ---------------------------------------------------------------------------
// Trigger pin capability
// ---------------------------------------------------------------------------

/// Digital output driving the sensor's trigger pin, with the busy-wait
/// delay needed to shape the pulse.
pub trait TriggerLine: Send {
    fn set_high(&mut self) -> Result<()>;
    fn set_low(&mut self) -> Result<()>;
    fn delay_us(&mut self, us: u32);
}

// ---------------------------------------------------------------------------
// Interrupt-captured echo edges
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

/// The only state shared between a sensor and its echo-pin ISR.
#[derive(Default)]
pub struct EchoCapture {
    pulse_start: AtomicU64,
    pulse_end: AtomicU64,
    /// Set once the owning task has published its wake channel; until
    /// then a read would suspend with nobody to wake it.
    consumer_ready: AtomicBool,
}

impl EchoCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one echo-pin transition. Interrupt context: timestamp
    /// arithmetic only, never blocks.
    pub fn on_edge(&self, level_high: bool, now_us: u64) -> Edge {
        if level_high {
            self.pulse_start.store(now_us, Ordering::Release);
            Edge::Rising
        } else {
            self.pulse_end.store(now_us, Ordering::Release);
            Edge::Falling
        }
    }

    /// Echo width in microseconds. Saturating keeps a torn capture from
    /// producing a wild negative width.
    pub fn pulse_width_us(&self) -> u64 {
        let start = self.pulse_start.load(Ordering::Acquire);
        let end = self.pulse_end.load(Ordering::Acquire);
        end.saturating_sub(start)
    }

    pub fn mark_consumer_ready(&self) {
        self.consumer_ready.store(true, Ordering::Release);
    }

    pub fn consumer_ready(&self) -> bool {
        self.consumer_ready.load(Ordering::Acquire)
    }
}

/// Pulse-width-to-distance conversion: sound travels a round trip, 74 µs
/// per inch each way.
pub fn width_to_inches(width_us: u64) -> f32 {
    width_us as f32 / 2.0 / US_ROUND_TRIP_PER_INCH
}

// ---------------------------------------------------------------------------
// Distance history
// ---------------------------------------------------------------------------

/// Fixed-capacity circular buffer of past readings, overwritten
/// oldest-first. Averages run over populated slots only, so the first few
/// readings are not dragged down by empty slots.
#[derive(Debug, Clone)]
pub struct DistanceWindow {
    slots: [f32; DISTANCE_WINDOW_LEN],
    next: usize,
    filled: usize,
}

impl DistanceWindow {
    pub fn new() -> Self {
        Self {
            slots: [0.0; DISTANCE_WINDOW_LEN],
            next: 0,
            filled: 0,
        }
    }

    pub fn push(&mut self, value: f32) {
        self.slots[self.next] = value;
        self.next = (self.next + 1) % DISTANCE_WINDOW_LEN;
        self.filled = (self.filled + 1).min(DISTANCE_WINDOW_LEN);
    }

    pub fn average(&self) -> f32 {
        if self.filled == 0 {
            return 0.0;
        }
        let sum: f32 = self.slots[..self.filled].iter().sum();
        sum / self.filled as f32
    }

    /// Most recent reading, if any.
    pub fn latest(&self) -> Option<f32> {
        if self.filled == 0 {
            return None;
        }
        let last = (self.next + DISTANCE_WINDOW_LEN - 1) % DISTANCE_WINDOW_LEN;
        Some(self.slots[last])
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }
}

impl Default for DistanceWindow {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Sensor
// ---------------------------------------------------------------------------

pub struct RangingSensor<T: TriggerLine> {
    id: SensorId,
    trigger: T,
    capture: Arc<EchoCapture>,
    wake_bits: NonZeroU32,
    active: bool,
    obstacle_threshold: f32,
    presence_threshold: f32,
    window: DistanceWindow,
    last_window_average: f32,
}

impl<T: TriggerLine> RangingSensor<T> {
    pub fn new(id: SensorId, trigger: T, capture: Arc<EchoCapture>, obstacle_threshold: f32) -> Self {
        Self {
            id,
            trigger,
            capture,
            wake_bits: echo_bits(id),
            active: false,
            obstacle_threshold,
            presence_threshold: PRESENCE_BASELINE_IN,
            window: DistanceWindow::new(),
            last_window_average: 0.0,
        }
    }

    /// Drive the trigger line to its idle (low) state and mark the sensor
    /// active for reads and threshold checks.
    pub fn init(&mut self) -> Result<()> {
        self.trigger.set_low()?;
        self.active = true;
        Ok(())
    }

    pub fn id(&self) -> SensorId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn enable(&mut self) {
        self.active = true;
    }

    pub fn disable(&mut self) {
        self.active = false;
    }

    pub fn obstacle_threshold(&self) -> f32 {
        self.obstacle_threshold
    }

    pub fn set_obstacle_threshold(&mut self, threshold: f32) {
        self.obstacle_threshold = threshold;
    }

    pub fn presence_threshold(&self) -> f32 {
        self.presence_threshold
    }

    pub fn capture(&self) -> &Arc<EchoCapture> {
        &self.capture
    }

    /// Mark that the owning task has published a wake channel for this
    /// sensor's interrupts.
    pub fn bind_consumer(&self) {
        self.capture.mark_consumer_ready();
    }

    pub fn latest(&self) -> Option<f32> {
        self.window.latest()
    }

    pub fn window_average(&self) -> f32 {
        self.window.average()
    }

    pub fn last_window_average(&self) -> f32 {
        self.last_window_average
    }

    /// The standard trigger waveform: settle low 5 µs, assert 10 µs, drop.
    fn emit_pulse(&mut self) -> Result<()> {
        self.trigger.set_low()?;
        self.trigger.delay_us(5);
        self.trigger.set_high()?;
        self.trigger.delay_us(10);
        self.trigger.set_low()?;
        Ok(())
    }

    /// Emit a pulse and suspend until the echo interrupt raises this
    /// sensor's wake bits or `max_wait` elapses.
    ///
    /// `Ok(None)` is the expected no-echo outcome (target out of range or
    /// echo missed) and skips fusion for this cycle. An inactive sensor or
    /// missing wake consumer is a wiring mistake and fails outright.
    pub fn read(&mut self, wake: &dyn WakeListener, max_wait: Duration) -> Result<Option<f32>> {
        if !self.active {
            bail!("invalid read: sensor {:?} inactive", self.id);
        }
        if !self.capture.consumer_ready() {
            bail!("invalid read: sensor {:?} has no wake consumer", self.id);
        }

        self.emit_pulse()?;

        match wake.wait(max_wait) {
            Some(bits) if bits.get() & self.wake_bits.get() != 0 => {
                let inches = width_to_inches(self.capture.pulse_width_us());
                self.last_window_average = self.window.average();
                self.window.push(inches);
                Ok(Some(inches))
            }
            // A stray wake (wrong bits) counts the same as no echo.
            _ => Ok(None),
        }
    }

    /// Classify the current state against both detection thresholds.
    ///
    /// - OBSTACLE: the most recent reading (not the average) is at or
    ///   inside the obstacle limit.
    /// - PRESENCE: the window average deviates from the presence baseline
    ///   by at least 2 %, graded STRONG/MODERATE/WEAK by how far the
    ///   average moved since the previous read's snapshot.
    pub fn passed_threshold(&self) -> BreachFlags {
        let mut flags = BreachFlags::empty();
        if !self.active {
            return flags;
        }
        let Some(latest) = self.window.latest() else {
            return flags;
        };

        if latest <= self.obstacle_threshold {
            flags.set(BreachFlags::OBSTACLE);
        }

        let current_avg = self.window.average();
        if current_avg <= 0.0 {
            return flags;
        }
        let deviation = (self.presence_threshold / current_avg - 1.0).abs();
        if deviation >= PRESENCE_TRIGGER_RATIO {
            flags.set(BreachFlags::PRESENCE);

            // A first-ever classification has no meaningful prior average;
            // treat the jump from nothing as maximal motion.
            let delta = if self.last_window_average > 0.0 {
                (current_avg - self.last_window_average).abs() / self.last_window_average
            } else {
                f32::INFINITY
            };
            if delta > PRESENCE_STRONG_RATIO {
                flags.set(BreachFlags::STRONG);
            } else if delta < PRESENCE_WEAK_RATIO {
                flags.set(BreachFlags::WEAK);
            } else {
                flags.set(BreachFlags::MODERATE);
            }
        }
        flags
    }

    #[cfg(test)]
    fn seed(&mut self, readings: &[f32], last_window_average: f32) {
        for &r in readings {
            self.window.push(r);
        }
        self.last_window_average = last_window_average;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedTrigger {
        ops: Vec<String>,
    }

    impl TriggerLine for ScriptedTrigger {
        fn set_high(&mut self) -> Result<()> {
            self.ops.push("high".into());
            Ok(())
        }
        fn set_low(&mut self) -> Result<()> {
            self.ops.push("low".into());
            Ok(())
        }
        fn delay_us(&mut self, us: u32) {
            self.ops.push(format!("wait{us}"));
        }
    }

    /// Stands in for the echo ISR: on wait, plays back a scripted pulse
    /// width into the capture and raises the given bits.
    struct EchoScript {
        capture: Arc<EchoCapture>,
        widths: Mutex<Vec<Option<u64>>>,
        bits: u32,
    }

    impl WakeListener for EchoScript {
        fn wait(&self, _max_wait: Duration) -> Option<NonZeroU32> {
            let width = self.widths.lock().unwrap().pop().flatten()?;
            self.capture.on_edge(true, 10_000);
            self.capture.on_edge(false, 10_000 + width);
            NonZeroU32::new(self.bits)
        }

        fn wait_forever(&self) -> NonZeroU32 {
            self.wait(Duration::MAX).unwrap()
        }
    }

    fn rig(id: SensorId, widths: Vec<Option<u64>>, bits: u32) -> (RangingSensor<ScriptedTrigger>, EchoScript) {
        let capture = Arc::new(EchoCapture::new());
        let mut sensor = RangingSensor::new(id, ScriptedTrigger::default(), capture.clone(), 30.0);
        sensor.init().unwrap();
        sensor.bind_consumer();
        let script = EchoScript {
            capture,
            widths: Mutex::new(widths),
            bits,
        };
        (sensor, script)
    }

    const MAX_WAIT: Duration = Duration::from_millis(40);

    #[test]
    fn converts_pulse_width_to_inches() {
        // 1480 µs round trip -> exactly 10 inches.
        let (mut sensor, wake) = rig(
            SensorId::TxTransducer,
            vec![Some(1480)],
            crate::events::notify::TX_ECHO_READY,
        );
        let reading = sensor.read(&wake, MAX_WAIT).unwrap();
        assert_eq!(reading, Some(10.0));
        assert_eq!(sensor.latest(), Some(10.0));
    }

    #[test]
    fn trigger_waveform_is_low_5us_high_10us_low() {
        let (mut sensor, wake) = rig(
            SensorId::TxTransducer,
            vec![Some(1480)],
            crate::events::notify::TX_ECHO_READY,
        );
        sensor.trigger.ops.clear();
        sensor.read(&wake, MAX_WAIT).unwrap();
        assert_eq!(sensor.trigger.ops, ["low", "wait5", "high", "wait10", "low"]);
    }

    #[test]
    fn window_averages_five_then_overwrites_oldest() {
        let widths: Vec<Option<u64>> = (1..=6).rev().map(|i| Some(148 * i as u64)).collect();
        let (mut sensor, wake) = rig(
            SensorId::LeftRxTransducer,
            widths,
            crate::events::notify::LEFT_ECHO_READY,
        );
        // Readings come out as 1.0, 2.0 ... 6.0 inches.
        for _ in 0..5 {
            sensor.read(&wake, MAX_WAIT).unwrap();
        }
        assert_eq!(sensor.window_average(), 3.0); // mean(1..=5)
        sensor.read(&wake, MAX_WAIT).unwrap();
        assert_eq!(sensor.window_average(), 4.0); // mean(2..=6), oldest gone
        assert_eq!(sensor.last_window_average(), 3.0);
    }

    #[test]
    fn timeout_is_a_non_error_and_skips_fusion() {
        let (mut sensor, wake) = rig(
            SensorId::RightRxTransducer,
            vec![None],
            crate::events::notify::RIGHT_ECHO_READY,
        );
        assert_eq!(sensor.read(&wake, MAX_WAIT).unwrap(), None);
        assert!(sensor.latest().is_none());
    }

    #[test]
    fn foreign_wake_bits_count_as_no_echo() {
        let (mut sensor, wake) = rig(
            SensorId::LeftObstacle,
            vec![Some(1480)],
            crate::events::notify::TRIGGER_TICK, // not this sensor's echo bit
        );
        assert_eq!(sensor.read(&wake, MAX_WAIT).unwrap(), None);
    }

    #[test]
    fn inactive_or_unbound_sensor_short_circuits() {
        let capture = Arc::new(EchoCapture::new());
        let mut sensor = RangingSensor::new(
            SensorId::LeftObstacle,
            ScriptedTrigger::default(),
            capture.clone(),
            30.0,
        );
        let wake = EchoScript {
            capture,
            widths: Mutex::new(vec![Some(1480)]),
            bits: crate::events::notify::LEFT_OBS_READY,
        };
        // Not initialised -> inactive.
        assert!(sensor.read(&wake, MAX_WAIT).is_err());
        sensor.init().unwrap();
        // Active but no wake consumer published.
        assert!(sensor.read(&wake, MAX_WAIT).is_err());
        sensor.bind_consumer();
        assert!(sensor.read(&wake, MAX_WAIT).is_ok());
    }

    #[test]
    fn obstacle_flag_checks_latest_reading_not_average() {
        let (mut sensor, _) = rig(SensorId::LeftObstacle, vec![], 0);
        sensor.set_obstacle_threshold(10.0);
        sensor.seed(&[50.0, 50.0, 50.0, 50.0, 9.0], 50.0);
        assert!(sensor.passed_threshold().contains(BreachFlags::OBSTACLE));
    }

    #[test]
    fn presence_confidence_grading() {
        // Baseline 10.0, current average 10.3 (~2.9 % deviation).
        let cases = [
            (9.0, BreachFlags::STRONG),   // moved 14.4 % since last window
            (10.2, BreachFlags::WEAK),    // moved ~0.98 %
            (9.6, BreachFlags::MODERATE), // moved ~7.3 %
        ];
        for (prior_avg, expected) in cases {
            let (mut sensor, _) = rig(SensorId::RightObstacle, vec![], 0);
            sensor.seed(&[10.3; 5], prior_avg);
            let flags = sensor.passed_threshold();
            assert!(flags.contains(BreachFlags::PRESENCE), "prior {prior_avg}");
            assert!(flags.contains(expected), "prior {prior_avg}: {flags:?}");
        }
    }

    #[test]
    fn presence_needs_two_percent_deviation() {
        let (mut sensor, _) = rig(SensorId::RightObstacle, vec![], 0);
        sensor.seed(&[10.1; 5], 10.1); // <1 % off baseline
        assert!(!sensor.passed_threshold().contains(BreachFlags::PRESENCE));
    }

    #[test]
    fn empty_window_and_inactive_sensor_report_nothing() {
        let (mut sensor, _) = rig(SensorId::LeftObstacle, vec![], 0);
        assert!(sensor.passed_threshold().is_empty());
        sensor.seed(&[5.0], 0.0);
        sensor.disable();
        assert!(sensor.passed_threshold().is_empty());
    }
}
