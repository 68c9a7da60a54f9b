// AutoFollow — Trigger Scheduler
//
// One-shot delay timer that synchronizes pulse emission across the rig.
// The armed latch guarantees a single outstanding fire: re-arming while
// armed is a logged no-op, and the timer callback releases the latch
// before waking the ranging task chain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

/// One-shot hardware timer capability. The callback is fixed at
/// construction; scheduling decides only when it fires next.
pub trait OneShotTimer: Send + Sync {
    /// Schedule the callback to run once after `delay`.
    fn schedule(&self, delay: Duration) -> Result<()>;

    /// Cancel a pending fire, if any.
    fn cancel(&self) -> Result<()>;
}

/// Shared armed flag. One clone lives in the scheduler, another inside
/// the timer callback, which must `release()` first thing when it fires.
#[derive(Clone, Default)]
pub struct FireLatch(Arc<AtomicBool>);

impl FireLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the latch; fails if a fire is already pending.
    fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_armed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct TriggerScheduler<T: OneShotTimer> {
    timer: T,
    latch: FireLatch,
    delay: Duration,
}

impl<T: OneShotTimer> TriggerScheduler<T> {
    /// `latch` must be the same latch the timer's callback releases.
    pub fn new(timer: T, latch: FireLatch, delay: Duration) -> Self {
        Self { timer, latch, delay }
    }

    pub fn is_armed(&self) -> bool {
        self.latch.is_armed()
    }

    /// Arm one future fire. Rejected (false, logged) while already armed;
    /// exactly one callback executes per successful arm.
    pub fn arm(&self) -> Result<bool> {
        if !self.latch.try_acquire() {
            log::debug!("trigger timer already armed, ignoring re-arm");
            return Ok(false);
        }
        if let Err(e) = self.timer.schedule(self.delay) {
            self.latch.release();
            return Err(e);
        }
        Ok(true)
    }

    /// Cancellation capability: withdraw a pending fire and release the
    /// latch. Current operation never cancels, but the armed invariant
    /// holds either way.
    pub fn disarm(&self) -> Result<()> {
        self.timer.cancel()?;
        self.latch.release();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Manual timer: fires only when the test says so.
    #[derive(Clone, Default)]
    struct ManualTimer {
        scheduled: Arc<AtomicUsize>,
        cancelled: Arc<AtomicUsize>,
    }

    impl OneShotTimer for ManualTimer {
        fn schedule(&self, _delay: Duration) -> Result<()> {
            self.scheduled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn cancel(&self) -> Result<()> {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fire(latch: &FireLatch, woken: &AtomicUsize) {
        // What the real timer callback does: release, then wake.
        latch.release();
        woken.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn rearm_while_armed_is_rejected() {
        let timer = ManualTimer::default();
        let latch = FireLatch::new();
        let sched = TriggerScheduler::new(timer.clone(), latch.clone(), Duration::from_millis(38));

        assert!(sched.arm().unwrap());
        assert!(sched.is_armed());
        assert!(!sched.arm().unwrap());
        assert!(!sched.arm().unwrap());
        assert_eq!(timer.scheduled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exactly_one_fire_per_arm_then_rearmable() {
        let timer = ManualTimer::default();
        let latch = FireLatch::new();
        let woken = AtomicUsize::new(0);
        let sched = TriggerScheduler::new(timer.clone(), latch.clone(), Duration::from_millis(38));

        assert!(sched.arm().unwrap());
        fire(&latch, &woken);
        assert!(!sched.is_armed());
        assert_eq!(woken.load(Ordering::SeqCst), 1);

        assert!(sched.arm().unwrap());
        assert_eq!(timer.scheduled.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn disarm_releases_the_latch() {
        let timer = ManualTimer::default();
        let latch = FireLatch::new();
        let sched = TriggerScheduler::new(timer.clone(), latch, Duration::from_millis(38));

        assert!(sched.arm().unwrap());
        sched.disarm().unwrap();
        assert!(!sched.is_armed());
        assert_eq!(timer.cancelled.load(Ordering::SeqCst), 1);
        assert!(sched.arm().unwrap());
    }

    #[test]
    fn failed_schedule_does_not_leave_the_latch_stuck() {
        struct BrokenTimer;
        impl OneShotTimer for BrokenTimer {
            fn schedule(&self, _d: Duration) -> Result<()> {
                anyhow::bail!("no timer slot")
            }
            fn cancel(&self) -> Result<()> {
                Ok(())
            }
        }
        let sched = TriggerScheduler::new(BrokenTimer, FireLatch::new(), Duration::from_millis(38));
        assert!(sched.arm().is_err());
        assert!(!sched.is_armed());
    }
}
