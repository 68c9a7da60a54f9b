// AutoFollow — FreeRTOS task-notification plumbing.
//
// Each sensor or link task owns one `TaskWake` (the waiting side). The
// raising side lives in ISRs and timer callbacks, which only ever hold a
// `WakeSlot`: a lock-free mailbox the task publishes its notifier into
// during startup. Slots are created before the tasks exist, so interrupt
// wiring never races task spawn order.

use std::num::NonZeroU32;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use std::time::Duration;

use esp_idf_hal::delay::TickType;
use esp_idf_hal::task::notification::{Notification, Notifier};

use crate::ranging::WakeListener;

/// Wake target publishable from a task and raisable from interrupt
/// context. Holds the notification bits the consumer expects, so raisers
/// never need to know who is on the other end.
pub struct WakeSlot {
    notifier: AtomicPtr<Notifier>,
    bits: NonZeroU32,
}

impl WakeSlot {
    pub fn new(bits: NonZeroU32) -> Self {
        Self {
            notifier: AtomicPtr::new(ptr::null_mut()),
            bits,
        }
    }

    pub fn bits(&self) -> NonZeroU32 {
        self.bits
    }

    pub fn is_published(&self) -> bool {
        !self.notifier.load(Ordering::Acquire).is_null()
    }

    /// Install the task-side notifier. Called once from the consuming
    /// task before it starts waiting; replacing an earlier notifier
    /// drops the old reference.
    fn publish(&self, notifier: Arc<Notifier>) {
        let fresh = Arc::into_raw(notifier) as *mut Notifier;
        let prev = self.notifier.swap(fresh, Ordering::AcqRel);
        if !prev.is_null() {
            unsafe { drop(Arc::from_raw(prev)) };
        }
    }

    /// Wake the registered task from thread or timer-callback context.
    /// Silently a no-op until the consumer has published.
    pub fn raise(&self) {
        let notifier = self.notifier.load(Ordering::Acquire);
        if !notifier.is_null() {
            unsafe {
                (*notifier).notify(self.bits);
            }
        }
    }

    /// Wake the registered task from an ISR, requesting a context switch
    /// if the woken task outranks the interrupted one.
    pub fn raise_from_isr(&self) {
        let notifier = self.notifier.load(Ordering::Acquire);
        if !notifier.is_null() {
            unsafe {
                (*notifier).notify_and_yield(self.bits);
            }
        }
    }
}

/// The waiting half, owned by exactly one task. FreeRTOS direct-to-task
/// notifications require the waiter to be the task that created the
/// notification, hence construction inside the task entry function.
pub struct TaskWake {
    notification: Notification,
}

impl TaskWake {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            notification: Notification::new(),
        }
    }

    /// Publish this task's notifier into `slot` so interrupts can reach
    /// it. One task may register with several slots (distinct bits).
    pub fn register(&self, slot: &WakeSlot) {
        slot.publish(self.notification.notifier());
    }
}

impl WakeListener for TaskWake {
    fn wait(&self, max_wait: Duration) -> Option<NonZeroU32> {
        self.notification.wait(TickType::from(max_wait).ticks())
    }

    fn wait_forever(&self) -> NonZeroU32 {
        loop {
            if let Some(bits) = self.notification.wait(esp_idf_hal::delay::BLOCK) {
                return bits;
            }
        }
    }
}
