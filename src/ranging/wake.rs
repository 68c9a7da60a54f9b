// AutoFollow — task wake-up capability.
//
// Sensor tasks suspend on a notify-and-wake primitive owned one-to-one by
// the task; interrupt handlers and the trigger timer reach it through the
// driver layer. This trait is only the waiting half; raising happens on
// the concrete channel, so nothing here needs to be interrupt-safe.

use std::num::NonZeroU32;
use std::time::Duration;

pub trait WakeListener {
    /// Suspend the calling task until woken or `max_wait` elapses.
    /// Returns the accumulated notification bits, or `None` on timeout.
    fn wait(&self, max_wait: Duration) -> Option<NonZeroU32>;

    /// Suspend with no deadline.
    fn wait_forever(&self) -> NonZeroU32;
}
