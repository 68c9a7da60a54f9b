// AutoFollow — esp_timer binding for the trigger scheduler.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use esp_idf_svc::timer::{EspTaskTimerService, EspTimer};

use crate::ranging::OneShotTimer;

/// One-shot wrapper over an esp_timer dispatched on the timer task. The
/// callback is fixed at construction; each `schedule` queues exactly one
/// future expiry.
pub struct EspOneShot {
    timer: Mutex<EspTimer<'static>>,
}

impl EspOneShot {
    pub fn new(
        service: &EspTaskTimerService,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<Self> {
        Ok(Self {
            timer: Mutex::new(service.timer(callback)?),
        })
    }
}

impl OneShotTimer for EspOneShot {
    fn schedule(&self, delay: Duration) -> Result<()> {
        match self.timer.lock() {
            Ok(mut timer) => {
                timer.after(delay)?;
                Ok(())
            }
            Err(_) => anyhow::bail!("trigger timer mutex poisoned"),
        }
    }

    fn cancel(&self) -> Result<()> {
        match self.timer.lock() {
            Ok(mut timer) => {
                timer.cancel()?;
                Ok(())
            }
            Err(_) => anyhow::bail!("trigger timer mutex poisoned"),
        }
    }
}
