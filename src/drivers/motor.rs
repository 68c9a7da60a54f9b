// AutoFollow — BTS7960 drive train, mapped but not yet engaged.
//
// The bot chassis carries two BTS7960 half-bridge drivers. Steering off
// the breach reports is a later milestone; for now the pins are claimed
// at init so nothing else grabs them, and the bridges are held disabled.

use anyhow::{Context, Result};
use esp_idf_hal::gpio::{AnyIOPin, Output, PinDriver};

pub struct DriveTrain {
    left_enable: PinDriver<'static, AnyIOPin, Output>,
    right_enable: PinDriver<'static, AnyIOPin, Output>,
}

impl DriveTrain {
    /// Claim the forward-PWM lines of both bridges and hold them low.
    /// `left` and `right` are the (forward, reverse) pin pairs from the
    /// board map; only the forward line is parked for now.
    pub fn new(left: (i32, i32), right: (i32, i32)) -> Result<Self> {
        let mut left_enable = PinDriver::output(unsafe { AnyIOPin::new(left.0) })
            .context("claiming left bridge pwm")?;
        let mut right_enable = PinDriver::output(unsafe { AnyIOPin::new(right.0) })
            .context("claiming right bridge pwm")?;
        left_enable.set_low()?;
        right_enable.set_low()?;
        log::info!("drive train mapped, bridges disabled");
        Ok(Self {
            left_enable,
            right_enable,
        })
    }

    /// Force both bridges off. Safe to call at any point.
    pub fn stop(&mut self) -> Result<()> {
        self.left_enable.set_low()?;
        self.right_enable.set_low()?;
        Ok(())
    }
}
