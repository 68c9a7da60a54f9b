// AutoFollow — GPIO bindings for the ultrasonic front end.
//
// Trigger pins are plain push-pull outputs driven from task context.
// Echo pins are inputs with an any-edge interrupt; the handler timestamps
// both edges with the microsecond system timer and wakes the consuming
// task on the falling edge. The HAL's subscribe path runs callbacks too
// late for a 148 us/inch measurement, so echo capture goes through the
// raw ISR service instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use esp_idf_hal::delay::Ets;
use esp_idf_hal::gpio::{AnyIOPin, Input, Output, PinDriver};
use esp_idf_sys::{
    esp, esp_timer_get_time, gpio_get_level, gpio_install_isr_service, gpio_int_type_t_GPIO_INTR_ANYEDGE,
    gpio_isr_handler_add, gpio_isr_handler_remove, gpio_set_intr_type,
};

use crate::drivers::notify::WakeSlot;
use crate::ranging::sensor::{Edge, EchoCapture};
use crate::ranging::TriggerLine;

pub struct GpioTriggerLine {
    pin: PinDriver<'static, AnyIOPin, Output>,
}

impl GpioTriggerLine {
    /// # Safety contract
    /// `gpio` must be a pin number wired as a trigger output in the
    /// board map and not claimed by any other driver.
    pub fn new(gpio: i32) -> Result<Self> {
        let pin = PinDriver::output(unsafe { AnyIOPin::new(gpio) })
            .with_context(|| format!("claiming trigger gpio {gpio}"))?;
        Ok(Self { pin })
    }
}

impl TriggerLine for GpioTriggerLine {
    fn set_high(&mut self) -> Result<()> {
        self.pin.set_high()?;
        Ok(())
    }

    fn set_low(&mut self) -> Result<()> {
        self.pin.set_low()?;
        Ok(())
    }

    fn delay_us(&mut self, us: u32) {
        Ets::delay_us(us);
    }
}

struct EchoIsrContext {
    capture: Arc<EchoCapture>,
    slot: Arc<WakeSlot>,
    gpio: i32,
}

/// Runs on both edges of the echo pulse. Reads the pin to learn which
/// edge this is, stamps it, and wakes the consumer once the pulse closes.
unsafe extern "C" fn on_echo_edge(arg: *mut core::ffi::c_void) {
    let ctx = &*(arg as *const EchoIsrContext);
    let now_us = esp_timer_get_time() as u64;
    let level_high = gpio_get_level(ctx.gpio) != 0;
    if ctx.capture.on_edge(level_high, now_us) == Edge::Falling {
        ctx.slot.raise_from_isr();
    }
}

static ISR_SERVICE_READY: AtomicBool = AtomicBool::new(false);

fn ensure_isr_service() -> Result<()> {
    if !ISR_SERVICE_READY.swap(true, Ordering::SeqCst) {
        esp!(unsafe { gpio_install_isr_service(0) }).context("installing gpio isr service")?;
    }
    Ok(())
}

/// Echo input with its edge interrupt attached. Dropping detaches the
/// handler, but the rig keeps these alive for the life of the process.
pub struct EchoLine {
    _pin: PinDriver<'static, AnyIOPin, Input>,
    gpio: i32,
}

impl EchoLine {
    /// Claim `gpio` as an echo input and route its edges into `capture`,
    /// waking `slot` when a pulse completes. The handler context is
    /// leaked: the ISR may fire at any point for the rest of the run.
    pub fn attach(gpio: i32, capture: Arc<EchoCapture>, slot: Arc<WakeSlot>) -> Result<Self> {
        ensure_isr_service()?;
        let pin = PinDriver::input(unsafe { AnyIOPin::new(gpio) })
            .with_context(|| format!("claiming echo gpio {gpio}"))?;

        let ctx = Box::leak(Box::new(EchoIsrContext { capture, slot, gpio }));
        esp!(unsafe { gpio_set_intr_type(gpio, gpio_int_type_t_GPIO_INTR_ANYEDGE) })?;
        esp!(unsafe {
            gpio_isr_handler_add(
                gpio,
                Some(on_echo_edge),
                ctx as *mut EchoIsrContext as *mut core::ffi::c_void,
            )
        })
        .with_context(|| format!("attaching echo isr on gpio {gpio}"))?;

        log::debug!("echo interrupt armed on gpio {gpio}");
        Ok(Self { _pin: pin, gpio })
    }
}

impl Drop for EchoLine {
    fn drop(&mut self) {
        unsafe {
            gpio_isr_handler_remove(self.gpio);
        }
    }
}
