// AutoFollow — Firmware Entry Point
//
// Boot sequence:
//   1. Bring up the Wi-Fi carrier and the ESP-NOW link to the peer.
//   2. Map this role's sensors and park every trigger line low.
//   3. Attach the echo-edge interrupts.
//   4. Wire the link callbacks and start the protocol node.
//   5. Spawn the link workers and the ranging tasks.
//
// Any bring-up failure logs, waits out a grace period, and restarts the
// chip; a half-configured node would otherwise wedge the whole rig.

#[cfg(target_os = "espidf")]
use std::thread;
#[cfg(target_os = "espidf")]
use std::time::Duration;

#[cfg(target_os = "espidf")]
use anyhow::Result;
#[cfg(target_os = "espidf")]
use esp_idf_hal::prelude::*;
#[cfg(target_os = "espidf")]
use esp_idf_svc::eventloop::EspSystemEventLoop;
#[cfg(target_os = "espidf")]
use esp_idf_svc::nvs::EspDefaultNvsPartition;

#[cfg(target_os = "espidf")]
use autofollow::config::RESTART_GRACE_MS;
#[cfg(target_os = "espidf")]
use autofollow::Device;

// The firmware entry point only exists on the espidf target; off-target
// builds (host-side `cargo test`) get an empty stub so the bin links.
#[cfg(not(target_os = "espidf"))]
fn main() {}

#[cfg(target_os = "espidf")]
fn main() {
    // Link esp-idf-sys runtime patches and initialise logging.
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
    log::info!("AutoFollow firmware starting…");

    if let Err(e) = run() {
        log::error!("bring-up failed: {e:?}");
        log::error!("restarting in {RESTART_GRACE_MS} ms");
        thread::sleep(Duration::from_millis(RESTART_GRACE_MS));
        unsafe {
            esp_idf_sys::esp_restart();
        }
    }
}

#[cfg(target_os = "espidf")]
fn run() -> Result<()> {
    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let mut device = Device::new(peripherals.modem, sysloop, nvs)?;
    device.init_peripherals()?;
    device.attach_interrupts()?;
    device.start()?;
    device.begin_tasks()?;

    // Parks here for the life of the session; returns only after a WAVE
    // exchange shuts the link down.
    device.supervise();
    Ok(())
}
