// AutoFollow — device orchestrator.
//
// Owns the role topology: which sensors exist, which tasks run, and how
// the wireless link is wired into the trigger scheduler. The belt carries
// one emitting transducer; the bot carries two listening transducers, two
// fixed obstacle sensors, and the (idle) drive train.
//
// Bring-up order matters: peripherals, then interrupts, then the link,
// then tasks. Echo ISRs write into captures that exist before any task
// does, and wake slots absorb the task-spawn race.

use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::timer::EspTaskTimerService;

use crate::config::{
    belt_pins, bot_pins, peer_address, PinPair, DEVICE_ROLE, OBSTACLE_LIMIT_IN, SOC_IN_USE,
    STACK_LINK, STACK_OBSTACLE, STACK_RANGING, TRIGGER_LEAD_MS, WIRELESS_CHANNEL,
};
use crate::drivers::espnow::EspNowTransport;
use crate::drivers::gpio::{EchoLine, GpioTriggerLine};
use crate::drivers::motor::DriveTrain;
use crate::drivers::notify::WakeSlot;
use crate::drivers::timer::EspOneShot;
use crate::events::{echo_bits, notify, BreachFlags, Role, SensorId};
use crate::link::{LinkHandler, LinkNode};
use crate::ranging::sensor::EchoCapture;
use crate::ranging::{FireLatch, RangingSensor, TriggerScheduler};
use crate::tasks::ranging::TransducerTask;
use crate::tasks::{comms, ranging};

// ---------------------------------------------------------------------------
// Sensor bank
// ---------------------------------------------------------------------------

struct SensorUnit {
    id: SensorId,
    // Taken by the task that will own the sensor; capture and slot stay
    // behind for the interrupt wiring.
    sensor: Option<RangingSensor<GpioTriggerLine>>,
    capture: Arc<EchoCapture>,
    echo_slot: Arc<WakeSlot>,
    echo_pin: i32,
}

/// All ranging sensors of this role, keyed by identity. Sensors are built
/// here and handed off one by one to the tasks that drive them.
#[derive(Default)]
pub struct SensorBank {
    units: Vec<SensorUnit>,
}

impl SensorBank {
    fn add(&mut self, id: SensorId, pins: PinPair) -> Result<()> {
        let trigger = GpioTriggerLine::new(pins.trigger)?;
        let capture = Arc::new(EchoCapture::new());
        let mut sensor = RangingSensor::new(id, trigger, capture.clone(), OBSTACLE_LIMIT_IN);
        sensor.init()?;
        self.units.push(SensorUnit {
            id,
            sensor: Some(sensor),
            capture,
            echo_slot: Arc::new(WakeSlot::new(echo_bits(id))),
            echo_pin: pins.echo,
        });
        log::info!(
            "{id:?} mapped (trigger gpio {}, echo gpio {})",
            pins.trigger,
            pins.echo
        );
        Ok(())
    }

    /// Hand a sensor to its owning task. Each sensor can be fetched once;
    /// afterwards only the interrupt-side state remains in the bank.
    pub fn fetch_sensor(&mut self, id: SensorId) -> Option<RangingSensor<GpioTriggerLine>> {
        self.units
            .iter_mut()
            .find(|u| u.id == id)
            .and_then(|u| u.sensor.take())
    }

    fn echo_slot(&self, id: SensorId) -> Option<Arc<WakeSlot>> {
        self.units
            .iter()
            .find(|u| u.id == id)
            .map(|u| u.echo_slot.clone())
    }
}

// ---------------------------------------------------------------------------
// Link event handler
// ---------------------------------------------------------------------------

/// Protocol events feeding the trigger scheduler: every ping received
/// over the link arms one synchronized pulse.
struct LinkEvents {
    scheduler: Arc<TriggerScheduler<EspOneShot>>,
}

impl LinkHandler for LinkEvents {
    fn on_handshake(&self, payload: &str) {
        log::info!("handshake received ({payload})");
    }

    fn on_wave(&self, payload: &str) {
        log::info!("wave received ({payload}), session closing");
    }

    fn on_ping(&self, _payload: &str) {
        match self.scheduler.arm() {
            Ok(true) => log::debug!("trigger armed off ping"),
            Ok(false) => {}
            Err(e) => log::error!("failed to arm trigger timer: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

pub struct Device {
    node: Arc<LinkNode<EspNowTransport>>,
    scheduler: Arc<TriggerScheduler<EspOneShot>>,
    _timer_service: EspTaskTimerService,
    sensors: SensorBank,
    /// Tick slot of the first transducer in the serialized chain; the
    /// trigger timer raises this one, the tasks chain the rest.
    head_tick: Arc<WakeSlot>,
    rx_slot: Arc<WakeSlot>,
    echo_lines: Vec<EchoLine>,
    drive: Option<DriveTrain>,
    link_workers: Vec<JoinHandle<()>>,
    started: bool,
}

impl Device {
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
    ) -> Result<Self> {
        let role = DEVICE_ROLE;
        let peer = peer_address(role, SOC_IN_USE);
        log::info!("device role: {role:?}, soc: {:?}", SOC_IN_USE);

        let transport = EspNowTransport::new(modem, sysloop, nvs, peer, WIRELESS_CHANNEL)?;
        let node = Arc::new(LinkNode::new(transport, role, peer, true));

        // The timer callback releases the armed latch first, then wakes
        // the head of the transducer chain.
        let head_tick = Arc::new(WakeSlot::new(notify::bits(notify::TRIGGER_TICK)));
        let latch = FireLatch::new();
        let timer_service = EspTaskTimerService::new()?;
        let cb_latch = latch.clone();
        let cb_tick = head_tick.clone();
        let timer = EspOneShot::new(&timer_service, move || {
            cb_latch.release();
            cb_tick.raise();
        })?;
        let scheduler = Arc::new(TriggerScheduler::new(
            timer,
            latch,
            Duration::from_millis(TRIGGER_LEAD_MS),
        ));

        Ok(Self {
            node,
            scheduler,
            _timer_service: timer_service,
            sensors: SensorBank::default(),
            head_tick,
            rx_slot: Arc::new(WakeSlot::new(notify::bits(notify::LINK_RX_READY))),
            echo_lines: Vec::new(),
            drive: None,
            link_workers: Vec::new(),
            started: false,
        })
    }

    pub fn is_transmitter(&self) -> bool {
        self.node.is_transmitter()
    }

    pub fn role(&self) -> Role {
        self.node.role()
    }

    pub fn sensors_mut(&mut self) -> &mut SensorBank {
        &mut self.sensors
    }

    /// Build this role's sensor complement and park every trigger line.
    pub fn init_peripherals(&mut self) -> Result<()> {
        match self.role() {
            Role::Transmitter => {
                let pins = belt_pins(SOC_IN_USE);
                self.sensors.add(SensorId::TxTransducer, pins.transducer)?;
            }
            Role::Receiver => {
                let pins = bot_pins(SOC_IN_USE);
                self.sensors
                    .add(SensorId::LeftRxTransducer, pins.left_transducer)?;
                self.sensors
                    .add(SensorId::RightRxTransducer, pins.right_transducer)?;
                self.sensors.add(SensorId::LeftObstacle, pins.left_obstacle)?;
                self.sensors
                    .add(SensorId::RightObstacle, pins.right_obstacle)?;
                self.drive = Some(DriveTrain::new(pins.left_motor_pwm, pins.right_motor_pwm)?);
            }
        }
        Ok(())
    }

    /// Attach the any-edge echo interrupt of every mapped sensor.
    pub fn attach_interrupts(&mut self) -> Result<()> {
        for unit in &self.sensors.units {
            let line = EchoLine::attach(unit.echo_pin, unit.capture.clone(), unit.echo_slot.clone())
                .with_context(|| format!("attaching echo interrupt for {:?}", unit.id))?;
            self.echo_lines.push(line);
        }
        Ok(())
    }

    /// Bind the link event handler and route the transport callbacks into
    /// the node. After this, received frames wake the process task.
    pub fn start(&mut self) -> Result<()> {
        self.node.bind_handler(Arc::new(LinkEvents {
            scheduler: self.scheduler.clone(),
        }));

        let rx_node = self.node.clone();
        let rx_slot = self.rx_slot.clone();
        self.node.transport().on_receive(move |frame| {
            if rx_node.on_receive(frame) {
                rx_slot.raise();
            }
        })?;
        let sent_node = self.node.clone();
        self.node
            .transport()
            .on_sent(move |success| sent_node.on_sent(success))?;

        self.node.start()?;
        self.started = true;
        Ok(())
    }

    /// Spawn the link workers and this role's ranging tasks.
    pub fn begin_tasks(&mut self) -> Result<()> {
        if !self.started {
            bail!("begin_tasks before start: link callbacks not wired");
        }

        let comms_node = self.node.clone();
        self.link_workers.push(
            Builder::new()
                .name("link_comms".into())
                .stack_size(STACK_LINK)
                .spawn(move || comms::comms_loop(comms_node))?,
        );
        let process_node = self.node.clone();
        let process_slot = self.rx_slot.clone();
        self.link_workers.push(
            Builder::new()
                .name("link_process".into())
                .stack_size(STACK_LINK)
                .spawn(move || comms::process_loop(process_node, process_slot))?,
        );

        match self.role() {
            Role::Transmitter => self.begin_belt_ranging()?,
            Role::Receiver => self.begin_bot_ranging()?,
        }
        Ok(())
    }

    fn take_transducer_task(
        &mut self,
        id: SensorId,
        tick: Arc<WakeSlot>,
        chain: Option<Arc<WakeSlot>>,
    ) -> Result<TransducerTask<GpioTriggerLine>> {
        let sensor = match self.sensors.fetch_sensor(id) {
            Some(sensor) => sensor,
            None => bail!("sensor {id:?} not available for task hand-off"),
        };
        let echo = match self.sensors.echo_slot(id) {
            Some(slot) => slot,
            None => bail!("no echo slot mapped for {id:?}"),
        };
        Ok(TransducerTask {
            sensor,
            tick,
            echo,
            chain,
        })
    }

    fn begin_belt_ranging(&mut self) -> Result<()> {
        let task = self.take_transducer_task(SensorId::TxTransducer, self.head_tick.clone(), None)?;
        let _ = Builder::new()
            .name("tx_ranging".into())
            .stack_size(STACK_RANGING)
            .spawn(move || {
                ranging::transducer_loop(task, |id, inches, avg, _flags| {
                    log::info!("{id:?}: pulse emitted, self-echo {inches:.1}in (avg {avg:.1}in)");
                })
            })?;
        Ok(())
    }

    fn begin_bot_ranging(&mut self) -> Result<()> {
        // Left listens first; its task chains the right transducer.
        let right_tick = Arc::new(WakeSlot::new(notify::bits(notify::TRIGGER_TICK)));
        let left = self.take_transducer_task(
            SensorId::LeftRxTransducer,
            self.head_tick.clone(),
            Some(right_tick.clone()),
        )?;
        let right = self.take_transducer_task(SensorId::RightRxTransducer, right_tick, None)?;

        let left_node = self.node.clone();
        let _ = Builder::new()
            .name("left_ranging".into())
            .stack_size(STACK_RANGING)
            .spawn(move || {
                ranging::transducer_loop(left, move |id, inches, avg, flags| {
                    report_transducer(&left_node, "L", id, inches, avg, flags);
                })
            })?;
        let right_node = self.node.clone();
        let _ = Builder::new()
            .name("right_ranging".into())
            .stack_size(STACK_RANGING)
            .spawn(move || {
                ranging::transducer_loop(right, move |id, inches, avg, flags| {
                    report_transducer(&right_node, "R", id, inches, avg, flags);
                })
            })?;

        let mut obstacles = Vec::new();
        for id in [SensorId::LeftObstacle, SensorId::RightObstacle] {
            let sensor = match self.sensors.fetch_sensor(id) {
                Some(sensor) => sensor,
                None => bail!("sensor {id:?} not available for task hand-off"),
            };
            let slot = match self.sensors.echo_slot(id) {
                Some(slot) => slot,
                None => bail!("no echo slot mapped for {id:?}"),
            };
            obstacles.push((sensor, slot));
        }
        let _ = Builder::new()
            .name("obstacle_watch".into())
            .stack_size(STACK_OBSTACLE)
            .spawn(move || {
                ranging::obstacle_loop(obstacles, |id, inches, avg, flags| {
                    log::warn!("{id:?}: {flags} at {inches:.1}in (avg {avg:.1}in)");
                })
            })?;
        Ok(())
    }

    /// Block until the link workers observe the session teardown, then
    /// deregister the peer and park the drive train.
    pub fn supervise(&mut self) {
        for worker in self.link_workers.drain(..) {
            let name = worker.thread().name().unwrap_or("link worker").to_owned();
            if worker.join().is_err() {
                log::error!("{name} panicked");
            }
        }
        self.node.shutdown();
        if let Some(drive) = &mut self.drive {
            if let Err(e) = drive.stop() {
                log::warn!("drive train stop failed: {e}");
            }
        }
        log::info!("device supervision complete");
    }
}

/// One listening-transducer reading: the pulse travelled one way from the
/// belt, so the true separation is twice the round-trip figure. Stage it
/// for the next outgoing packet and surface any threshold breach.
fn report_transducer(
    node: &Arc<LinkNode<EspNowTransport>>,
    side: &str,
    id: SensorId,
    inches: f32,
    avg: f32,
    flags: BreachFlags,
) {
    let separation = inches * 2.0;
    node.stage_payload(&format!("{side} {separation:.1}in avg {:.1}", avg * 2.0));
    if flags.is_empty() {
        log::info!("{id:?}: belt at {separation:.1}in");
    } else {
        log::warn!("{id:?}: {flags} at {separation:.1}in (avg {avg:.1}in)");
    }
}
