//! SensorLink firmware entry point.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  EspMqttTransport / SimTransport    MonotonicClock             │
//! │  (PubSubTransport)                  (Clock)                    │
//! │  OtaPartitionStore / MemoryStore    SystemDevice               │
//! │  (UpdateStore)                      (DevicePort)               │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │  Engine: ReliableChannel · CommandRouter · UpdateSession│   │
//! │  └────────────────────────────────────────────────────────┘    │
//! │                                                                │
//! │  Tasks: link-io · link-retry · link-ka · sensor                │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! On ESP-IDF the device joins WiFi and talks to a real broker. On the host
//! it runs against an in-memory broker and a scripted operator that pings
//! the device, queries its status and pushes a firmware update.
#![deny(unused_must_use)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::info;

use sensorlink::adapters::device::{DeviceSettings, SystemDevice};
use sensorlink::adapters::device_id;
use sensorlink::adapters::time::MonotonicClock;
use sensorlink::config::LinkConfig;
use sensorlink::engine::Engine;
use sensorlink::link::channel::ReliableChannel;
use sensorlink::sync::barrier::PauseBarrier;
use sensorlink::tasks::{self, Tasks};

// ── Sensor task ───────────────────────────────────────────────

/// Start the peripheral task that samples at the commanded report interval
/// and parks while an update is written.
fn spawn_sensor(tasks: &mut Tasks, settings: Arc<DeviceSettings>, barrier: Arc<PauseBarrier>) -> Result<()> {
    let mut elapsed = 0u32;
    tasks::spawn_peripheral(tasks, "sensor\0", barrier, Duration::from_secs(1), move || {
        if let Some(secs) = settings.take_identify() {
            info!("SENSOR: identify blink for {} s", secs);
        }
        elapsed += 1;
        if elapsed >= settings.report_interval_secs() {
            elapsed = 0;
            info!(
                "SENSOR: sample (brightness {}%)",
                settings.brightness()
            );
        }
    })?;
    Ok(())
}

// ── ESP-IDF main ──────────────────────────────────────────────

#[cfg(target_os = "espidf")]
fn main() -> Result<()> {
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::hal::peripherals::Peripherals;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;

    use sensorlink::adapters::mqtt_transport::EspMqttTransport;
    use sensorlink::adapters::update_store::OtaPartitionStore;
    use sensorlink::adapters::wifi;

    const BROKER_URL: &str = match option_env!("SENSORLINK_BROKER_URL") {
        Some(url) => url,
        None => "mqtt://broker.local:1883",
    };

    // ── 1. ESP-IDF bootstrap ──────────────────────────────────
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;

    info!("╔══════════════════════════════════════╗");
    info!("║  SensorLink v{}                      ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    // ── 2. Network ────────────────────────────────────────────
    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;
    let _wifi = wifi::connect_station(peripherals.modem, sysloop, nvs)?;

    // ── 3. Engine ─────────────────────────────────────────────
    let cfg = LinkConfig::default();
    let uid = device_id::device_uid(&device_id::read_mac());
    info!("Device uid: {}", uid);

    let channel = Arc::new(ReliableChannel::new(
        EspMqttTransport::new(BROKER_URL),
        MonotonicClock::new(),
        &uid,
        &cfg,
    )?);
    let settings = Arc::new(DeviceSettings::default());
    let barrier = Arc::new(PauseBarrier::new());
    let mut engine = Engine::new(
        &cfg,
        &uid,
        channel,
        OtaPartitionStore::new(),
        SystemDevice::new(Arc::clone(&settings)),
        Arc::clone(&barrier),
    )?;
    engine.start()?;

    // ── 4. Tasks ──────────────────────────────────────────────
    let mut tasks = tasks::spawn(engine, &cfg)?;
    spawn_sensor(&mut tasks, settings, barrier)?;

    // Keeps the WiFi driver alive; all work happens in the tasks.
    loop {
        sensorlink::sync::timed::sleep(Duration::from_secs(60));
    }
}

// ── Host simulation main ──────────────────────────────────────

#[cfg(not(target_os = "espidf"))]
fn main() -> Result<()> {
    use sensorlink::adapters::sim_transport::{LoopbackBroker, SimTransport};
    use sensorlink::adapters::update_store::MemoryUpdateStore;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("SensorLink v{} (host simulation)", env!("CARGO_PKG_VERSION"));

    let cfg = match std::env::var_os("SENSORLINK_CONFIG") {
        Some(path) => {
            let bytes = std::fs::read(&path)?;
            LinkConfig::from_json(&bytes).map_err(|e| anyhow::anyhow!("{}: {}", path.to_string_lossy(), e))?
        }
        None => LinkConfig::default(),
    };
    let uid = device_id::device_uid(&device_id::read_mac());
    info!("Device uid: {}", uid);

    let broker = LoopbackBroker::new();
    let channel = Arc::new(ReliableChannel::new(
        SimTransport::new(Arc::clone(&broker)),
        MonotonicClock::new(),
        &uid,
        &cfg,
    )?);
    let settings = Arc::new(DeviceSettings::default());
    let barrier = Arc::new(PauseBarrier::new());
    let mut engine = Engine::new(
        &cfg,
        &uid,
        channel,
        MemoryUpdateStore::new(),
        SystemDevice::new(Arc::clone(&settings)),
        Arc::clone(&barrier),
    )?;
    engine.start()?;
    let topics = engine.topics().clone();

    let mut tasks = tasks::spawn(engine, &cfg)?;
    spawn_sensor(&mut tasks, Arc::clone(&settings), Arc::clone(&barrier))?;

    let result = sim::run_operator(&broker, &topics, &settings, cfg.firmware_version);
    // A staged update leaves the peripherals paused for the restart.
    barrier.resume();
    tasks.shutdown();
    result
}

#[cfg(not(target_os = "espidf"))]
mod sim {
    use std::time::{Duration, Instant};

    use anyhow::{Result, bail};
    use log::info;

    use sensorlink::adapters::device::DeviceSettings;
    use sensorlink::adapters::sim_transport::{LoopbackBroker, Operator};
    use sensorlink::link::topics::TopicNames;
    use sensorlink::ota::wire::{Chunk, VersionAnnounce, WriteFlag, image_digest};
    use sensorlink::rpc::codec::{CommandKey, encode_binary};
    use sensorlink::sync::timed;

    const STEP: Duration = Duration::from_millis(5);
    const DEADLINE: Duration = Duration::from_secs(30);
    const IMAGE_SIZE: usize = 20 * 1024;

    /// Poll `f` until it yields a value or the deadline passes.
    fn wait_for<T>(what: &str, mut f: impl FnMut() -> Option<T>) -> Result<T> {
        let start = Instant::now();
        while start.elapsed() < DEADLINE {
            if let Some(v) = f() {
                return Ok(v);
            }
            timed::sleep(STEP);
        }
        bail!("timed out waiting for {what}")
    }

    fn take_on(op: &Operator, topic: &str) -> Option<Vec<u8>> {
        let (t, payload) = op.take()?;
        if t == topic {
            Some(payload)
        } else {
            info!("SIM: operator got {} bytes on {}", payload.len(), t);
            None
        }
    }

    pub fn run_operator(
        broker: &std::sync::Arc<LoopbackBroker>,
        topics: &TopicNames,
        settings: &DeviceSettings,
        running_version: u16,
    ) -> Result<()> {
        let op = Operator::new(std::sync::Arc::clone(broker));
        op.subscribe(&topics.reply);
        op.subscribe(&topics.update_tx);
        op.subscribe(&topics.update_status);

        wait_for("device subscriptions", || {
            broker.is_device_subscribed(&topics.command).then_some(())
        })?;
        wait_for("update data subscription", || {
            broker.is_device_subscribed(&topics.update_rx).then_some(())
        })?;

        // ── Ping ────────────────────────────────────────────
        op.publish(&topics.command, &encode_binary(CommandKey::Ping, &[]));
        let reply = wait_for("ping reply", || take_on(&op, &topics.reply))?;
        info!("SIM: ping reply {:02x?}", reply);

        // ── JSON status ─────────────────────────────────────
        op.publish(&topics.json_command, br#"{"cmd":"GetStatus","retfmt":"json"}"#);
        let reply = wait_for("status reply", || take_on(&op, &topics.reply))?;
        info!("SIM: status {}", String::from_utf8_lossy(&reply));

        // ── Firmware update ─────────────────────────────────
        let image: Vec<u8> = (0..IMAGE_SIZE).map(|i| (i * 31 % 251) as u8).collect();
        let announce = VersionAnnounce {
            version: running_version + 1,
            size: image.len() as u32,
        };
        op.publish(&topics.command, &encode_binary(CommandKey::Update, &[]));

        let start = Instant::now();
        while !settings.restart_requested() {
            if start.elapsed() > DEADLINE {
                bail!("update did not complete");
            }
            let Some((topic, payload)) = op.take() else {
                timed::sleep(STEP);
                continue;
            };
            if topic == topics.update_status.as_str() {
                info!("SIM: status {}", String::from_utf8_lossy(&payload));
                continue;
            }
            if topic != topics.update_tx.as_str() {
                continue;
            }
            let Ok(flag) = WriteFlag::parse(&payload) else {
                bail!("malformed write flag");
            };
            let sent = if flag.requires_version() {
                op.publish(&topics.update_rx, &announce.encode())
            } else if flag.requires_verify() {
                op.publish(&topics.update_rx, &image_digest(&image))
            } else {
                let from = flag.next_offset as usize;
                let to = (from + flag.chunk_size as usize).min(image.len());
                let chunk = Chunk {
                    offset: flag.next_offset,
                    data: &image[from..to],
                };
                op.publish(&topics.update_rx, &chunk.encode())
            };
            if !sent {
                bail!("device not subscribed to {}", topics.update_rx);
            }
        }
        info!("SIM: device staged v{} and requested a restart", announce.version);
        Ok(())
    }
}
