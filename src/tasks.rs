//! The engine's cooperating tasks and core-pinned thread spawning.
//!
//! | Task        | Core | Loop body                                   |
//! |-------------|------|---------------------------------------------|
//! | `link-io`   | Pro  | drain transport events into the [`Engine`]  |
//! | `link-retry`| Pro  | [`ReliableChannel::sweep`]                  |
//! | `link-ka`   | App  | keep-alive check, then reconnect if due     |
//!
//! Peripheral tasks spawned with [`spawn_peripheral`] take part in the
//! update pause barrier.
//!
//! # ESP-IDF threading model
//!
//! ESP-IDF implements `std::thread` via pthreads, which are thin wrappers
//! around FreeRTOS tasks. `esp_pthread_set_cfg()` sets thread-local
//! configuration that applies to the *next* `pthread_create()` call from
//! the calling thread, so the config→spawn pair must not be interleaved
//! with other thread creation on the same thread.

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::info;

use crate::app::ports::{Clock, DevicePort, PubSubTransport, UpdateStore};
use crate::config::LinkConfig;
use crate::engine::Engine;
use crate::link::channel::{KeepAlive, ReliableChannel};
use crate::sync::barrier::PauseBarrier;
use crate::sync::timed;

/// CPU core identifiers for the ESP32 dual-core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Core {
    /// Core 0 (PRO_CPU): protocol stacks (WiFi, lwIP, MQTT).
    Pro = 0,
    /// Core 1 (APP_CPU): application logic.
    App = 1,
}

/// Spawn a thread pinned to `core` with explicit priority and stack.
/// `name` must be null-terminated (e.g. `"link-io\0"`).
#[cfg(target_os = "espidf")]
pub fn spawn_on_core(
    core: Core,
    priority: u8,
    stack_kb: usize,
    name: &'static str,
    f: impl FnOnce() + Send + 'static,
) -> io::Result<JoinHandle<()>> {
    unsafe {
        let mut cfg = esp_idf_svc::sys::esp_create_default_pthread_config();
        cfg.pin_to_core = core as i32;
        cfg.prio = priority as i32;
        cfg.stack_size = (stack_kb * 1024) as i32;
        cfg.thread_name = name.as_ptr() as *const _;
        let ret = esp_idf_svc::sys::esp_pthread_set_cfg(&cfg);
        if ret != esp_idf_svc::sys::ESP_OK as i32 {
            return Err(io::Error::other("esp_pthread_set_cfg failed"));
        }
    }

    let display_name = name.trim_end_matches('\0');
    info!(
        "TASK: spawning '{}' on {:?} (pri={}, stack={}KB)",
        display_name, core, priority, stack_kb
    );
    std::thread::Builder::new()
        .name(display_name.into())
        .spawn(f)
}

/// Simulation fallback; ignores core affinity and priority.
#[cfg(not(target_os = "espidf"))]
pub fn spawn_on_core(
    _core: Core,
    _priority: u8,
    stack_kb: usize,
    name: &'static str,
    f: impl FnOnce() + Send + 'static,
) -> io::Result<JoinHandle<()>> {
    let display_name = name.trim_end_matches('\0');
    info!(
        "TASK: spawning '{}' (sim, stack={}KB)",
        display_name, stack_kb
    );
    std::thread::Builder::new()
        .name(display_name.into())
        .stack_size(stack_kb * 1024)
        .spawn(f)
}

/// Running task set. Dropping it leaves the threads running; call
/// [`Tasks::shutdown`] to stop them.
pub struct Tasks {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Tasks {
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Signal every task to exit and wait for them.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
        for h in self.handles {
            let _ = h.join();
        }
        info!("TASK: all tasks stopped");
    }
}

/// Start the I/O, retry and keep-alive tasks. The engine moves into the
/// I/O task; the other two share its channel.
pub fn spawn<T, C, S, D>(engine: Engine<T, C, S, D>, cfg: &LinkConfig) -> io::Result<Tasks>
where
    T: PubSubTransport + 'static,
    C: Clock + 'static,
    S: UpdateStore + Send + 'static,
    D: DevicePort + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let channel: Arc<ReliableChannel<T, C>> = Arc::clone(engine.channel());
    let mut handles = Vec::with_capacity(3);

    let io_period = Duration::from_millis(cfg.io_poll_period_ms as u64);
    let io_stop = Arc::clone(&stop);
    let mut engine = engine;
    handles.push(spawn_on_core(Core::Pro, 10, 16, "link-io\0", move || {
        while !io_stop.load(Ordering::Relaxed) {
            while engine.poll() {}
            timed::sleep(io_period);
        }
    })?);

    let sweep_period = Duration::from_millis(cfg.sweep_period_ms as u64);
    let retry_stop = Arc::clone(&stop);
    let retry_channel = Arc::clone(&channel);
    handles.push(spawn_on_core(Core::Pro, 8, 8, "link-retry\0", move || {
        while !retry_stop.load(Ordering::Relaxed) {
            retry_channel.sweep();
            timed::sleep(sweep_period);
        }
    })?);

    let ka_period = Duration::from_millis(cfg.keepalive_check_period_ms as u64);
    let ka_stop = Arc::clone(&stop);
    let ka_channel = channel;
    handles.push(spawn_on_core(Core::App, 8, 8, "link-ka\0", move || {
        while !ka_stop.load(Ordering::Relaxed) {
            if ka_channel.keepalive_check() == KeepAlive::Dropped {
                info!("TASK: link dropped by keep-alive");
            }
            ka_channel.connect();
            timed::sleep(ka_period);
        }
        ka_channel.close();
    })?);

    info!("TASK: engine tasks started");
    Ok(Tasks { stop, handles })
}

/// Start a peripheral task that runs `work` every `period` and parks at
/// the pause barrier while a firmware image is written.
pub fn spawn_peripheral(
    tasks: &mut Tasks,
    name: &'static str,
    barrier: Arc<PauseBarrier>,
    period: Duration,
    mut work: impl FnMut() + Send + 'static,
) -> io::Result<()> {
    let Some(id) = barrier.join() else {
        return Err(io::Error::other("pause barrier has no free participant slot"));
    };
    let stop = Arc::clone(&tasks.stop);
    let handle = spawn_on_core(Core::App, 5, 8, name, move || {
        while !stop.load(Ordering::Relaxed) {
            barrier.checkpoint(id);
            work();
            timed::sleep(period);
        }
        barrier.leave(id);
    })?;
    tasks.handles.push(handle);
    Ok(())
}
