//! System actions exposed to the command router.
//!
//! Settings changed by commands are published through [`DeviceSettings`],
//! which the sensor task reads on every cycle. Restart goes through
//! `esp-ota` on hardware and raises a flag in simulation.

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::Arc;

use log::info;

use crate::adapters::time::MonotonicClock;
use crate::app::ports::DevicePort;

/// Shared, lock-free view of the command-controlled settings.
#[derive(Debug)]
pub struct DeviceSettings {
    report_interval_secs: AtomicU32,
    brightness: AtomicU8,
    identify_secs: AtomicU32,
    restart_requested: AtomicBool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            report_interval_secs: AtomicU32::new(60),
            brightness: AtomicU8::new(50),
            identify_secs: AtomicU32::new(0),
            restart_requested: AtomicBool::new(false),
        }
    }
}

impl DeviceSettings {
    pub fn report_interval_secs(&self) -> u32 {
        self.report_interval_secs.load(Ordering::Relaxed)
    }

    pub fn brightness(&self) -> u8 {
        self.brightness.load(Ordering::Relaxed)
    }

    /// Pending identify blink, consumed by the indicator task.
    pub fn take_identify(&self) -> Option<u32> {
        match self.identify_secs.swap(0, Ordering::Relaxed) {
            0 => None,
            secs => Some(secs),
        }
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested.load(Ordering::SeqCst)
    }
}

pub struct SystemDevice {
    settings: Arc<DeviceSettings>,
    clock: MonotonicClock,
}

impl SystemDevice {
    pub fn new(settings: Arc<DeviceSettings>) -> Self {
        Self {
            settings,
            clock: MonotonicClock::new(),
        }
    }
}

impl DevicePort for SystemDevice {
    fn uptime_secs(&self) -> u64 {
        self.clock.uptime_secs()
    }

    fn set_report_interval(&mut self, secs: u32) {
        self.settings
            .report_interval_secs
            .store(secs, Ordering::Relaxed);
        info!("CMD: report interval set to {} s", secs);
    }

    fn set_brightness(&mut self, level: u8) {
        self.settings.brightness.store(level, Ordering::Relaxed);
        info!("CMD: brightness set to {}", level);
    }

    fn identify(&mut self, secs: u16) {
        self.settings
            .identify_secs
            .store(secs as u32, Ordering::Relaxed);
        info!("CMD: identify for {} s", secs);
    }

    #[cfg(target_os = "espidf")]
    fn restart(&mut self) {
        info!("CMD: restarting");
        self.settings.restart_requested.store(true, Ordering::SeqCst);
        esp_ota::restart();
    }

    #[cfg(not(target_os = "espidf"))]
    fn restart(&mut self) {
        info!("CMD: restart requested (simulation)");
        self.settings.restart_requested.store(true, Ordering::SeqCst);
    }
}
