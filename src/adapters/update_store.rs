//! Firmware image storage.
//!
//! - **`target_os = "espidf"`**: [`OtaPartitionStore`] writes the inactive
//!   OTA partition through the `esp-ota` crate.
//! - **`not(target_os = "espidf")`**: [`MemoryUpdateStore`] stages the image
//!   in RAM for the host simulator and tests.

use log::info;
#[cfg(target_os = "espidf")]
use log::warn;

use crate::app::ports::UpdateStore;
use crate::error::StoreError;

// ── ESP-IDF: esp-ota backed ─────────────────────────────────

#[cfg(target_os = "espidf")]
#[derive(Default)]
pub struct OtaPartitionStore {
    update: Option<esp_ota::OtaUpdate>,
    completed: Option<esp_ota::CompletedOtaUpdate>,
}

#[cfg(target_os = "espidf")]
impl OtaPartitionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(target_os = "espidf")]
impl UpdateStore for OtaPartitionStore {
    fn running_is_boot(&self) -> bool {
        unsafe {
            let running = esp_idf_svc::sys::esp_ota_get_running_partition();
            let boot = esp_idf_svc::sys::esp_ota_get_boot_partition();
            !running.is_null() && running == boot
        }
    }

    fn begin(&mut self, size: u32) -> Result<(), StoreError> {
        self.abort();
        let update = esp_ota::OtaUpdate::begin().map_err(|e| {
            warn!("OTA: esp-ota begin failed: {:?}", e);
            StoreError::Begin
        })?;
        self.update = Some(update);
        info!("OTA: partition opened for {} bytes", size);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        let update = self.update.as_mut().ok_or(StoreError::Write)?;
        update.write(bytes).map_err(|e| {
            warn!("OTA: esp-ota write failed: {:?}", e);
            StoreError::Write
        })
    }

    fn finish(&mut self) -> Result<(), StoreError> {
        let update = self.update.take().ok_or(StoreError::End)?;
        let completed = update.finalize().map_err(|e| {
            warn!("OTA: esp-ota finalize failed: {:?}", e);
            StoreError::End
        })?;
        self.completed = Some(completed);
        Ok(())
    }

    fn abort(&mut self) {
        // Dropping the handle aborts the esp-ota session.
        self.update = None;
        self.completed = None;
    }

    fn set_boot_target(&mut self) -> Result<(), StoreError> {
        let completed = self.completed.as_mut().ok_or(StoreError::SetBoot)?;
        completed.set_as_boot_partition().map_err(|e| {
            warn!("OTA: set_as_boot_partition failed: {:?}", e);
            StoreError::SetBoot
        })
    }

    fn mark_running_valid(&mut self) -> Result<(), StoreError> {
        esp_ota::mark_app_valid().map_err(|e| {
            warn!("OTA: mark_app_valid failed: {:?}", e);
            StoreError::SetBoot
        })
    }
}

// ── Host: in-memory ─────────────────────────────────────────

#[cfg(not(target_os = "espidf"))]
#[derive(Debug, Default)]
pub struct MemoryUpdateStore {
    staged: Vec<u8>,
    expected: u32,
    open: bool,
    finished: bool,
    boot_image: Option<Vec<u8>>,
    running_valid: bool,
}

#[cfg(not(target_os = "espidf"))]
impl MemoryUpdateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Image selected for the next boot, if any.
    pub fn boot_image(&self) -> Option<&[u8]> {
        self.boot_image.as_deref()
    }

    pub fn running_valid(&self) -> bool {
        self.running_valid
    }
}

#[cfg(not(target_os = "espidf"))]
impl UpdateStore for MemoryUpdateStore {
    fn running_is_boot(&self) -> bool {
        true
    }

    fn begin(&mut self, size: u32) -> Result<(), StoreError> {
        self.abort();
        self.staged = Vec::with_capacity(size as usize);
        self.expected = size;
        self.open = true;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        if !self.open || self.staged.len() + bytes.len() > self.expected as usize {
            return Err(StoreError::Write);
        }
        self.staged.extend_from_slice(bytes);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), StoreError> {
        if !self.open || self.staged.len() != self.expected as usize {
            return Err(StoreError::End);
        }
        self.open = false;
        self.finished = true;
        Ok(())
    }

    fn abort(&mut self) {
        self.open = false;
        self.finished = false;
        self.staged.clear();
    }

    fn set_boot_target(&mut self) -> Result<(), StoreError> {
        if !self.finished {
            return Err(StoreError::SetBoot);
        }
        self.boot_image = Some(core::mem::take(&mut self.staged));
        self.finished = false;
        info!("OTA: staged image set as boot target (simulation)");
        Ok(())
    }

    fn mark_running_valid(&mut self) -> Result<(), StoreError> {
        self.running_valid = true;
        Ok(())
    }
}
