//! Device identity derived from the factory MAC address.
//!
//! The uid `U` used in every topic is the full 6-byte MAC as 12 lowercase
//! hex digits (e.g. `deadbeefcafe`). It is deterministic across reboots
//! (factory-burned eFuse MAC) and doubles as the broker client id.

use core::fmt::Write;

/// Fixed-size uid string (12 hex digits).
pub type DeviceUid = heapless::String<16>;

/// Full 6-byte MAC address.
pub type MacAddress = [u8; 6];

/// Read the factory MAC address from eFuse.
#[cfg(target_os = "espidf")]
pub fn read_mac() -> MacAddress {
    let mut mac: MacAddress = [0u8; 6];
    unsafe {
        esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr());
    }
    mac
}

/// Simulation: returns a deterministic fake MAC.
#[cfg(not(target_os = "espidf"))]
pub fn read_mac() -> MacAddress {
    [0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE]
}

pub fn device_uid(mac: &MacAddress) -> DeviceUid {
    let mut id = DeviceUid::new();
    for b in mac {
        let _ = write!(id, "{:02x}", b);
    }
    id
}
