//! Adapters: concrete implementations of the hexagonal port traits.
//!
//! | Adapter          | Implements        | Connects to                   |
//! |------------------|-------------------|-------------------------------|
//! | `device`         | DevicePort        | Shared settings, esp-ota restart |
//! | `device_id`      | -                 | eFuse factory MAC             |
//! | `mqtt_transport` | PubSubTransport   | esp-mqtt client (ESP-IDF only) |
//! | `sim_transport`  | PubSubTransport   | In-memory loopback broker     |
//! | `time`           | Clock             | ESP32 system timer / Instant  |
//! | `update_store`   | UpdateStore       | esp-ota partitions / RAM      |
//! | `wifi`           | -                 | Station-mode WiFi (ESP-IDF only) |

pub mod device;
pub mod device_id;
#[cfg(target_os = "espidf")]
pub mod mqtt_transport;
pub mod sim_transport;
pub mod time;
pub mod update_store;
#[cfg(target_os = "espidf")]
pub mod wifi;
