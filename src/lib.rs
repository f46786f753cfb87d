//! SensorLink: command and firmware-update protocol engine for pub/sub
//! connected sensor nodes.
//!
//! Exposes every module for integration testing and the host simulator.
//! All ESP-IDF-specific code is guarded by `#[cfg(target_os = "espidf")]`
//! within each module.

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod config;
pub mod engine;
pub mod error;
pub mod link;
pub mod ota;
pub mod rpc;
pub mod sync;
pub mod tasks;
