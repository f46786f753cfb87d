//! Firmware update over the pub/sub link: wire payloads, status reporting
//! and the session state machine.

pub mod session;
pub mod status;
pub mod wire;
