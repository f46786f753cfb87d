//! Port traits: the hexagonal boundary between the protocol engine and the
//! outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ Engine (protocol core)
//! ```
//!
//! Driven adapters (broker transport, clock, firmware store, device actions)
//! implement these traits. The [`Engine`](crate::engine::Engine) and its
//! components consume them via generics, so the protocol core never touches
//! the network stack or flash directly.
//!
//! ## Contract notes
//!
//! - **PubSubTransport** implementations never block on the network for
//!   longer than one socket poll; outcomes arrive as [`TransportEvent`]s.
//! - **UpdateStore** implementations must tolerate `abort()` with no open
//!   handle.
//! - All port errors are typed; callers must handle every variant explicitly.

use crate::error::{LinkError, StoreError};
use crate::link::transport::{ConnectError, OutboundPublish, QoS, TransportEvent};

// ───────────────────────────────────────────────────────────────
// Transport port (driven adapter: engine ↔ broker)
// ───────────────────────────────────────────────────────────────

/// Low-level publish/subscribe client.
///
/// The [`ReliableChannel`](crate::link::channel::ReliableChannel) owns one
/// of these behind its publish lock and layers delivery tracking, backoff
/// and keep-alive on top.
pub trait PubSubTransport: Send {
    /// Start a session with the broker. `Ok` means the request went out;
    /// acceptance is reported later as [`TransportEvent::Connected`].
    fn connect(&mut self, client_id: &str, keepalive_secs: u16) -> Result<(), ConnectError>;

    /// Drop the session without waiting for the broker.
    fn disconnect(&mut self);

    /// Write one PUBLISH packet.
    fn publish(&mut self, msg: &OutboundPublish<'_>) -> Result<(), LinkError>;

    /// Write the PUBREL for a QoS 2 message the broker has received.
    fn release(&mut self, message_id: u16) -> Result<(), LinkError>;

    /// Write one SUBSCRIBE packet covering every listed topic.
    fn subscribe(&mut self, message_id: u16, topics: &[(&str, QoS)]) -> Result<(), LinkError>;

    /// Write one UNSUBSCRIBE packet covering every listed topic.
    fn unsubscribe(&mut self, message_id: u16, topics: &[&str]) -> Result<(), LinkError>;

    /// Write a PINGREQ.
    fn ping(&mut self) -> Result<(), LinkError>;

    /// Return the next inbound event, if any. Never blocks.
    fn poll(&mut self) -> Option<TransportEvent>;
}

// ───────────────────────────────────────────────────────────────
// Clock port
// ───────────────────────────────────────────────────────────────

/// Monotonic millisecond clock shared by the three engine tasks.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

// ───────────────────────────────────────────────────────────────
// Update store port (driven adapter: engine → flash partition)
// ───────────────────────────────────────────────────────────────

/// Persistent storage for a staged firmware image.
///
/// At most one handle is open at a time; `begin` opens it, `finish` or
/// `abort` closes it.
pub trait UpdateStore {
    /// Whether the running image is the one the bootloader is set to boot.
    fn running_is_boot(&self) -> bool;

    /// Open a write handle on the inactive partition for `size` bytes.
    fn begin(&mut self, size: u32) -> Result<(), StoreError>;

    /// Append bytes to the open handle.
    fn write(&mut self, bytes: &[u8]) -> Result<(), StoreError>;

    /// Close and validate the written image.
    fn finish(&mut self) -> Result<(), StoreError>;

    /// Discard the open handle, if any.
    fn abort(&mut self);

    /// Mark the finished image as the next boot target.
    fn set_boot_target(&mut self) -> Result<(), StoreError>;

    /// Confirm the running image so the bootloader does not roll it back.
    fn mark_running_valid(&mut self) -> Result<(), StoreError>;
}

// ───────────────────────────────────────────────────────────────
// Device port (driven adapter: engine → system actions)
// ───────────────────────────────────────────────────────────────

/// System actions the command router may trigger.
///
/// None of these may block the I/O task for longer than a register write.
pub trait DevicePort {
    fn uptime_secs(&self) -> u64;

    /// Change the sensor report period.
    fn set_report_interval(&mut self, secs: u32);

    /// Set the indicator brightness (0–100).
    fn set_brightness(&mut self, level: u8);

    /// Blink the indicator for `secs` seconds.
    fn identify(&mut self, secs: u16);

    /// Reboot the device. On hardware this does not return.
    fn restart(&mut self);
}

// ───────────────────────────────────────────────────────────────
// Responder capability (engine components → outbound traffic)
// ───────────────────────────────────────────────────────────────

/// Outbound capability handed to the router and the update session.
///
/// Components publish through this instead of holding a reference back to
/// the channel.
pub trait Responder {
    /// Publish a command reply on the device's reply topic.
    fn reply(&self, payload: &[u8]) -> Result<(), LinkError>;

    /// Publish on an arbitrary topic.
    fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), LinkError>;

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), LinkError>;

    fn unsubscribe(&self, topic: &str) -> Result<(), LinkError>;
}
