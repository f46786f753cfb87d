//! In-memory loopback broker for the host simulator.
//!
//! ```text
//!   Engine ⇄ SimTransport ──┐
//!                           ├── LoopbackBroker (exact-match topics)
//!   scripted Operator ──────┘
//! ```
//!
//! The broker acknowledges every QoS>0 publish, SUBSCRIBE and PINGREQ
//! immediately. Availability can be toggled to exercise the reconnect
//! backoff.

use core::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::debug;

use crate::app::ports::PubSubTransport;
use crate::error::LinkError;
use crate::link::transport::{ConnectError, OutboundPublish, QoS, TransportEvent};

#[derive(Default)]
struct BrokerState {
    unavailable: bool,
    connected: bool,
    device_subs: Vec<String>,
    operator_subs: Vec<String>,
    to_device: VecDeque<TransportEvent>,
    to_operator: VecDeque<(String, Vec<u8>)>,
}

pub struct LoopbackBroker {
    state: Mutex<CriticalSectionRawMutex, RefCell<BrokerState>>,
}

impl LoopbackBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RefCell::new(BrokerState::default())),
        })
    }

    /// Refuse (or accept again) new connections.
    pub fn set_available(&self, available: bool) {
        self.with(|s| s.unavailable = !available);
    }

    /// End the device session from the broker side.
    pub fn drop_session(&self) {
        self.with(|s| {
            if s.connected {
                s.connected = false;
                s.device_subs.clear();
                s.to_device.push_back(TransportEvent::Disconnected);
            }
        });
    }

    pub fn is_device_connected(&self) -> bool {
        self.with(|s| s.connected)
    }

    pub fn is_device_subscribed(&self, topic: &str) -> bool {
        self.with(|s| s.device_subs.iter().any(|t| t == topic))
    }

    fn with<R>(&self, f: impl FnOnce(&mut BrokerState) -> R) -> R {
        self.state.lock(|s| f(&mut s.borrow_mut()))
    }
}

// ── Device side ─────────────────────────────────────────────

pub struct SimTransport {
    broker: Arc<LoopbackBroker>,
}

impl SimTransport {
    pub fn new(broker: Arc<LoopbackBroker>) -> Self {
        Self { broker }
    }
}

impl PubSubTransport for SimTransport {
    fn connect(&mut self, client_id: &str, _keepalive_secs: u16) -> Result<(), ConnectError> {
        self.broker.with(|s| {
            if s.unavailable {
                s.to_device
                    .push_back(TransportEvent::ConnectFailed(ConnectError::ServerUnavailable));
            } else {
                s.connected = true;
                s.to_device.push_back(TransportEvent::Connected);
            }
        });
        debug!("LINK: sim connect from '{}'", client_id);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.broker.with(|s| {
            s.connected = false;
            s.device_subs.clear();
        });
    }

    fn publish(&mut self, msg: &OutboundPublish<'_>) -> Result<(), LinkError> {
        self.broker.with(|s| {
            if !s.connected {
                return Err(LinkError::NotConnected);
            }
            if s.operator_subs.iter().any(|t| t == msg.topic) {
                s.to_operator
                    .push_back((msg.topic.to_string(), msg.payload.to_vec()));
            }
            match (msg.qos, msg.message_id) {
                (QoS::AtLeastOnce, Some(id)) => s.to_device.push_back(TransportEvent::PubAck(id)),
                (QoS::ExactlyOnce, Some(id)) => s.to_device.push_back(TransportEvent::PubRec(id)),
                _ => {}
            }
            Ok(())
        })
    }

    fn release(&mut self, message_id: u16) -> Result<(), LinkError> {
        self.broker.with(|s| {
            if !s.connected {
                return Err(LinkError::NotConnected);
            }
            s.to_device.push_back(TransportEvent::PubComp(message_id));
            Ok(())
        })
    }

    fn subscribe(&mut self, message_id: u16, topics: &[(&str, QoS)]) -> Result<(), LinkError> {
        self.broker.with(|s| {
            if !s.connected {
                return Err(LinkError::NotConnected);
            }
            for (topic, _) in topics {
                if !s.device_subs.iter().any(|t| t == topic) {
                    s.device_subs.push((*topic).to_string());
                }
            }
            s.to_device.push_back(TransportEvent::SubAck(message_id));
            Ok(())
        })
    }

    fn unsubscribe(&mut self, message_id: u16, topics: &[&str]) -> Result<(), LinkError> {
        self.broker.with(|s| {
            if !s.connected {
                return Err(LinkError::NotConnected);
            }
            s.device_subs.retain(|t| !topics.contains(&t.as_str()));
            s.to_device.push_back(TransportEvent::UnsubAck(message_id));
            Ok(())
        })
    }

    fn ping(&mut self) -> Result<(), LinkError> {
        self.broker.with(|s| {
            if !s.connected {
                return Err(LinkError::NotConnected);
            }
            s.to_device.push_back(TransportEvent::PingResp);
            Ok(())
        })
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        self.broker.with(|s| s.to_device.pop_front())
    }
}

// ── Operator side ───────────────────────────────────────────

/// The cloud-side client of the loopback broker.
pub struct Operator {
    broker: Arc<LoopbackBroker>,
}

impl Operator {
    pub fn new(broker: Arc<LoopbackBroker>) -> Self {
        Self { broker }
    }

    pub fn subscribe(&self, topic: &str) {
        self.broker.with(|s| s.operator_subs.push(topic.to_string()));
    }

    /// Deliver `payload` to the device if it is subscribed to `topic`.
    /// Returns whether it was delivered.
    pub fn publish(&self, topic: &str, payload: &[u8]) -> bool {
        self.broker.with(|s| {
            if !s.connected || !s.device_subs.iter().any(|t| t == topic) {
                return false;
            }
            match TransportEvent::message(topic, payload) {
                Ok(event) => {
                    s.to_device.push_back(event);
                    true
                }
                Err(_) => false,
            }
        })
    }

    /// Next message the device published on an operator topic.
    pub fn take(&self) -> Option<(String, Vec<u8>)> {
        self.broker.with(|s| s.to_operator.pop_front())
    }
}
