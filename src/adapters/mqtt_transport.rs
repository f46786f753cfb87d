//! ESP-IDF MQTT transport over `esp_idf_svc::mqtt::client::EspMqttClient`.
//!
//! esp-mqtt assigns its own message ids and runs its own keep-alive, so
//! this adapter keeps a small map from esp-mqtt ids to the channel's ids
//! and answers pings locally while the session is up. Events from the
//! esp-mqtt task go into a bounded [`EventQueue`] drained by
//! [`PubSubTransport::poll`]; when the engine falls behind, newer events
//! are dropped.

use core::cell::RefCell;
use core::time::Duration;
use std::sync::Arc;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use esp_idf_svc::mqtt::client::{
    Details, EspMqttClient, EventPayload, MqttClientConfiguration, QoS as EspQoS,
};
use heapless::FnvIndexMap;
use log::{debug, warn};

use crate::app::ports::PubSubTransport;
use crate::error::LinkError;
use crate::link::transport::{ConnectError, EventQueue, OutboundPublish, QoS, TransportEvent};

/// Receive buffer; must hold a full update chunk plus its header.
const BUFFER_SIZE: usize = 4096 + 64;

#[derive(Debug, Clone, Copy)]
enum Pending {
    Publish(u16),
    Subscribe(u16),
    Unsubscribe(u16),
}

#[derive(Default)]
struct Shared {
    connected: bool,
    events: EventQueue,
    pending: FnvIndexMap<u32, Pending, 32>,
    /// esp-mqtt ids acknowledged before their mapping was recorded.
    early: heapless::Vec<u32, 16>,
}

impl Shared {
    fn complete(&mut self, esp_id: u32) {
        match self.pending.remove(&esp_id) {
            Some(Pending::Publish(id)) => {
                self.events.push(TransportEvent::PubAck(id));
            }
            Some(Pending::Subscribe(id)) => {
                self.events.push(TransportEvent::SubAck(id));
            }
            Some(Pending::Unsubscribe(id)) => {
                self.events.push(TransportEvent::UnsubAck(id));
            }
            None => {
                if self.early.push(esp_id).is_err() {
                    warn!("LINK: dropping early ack for esp id {}", esp_id);
                }
            }
        }
    }

    fn track(&mut self, esp_id: u32, pending: Pending) {
        if let Some(pos) = self.early.iter().position(|id| *id == esp_id) {
            self.early.swap_remove(pos);
            let _ = self.pending.insert(esp_id, pending);
            self.complete(esp_id);
            return;
        }
        if self.pending.insert(esp_id, pending).is_err() {
            warn!("LINK: esp-mqtt id map full, ack for {} will be lost", esp_id);
        }
    }
}

type SharedState = Arc<Mutex<CriticalSectionRawMutex, RefCell<Shared>>>;

pub struct EspMqttTransport {
    url: &'static str,
    client: Option<EspMqttClient<'static>>,
    shared: SharedState,
}

impl EspMqttTransport {
    pub fn new(url: &'static str) -> Self {
        Self {
            url,
            client: None,
            shared: Arc::new(Mutex::new(RefCell::new(Shared::default()))),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
        self.shared.lock(|s| f(&mut s.borrow_mut()))
    }

    fn client(&mut self) -> Result<&mut EspMqttClient<'static>, LinkError> {
        if !self.with(|s| s.connected) {
            return Err(LinkError::NotConnected);
        }
        self.client.as_mut().ok_or(LinkError::NotConnected)
    }
}

fn esp_qos(qos: QoS) -> EspQoS {
    match qos {
        QoS::AtMostOnce => EspQoS::AtMostOnce,
        QoS::AtLeastOnce => EspQoS::AtLeastOnce,
        QoS::ExactlyOnce => EspQoS::ExactlyOnce,
    }
}

impl PubSubTransport for EspMqttTransport {
    fn connect(&mut self, client_id: &str, keepalive_secs: u16) -> Result<(), ConnectError> {
        self.client = None;
        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            keep_alive_interval: Some(Duration::from_secs(keepalive_secs as u64)),
            buffer_size: BUFFER_SIZE,
            disable_clean_session: false,
            ..Default::default()
        };
        let shared = Arc::clone(&self.shared);
        let client = EspMqttClient::new_cb(self.url, &conf, move |event| {
            shared.lock(|s| {
                let mut s = s.borrow_mut();
                match event.payload() {
                    EventPayload::Connected(_) => {
                        s.connected = true;
                        s.events.push(TransportEvent::Connected);
                    }
                    EventPayload::Disconnected => {
                        s.connected = false;
                        s.pending.clear();
                        s.events.push(TransportEvent::Disconnected);
                    }
                    EventPayload::Published(id) | EventPayload::Subscribed(id) | EventPayload::Unsubscribed(id) => {
                        s.complete(id);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => match TransportEvent::message(topic, data) {
                        Ok(ev) => {
                            s.events.push(ev);
                        }
                        Err(e) => warn!("LINK: inbound message dropped: {}", e),
                    },
                    EventPayload::Received { .. } => warn!("LINK: fragmented message dropped"),
                    EventPayload::Error(e) => debug!("LINK: esp-mqtt error {:?}", e),
                    _ => {}
                }
            });
        })
        .map_err(|e| {
            warn!("LINK: esp-mqtt client init failed: {:?}", e);
            ConnectError::Network
        })?;
        self.client = Some(client);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.client = None;
        self.with(|s| {
            s.connected = false;
            s.pending.clear();
            s.early.clear();
        });
    }

    fn publish(&mut self, msg: &OutboundPublish<'_>) -> Result<(), LinkError> {
        let esp_id = self
            .client()?
            .publish(msg.topic, esp_qos(msg.qos), msg.retain, msg.payload)
            .map_err(|e| {
                warn!("LINK: esp-mqtt publish failed: {:?}", e);
                LinkError::Transport
            })?;
        if let Some(id) = msg.message_id {
            self.with(|s| s.track(esp_id, Pending::Publish(id)));
        }
        Ok(())
    }

    fn release(&mut self, _message_id: u16) -> Result<(), LinkError> {
        // esp-mqtt completes the QoS 2 exchange itself and reports the
        // final ack as `Published`.
        Ok(())
    }

    fn subscribe(&mut self, message_id: u16, topics: &[(&str, QoS)]) -> Result<(), LinkError> {
        // esp-mqtt takes one topic per SUBSCRIBE; the last id carries the batch ack.
        let mut last = None;
        for (topic, qos) in topics {
            let esp_id = self.client()?.subscribe(topic, esp_qos(*qos)).map_err(|e| {
                warn!("LINK: esp-mqtt subscribe failed: {:?}", e);
                LinkError::Transport
            })?;
            last = Some(esp_id);
        }
        if let Some(esp_id) = last {
            self.with(|s| s.track(esp_id, Pending::Subscribe(message_id)));
        }
        Ok(())
    }

    fn unsubscribe(&mut self, message_id: u16, topics: &[&str]) -> Result<(), LinkError> {
        let mut last = None;
        for topic in topics {
            let esp_id = self.client()?.unsubscribe(topic).map_err(|e| {
                warn!("LINK: esp-mqtt unsubscribe failed: {:?}", e);
                LinkError::Transport
            })?;
            last = Some(esp_id);
        }
        if let Some(esp_id) = last {
            self.with(|s| s.track(esp_id, Pending::Unsubscribe(message_id)));
        }
        Ok(())
    }

    fn ping(&mut self) -> Result<(), LinkError> {
        self.with(|s| {
            if !s.connected {
                return Err(LinkError::NotConnected);
            }
            s.events.push(TransportEvent::PingResp);
            Ok(())
        })
    }

    fn poll(&mut self) -> Option<TransportEvent> {
        self.with(|s| s.events.pop())
    }
}
