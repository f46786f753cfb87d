//! Subscription bookkeeping and the device's topic names.
//!
//! Each topic is held in exactly one of three states, so "pending
//! subscribe", "subscribed" and "pending unsubscribe" can never overlap.
//! A pending entry also remembers which SUBSCRIBE/UNSUBSCRIBE request (if
//! any) is carrying it, so the matching ack moves exactly that batch.

use core::cell::RefCell;
use core::fmt::Write;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use crate::error::LinkError;
use crate::link::transport::{QoS, TopicString};

/// Topics the table can hold at once.
pub const MAX_TOPICS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicState {
    /// Wants a subscription. `request` is the in-flight SUBSCRIBE, if sent.
    PendingSubscribe { request: Option<u16> },
    Subscribed,
    /// Wants to be dropped. `request` is the in-flight UNSUBSCRIBE, if sent.
    PendingUnsubscribe { request: Option<u16> },
}

#[derive(Debug, Clone)]
struct Entry {
    name: TopicString,
    qos: QoS,
    state: TopicState,
}

/// A SUBSCRIBE batch: every topic that went out under one request id.
pub type SubscribeBatch = heapless::Vec<(TopicString, QoS), MAX_TOPICS>;
/// An UNSUBSCRIBE batch.
pub type UnsubscribeBatch = heapless::Vec<TopicString, MAX_TOPICS>;

pub struct TopicSet {
    inner: Mutex<CriticalSectionRawMutex, RefCell<heapless::Vec<Entry, MAX_TOPICS>>>,
}

impl Default for TopicSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicSet {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(heapless::Vec::new())),
        }
    }

    /// Ask for a subscription. Idempotent: a topic that is already pending
    /// or subscribed is left alone. A topic waiting to be unsubscribed goes
    /// back to pending subscribe. Returns whether anything changed.
    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<bool, LinkError> {
        let name = TopicString::try_from(topic).map_err(|_| LinkError::TopicTooLong)?;
        self.inner.lock(|t| {
            let mut t = t.borrow_mut();
            if let Some(e) = t.iter_mut().find(|e| e.name == name) {
                return Ok(match e.state {
                    TopicState::PendingUnsubscribe { .. } => {
                        e.qos = qos;
                        e.state = TopicState::PendingSubscribe { request: None };
                        true
                    }
                    _ => false,
                });
            }
            t.push(Entry {
                name,
                qos,
                state: TopicState::PendingSubscribe { request: None },
            })
            .map_err(|_| LinkError::TopicTableFull)?;
            Ok(true)
        })
    }

    /// Ask for a topic to be dropped. A pending subscribe that never went out
    /// is simply forgotten; a subscribed topic, or one whose SUBSCRIBE is in
    /// flight, becomes pending unsubscribe.
    /// Unknown topics are ignored. Returns whether anything changed.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        self.inner.lock(|t| {
            let mut t = t.borrow_mut();
            let Some(pos) = t.iter().position(|e| e.name.as_str() == topic) else {
                return false;
            };
            match t[pos].state {
                TopicState::PendingSubscribe { request: None } => {
                    t.swap_remove(pos);
                    true
                }
                TopicState::PendingSubscribe { request: Some(_) } | TopicState::Subscribed => {
                    t[pos].state = TopicState::PendingUnsubscribe { request: None };
                    true
                }
                TopicState::PendingUnsubscribe { .. } => false,
            }
        })
    }

    /// Claim every pending-subscribe topic not yet carried by a request and
    /// tag it with `request_id`.
    pub fn take_subscribe_batch(&self, request_id: u16) -> SubscribeBatch {
        self.inner.lock(|t| {
            let mut batch = SubscribeBatch::new();
            for e in t.borrow_mut().iter_mut() {
                if e.state == (TopicState::PendingSubscribe { request: None }) {
                    e.state = TopicState::PendingSubscribe {
                        request: Some(request_id),
                    };
                    let _ = batch.push((e.name.clone(), e.qos));
                }
            }
            batch
        })
    }

    /// Claim every pending-unsubscribe topic not yet carried by a request.
    pub fn take_unsubscribe_batch(&self, request_id: u16) -> UnsubscribeBatch {
        self.inner.lock(|t| {
            let mut batch = UnsubscribeBatch::new();
            for e in t.borrow_mut().iter_mut() {
                if e.state == (TopicState::PendingUnsubscribe { request: None }) {
                    e.state = TopicState::PendingUnsubscribe {
                        request: Some(request_id),
                    };
                    let _ = batch.push(e.name.clone());
                }
            }
            batch
        })
    }

    /// SUBACK for `request_id`: its batch becomes subscribed.
    pub fn ack_subscribe(&self, request_id: u16) -> usize {
        self.inner.lock(|t| {
            let mut moved = 0;
            for e in t.borrow_mut().iter_mut() {
                if e.state == (TopicState::PendingSubscribe { request: Some(request_id) }) {
                    e.state = TopicState::Subscribed;
                    moved += 1;
                }
            }
            moved
        })
    }

    /// UNSUBACK for `request_id`: its batch is forgotten.
    pub fn ack_unsubscribe(&self, request_id: u16) -> usize {
        self.inner.lock(|t| {
            let mut t = t.borrow_mut();
            let before = t.len();
            t.retain(|e| e.state != (TopicState::PendingUnsubscribe { request: Some(request_id) }));
            before - t.len()
        })
    }

    /// A request could not be written: put its topics back in the queue.
    pub fn cancel_request(&self, request_id: u16) {
        self.inner.lock(|t| {
            for e in t.borrow_mut().iter_mut() {
                match e.state {
                    TopicState::PendingSubscribe { request: Some(id) } if id == request_id => {
                        e.state = TopicState::PendingSubscribe { request: None };
                    }
                    TopicState::PendingUnsubscribe { request: Some(id) } if id == request_id => {
                        e.state = TopicState::PendingUnsubscribe { request: None };
                    }
                    _ => {}
                }
            }
        });
    }

    /// The session is gone: the broker has forgotten every subscription.
    /// Subscribed and in-flight topics go back to pending subscribe; topics
    /// waiting to be unsubscribed are simply dropped.
    pub fn reset_acks(&self) {
        self.inner.lock(|t| {
            let mut t = t.borrow_mut();
            t.retain(|e| !matches!(e.state, TopicState::PendingUnsubscribe { .. }));
            for e in t.iter_mut() {
                e.state = TopicState::PendingSubscribe { request: None };
            }
        });
    }

    /// Whether `message_id` is carrying a SUBSCRIBE or UNSUBSCRIBE.
    pub fn has_request(&self, message_id: u16) -> bool {
        self.inner.lock(|t| {
            t.borrow().iter().any(|e| match e.state {
                TopicState::PendingSubscribe { request }
                | TopicState::PendingUnsubscribe { request } => request == Some(message_id),
                TopicState::Subscribed => false,
            })
        })
    }

    pub fn state_of(&self, topic: &str) -> Option<TopicState> {
        self.inner.lock(|t| {
            t.borrow()
                .iter()
                .find(|e| e.name.as_str() == topic)
                .map(|e| e.state)
        })
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.state_of(topic) == Some(TopicState::Subscribed)
    }

    /// Topics waiting for a SUBSCRIBE to be written.
    pub fn has_unsent_subscribes(&self) -> bool {
        self.count(|s| s == TopicState::PendingSubscribe { request: None }) > 0
    }

    /// Topics waiting for an UNSUBSCRIBE to be written.
    pub fn has_unsent_unsubscribes(&self) -> bool {
        self.count(|s| s == TopicState::PendingUnsubscribe { request: None }) > 0
    }

    pub fn subscribed_count(&self) -> usize {
        self.count(|s| s == TopicState::Subscribed)
    }

    pub fn pending_subscribe_count(&self) -> usize {
        self.count(|s| matches!(s, TopicState::PendingSubscribe { .. }))
    }

    pub fn pending_unsubscribe_count(&self) -> usize {
        self.count(|s| matches!(s, TopicState::PendingUnsubscribe { .. }))
    }

    fn count(&self, pred: impl Fn(TopicState) -> bool) -> usize {
        self.inner
            .lock(|t| t.borrow().iter().filter(|e| pred(e.state)).count())
    }
}

// ── Topic names ─────────────────────────────────────────────

/// Which engine handler an inbound topic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundTopic {
    BinaryCommand,
    JsonCommand,
    UpdateAnnounce,
    UpdateData,
    Other,
}

/// Every topic the device uses, built once from its uid `U` and board
/// revision `B`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNames {
    /// `api/cmd/U`: binary commands in.
    pub command: TopicString,
    /// `api/strcmd/U`: JSON commands in.
    pub json_command: TopicString,
    /// `api/cmdret/U`: command replies out.
    pub reply: TopicString,
    /// `api/update`: update announcements in.
    pub update_announce: TopicString,
    /// `api/update/U/drx/B`: update data in.
    pub update_rx: TopicString,
    /// `api/update/U/dtx/B`: update requests out.
    pub update_tx: TopicString,
    /// `api/updatecode/U`: update status out.
    pub update_status: TopicString,
}

impl TopicNames {
    pub fn new(uid: &str, board_version: u16) -> Result<Self, LinkError> {
        Ok(Self {
            command: format_topic(format_args!("api/cmd/{uid}"))?,
            json_command: format_topic(format_args!("api/strcmd/{uid}"))?,
            reply: format_topic(format_args!("api/cmdret/{uid}"))?,
            update_announce: format_topic(format_args!("api/update"))?,
            update_rx: format_topic(format_args!("api/update/{uid}/drx/{board_version}"))?,
            update_tx: format_topic(format_args!("api/update/{uid}/dtx/{board_version}"))?,
            update_status: format_topic(format_args!("api/updatecode/{uid}"))?,
        })
    }

    pub fn classify(&self, topic: &str) -> InboundTopic {
        if topic == self.command.as_str() {
            InboundTopic::BinaryCommand
        } else if topic == self.json_command.as_str() {
            InboundTopic::JsonCommand
        } else if topic == self.update_announce.as_str() {
            InboundTopic::UpdateAnnounce
        } else if topic == self.update_rx.as_str() {
            InboundTopic::UpdateData
        } else {
            InboundTopic::Other
        }
    }

    /// Topics the device subscribes to at startup.
    pub fn inbound(&self) -> [&str; 4] {
        [
            self.command.as_str(),
            self.json_command.as_str(),
            self.update_announce.as_str(),
            self.update_rx.as_str(),
        ]
    }
}

fn format_topic(args: core::fmt::Arguments<'_>) -> Result<TopicString, LinkError> {
    let mut s = TopicString::new();
    s.write_fmt(args).map_err(|_| LinkError::TopicTooLong)?;
    Ok(s)
}
