//! Transport-facing vocabulary: QoS levels, outbound publish records and the
//! tagged inbound event union every [`PubSubTransport`] produces.
//!
//! [`PubSubTransport`]: crate::app::ports::PubSubTransport

use core::fmt;

use log::warn;

use crate::error::LinkError;

/// Longest topic name the engine stores (retry pool, topic table, events).
pub const MAX_TOPIC_LEN: usize = 64;

/// Fixed-capacity topic string.
pub type TopicString = heapless::String<MAX_TOPIC_LEN>;

/// Delivery guarantee requested for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    /// Whether messages at this level must be tracked until acknowledged.
    pub fn is_tracked(self) -> bool {
        self != Self::AtMostOnce
    }
}

/// Why a connect attempt did not produce a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    /// Broker unreachable or refused with "server unavailable".
    ServerUnavailable,
    /// Broker refused the client credentials or identifier.
    Refused,
    /// No CONNACK arrived within the keep-alive window.
    Timeout,
    /// Local network stack failure.
    Network,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerUnavailable => write!(f, "server unavailable"),
            Self::Refused => write!(f, "connection refused"),
            Self::Timeout => write!(f, "connect timed out"),
            Self::Network => write!(f, "network error"),
        }
    }
}

/// One PUBLISH as handed to the transport.
#[derive(Debug, Clone, Copy)]
pub struct OutboundPublish<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
    /// Set on retransmissions.
    pub dup: bool,
    /// Present exactly when `qos` is tracked.
    pub message_id: Option<u16>,
}

/// Everything a transport can report back to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The broker accepted the session (CONNACK ok).
    Connected,
    /// The connect attempt failed.
    ConnectFailed(ConnectError),
    /// The session ended.
    Disconnected,
    /// An application message arrived on a subscribed topic.
    Message {
        topic: TopicString,
        payload: Vec<u8>,
    },
    PubAck(u16),
    PubRec(u16),
    PubComp(u16),
    SubAck(u16),
    UnsubAck(u16),
    PingResp,
}

impl TransportEvent {
    /// Build a `Message` event, rejecting topics that do not fit.
    pub fn message(topic: &str, payload: &[u8]) -> Result<Self, LinkError> {
        let topic = TopicString::try_from(topic).map_err(|_| LinkError::TopicTooLong)?;
        Ok(Self::Message {
            topic,
            payload: payload.to_vec(),
        })
    }
}

/// Events a transport may hold for the engine before it starts dropping.
pub const EVENT_QUEUE_DEPTH: usize = 32;

/// Bounded inbox between a transport's receive context and
/// [`PubSubTransport::poll`](crate::app::ports::PubSubTransport::poll).
#[derive(Debug, Default)]
pub struct EventQueue {
    events: heapless::Deque<TransportEvent, EVENT_QUEUE_DEPTH>,
    dropped: u32,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `event`, dropping it with a warning when the queue is full.
    /// Returns whether it was queued.
    pub fn push(&mut self, event: TransportEvent) -> bool {
        match self.events.push_back(event) {
            Ok(()) => true,
            Err(event) => {
                self.dropped += 1;
                warn!("LINK: event queue full, dropped {:?}", EventKind(&event));
                false
            }
        }
    }

    pub fn pop(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events lost to a full queue since creation.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}

/// Logs an event without its payload bytes.
struct EventKind<'a>(&'a TransportEvent);

impl fmt::Debug for EventKind<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            TransportEvent::Message { topic, payload } => {
                write!(f, "Message({}, {} bytes)", topic, payload.len())
            }
            other => write!(f, "{:?}", other),
        }
    }
}
