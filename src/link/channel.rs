//! ReliableChannel: connection lifecycle, tracked delivery and keep-alive
//! over a [`PubSubTransport`].
//!
//! ```text
//!   Disconnected ──connect()──▶ Connecting ──Connected──▶ Connected
//!        ▲   ▲                      │                        │
//!        │   └── long backoff ◀─────┘ ConnectFailed/timeout  │
//!        └────── short backoff ◀──────── Disconnected/dead ──┘
//! ```
//!
//! The transport sits behind an async mutex that doubles as the publish
//! lock: every outbound write (publish, resend, release, subscribe, ping)
//! takes it with a bounded wait, so the I/O, retry and keep-alive tasks
//! never interleave packets. Link bookkeeping lives in a separate blocking
//! mutex and is never held across a transport call.

use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use log::{debug, info, warn};

use crate::app::ports::{Clock, PubSubTransport, Responder};
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::link::pool::{PooledMessage, RetryPool};
use crate::link::topics::{MAX_TOPICS, TopicSet};
use crate::link::transport::{ConnectError, OutboundPublish, QoS, TopicString, TransportEvent};
use crate::sync::timed;

/// Longest client identifier presented to the broker.
pub const MAX_CLIENT_ID_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Which reconnect delay is currently scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// After losing an established session.
    Short,
    /// After a failed connect attempt.
    Long,
}

/// Result of one keep-alive evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAlive {
    Idle,
    PingSent,
    /// The link was declared dead and torn down.
    Dropped,
}

/// An application message handed up to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: TopicString,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct LinkStatus {
    state: LinkState,
    backoff: Option<Backoff>,
    /// Earliest time the next connect attempt may start.
    retry_at: u64,
    connect_started: u64,
    last_rx: u64,
    last_ping: u64,
    next_id: u16,
}

pub struct ReliableChannel<T: PubSubTransport, C: Clock> {
    transport: Mutex<CriticalSectionRawMutex, T>,
    link: BlockingMutex<CriticalSectionRawMutex, RefCell<LinkStatus>>,
    pool: RetryPool,
    topics: TopicSet,
    clock: C,
    client_id: heapless::String<MAX_CLIENT_ID_LEN>,
    keepalive_secs: u16,
    reconnect_short_ms: u64,
    reconnect_long_ms: u64,
    publish_timeout: Duration,
    auto_subscribe: bool,
    resends: AtomicU32,
    reconnects: AtomicU32,
}

impl<T: PubSubTransport, C: Clock> ReliableChannel<T, C> {
    pub fn new(transport: T, clock: C, client_id: &str, cfg: &LinkConfig) -> Result<Self, LinkError> {
        let client_id = heapless::String::try_from(client_id).map_err(|_| LinkError::TopicTooLong)?;
        Ok(Self {
            transport: Mutex::new(transport),
            link: BlockingMutex::new(RefCell::new(LinkStatus {
                state: LinkState::Disconnected,
                backoff: None,
                retry_at: 0,
                connect_started: 0,
                last_rx: 0,
                last_ping: 0,
                next_id: 1,
            })),
            pool: RetryPool::new(cfg.retry_interval_ms as u64),
            topics: TopicSet::new(),
            clock,
            client_id,
            keepalive_secs: cfg.keepalive_secs,
            reconnect_short_ms: cfg.reconnect_short_ms as u64,
            reconnect_long_ms: cfg.reconnect_long_ms as u64,
            publish_timeout: Duration::from_millis(cfg.publish_timeout_ms as u64),
            auto_subscribe: cfg.auto_subscribe,
            resends: AtomicU32::new(0),
            reconnects: AtomicU32::new(0),
        })
    }

    // ── Introspection ───────────────────────────────────────

    pub fn state(&self) -> LinkState {
        self.status().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Currently scheduled backoff tier, if a reconnect is pending.
    pub fn backoff(&self) -> Option<Backoff> {
        self.status().backoff
    }

    /// Earliest time (ms) the next connect attempt may start.
    pub fn retry_at(&self) -> u64 {
        self.status().retry_at
    }

    pub fn pool(&self) -> &RetryPool {
        &self.pool
    }

    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn resends(&self) -> u32 {
        self.resends.load(Ordering::Relaxed)
    }

    /// Established sessions lost since boot.
    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }

    fn status(&self) -> LinkStatus {
        self.link.lock(|s| *s.borrow())
    }

    fn update<R>(&self, f: impl FnOnce(&mut LinkStatus) -> R) -> R {
        self.link.lock(|s| f(&mut s.borrow_mut()))
    }

    fn lock_transport(&self) -> Result<MutexGuard<'_, CriticalSectionRawMutex, T>, LinkError> {
        timed::lock_within(&self.transport, self.publish_timeout).ok_or_else(|| {
            warn!("LINK: publish lock not acquired within {:?}", self.publish_timeout);
            LinkError::LockTimeout
        })
    }

    /// Next free message id. Zero is never used and ids still tracked by
    /// the pool or carrying a subscription request are skipped. Call with
    /// the transport lock held.
    fn next_message_id(&self) -> u16 {
        loop {
            let id = self.update(|s| {
                let id = s.next_id;
                s.next_id = s.next_id.wrapping_add(1).max(1);
                id
            });
            if !self.pool.contains(id) && !self.topics.has_request(id) {
                return id;
            }
        }
    }

    // ── Connection lifecycle ────────────────────────────────

    /// Start a connect attempt if the link is down and its backoff has
    /// elapsed. Returns whether an attempt was made.
    pub fn connect(&self) -> bool {
        let now = self.clock.now_ms();
        let due = self.update(|s| {
            if s.state != LinkState::Disconnected || now < s.retry_at {
                return false;
            }
            s.state = LinkState::Connecting;
            s.connect_started = now;
            true
        });
        if !due {
            return false;
        }

        let result = match self.lock_transport() {
            Ok(mut t) => t.connect(&self.client_id, self.keepalive_secs),
            Err(_) => {
                self.update(|s| s.state = LinkState::Disconnected);
                return false;
            }
        };
        match result {
            Ok(()) => debug!("LINK: connecting as '{}'", self.client_id),
            Err(e) => self.on_connect_failed(e),
        }
        true
    }

    /// Tear the session down for good; no reconnect is scheduled.
    pub fn close(&self) {
        if let Ok(mut t) = self.lock_transport() {
            t.disconnect();
        }
        self.update(|s| {
            s.state = LinkState::Disconnected;
            s.backoff = None;
            s.retry_at = u64::MAX;
        });
        self.topics.reset_acks();
        info!("LINK: closed");
    }

    fn on_connected(&self) {
        let now = self.clock.now_ms();
        self.update(|s| {
            s.state = LinkState::Connected;
            s.backoff = None;
            s.last_rx = now;
            s.last_ping = now;
        });
        info!("LINK: connected");
        if self.auto_subscribe {
            if let Err(e) = self.flush_subscriptions() {
                warn!("LINK: subscribe after connect failed: {}", e);
            }
        }
    }

    fn on_connect_failed(&self, reason: ConnectError) {
        let now = self.clock.now_ms();
        let retry_at = now + self.reconnect_long_ms;
        self.update(|s| {
            s.state = LinkState::Disconnected;
            s.backoff = Some(Backoff::Long);
            s.retry_at = retry_at;
        });
        warn!(
            "LINK: connect failed ({}), retrying in {} ms",
            reason, self.reconnect_long_ms
        );
    }

    fn on_disconnected(&self) {
        let now = self.clock.now_ms();
        let prev = self.update(|s| {
            let prev = s.state;
            if prev == LinkState::Connected {
                s.state = LinkState::Disconnected;
                s.backoff = Some(Backoff::Short);
                s.retry_at = now + self.reconnect_short_ms;
            }
            prev
        });
        match prev {
            LinkState::Connected => {
                self.reconnects.fetch_add(1, Ordering::Relaxed);
                self.topics.reset_acks();
                warn!(
                    "LINK: session lost, reconnecting in {} ms",
                    self.reconnect_short_ms
                );
            }
            LinkState::Connecting => self.on_connect_failed(ConnectError::Network),
            LinkState::Disconnected => {}
        }
    }

    /// Disconnect the transport locally and run the disconnect bookkeeping.
    fn drop_session(&self) {
        if let Ok(mut t) = self.lock_transport() {
            t.disconnect();
        }
        self.on_disconnected();
    }

    // ── Inbound ─────────────────────────────────────────────

    /// Fetch the next transport event without waiting for the publish lock.
    pub fn poll(&self) -> Option<TransportEvent> {
        self.transport.try_lock().ok()?.poll()
    }

    /// Apply a transport event to the link state. Application messages are
    /// returned for dispatch; everything else is consumed here.
    pub fn handle_event(&self, event: TransportEvent) -> Option<InboundMessage> {
        if !matches!(
            event,
            TransportEvent::Disconnected | TransportEvent::ConnectFailed(_)
        ) {
            let now = self.clock.now_ms();
            self.update(|s| s.last_rx = now);
        }

        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::ConnectFailed(reason) => self.on_connect_failed(reason),
            TransportEvent::Disconnected => self.on_disconnected(),
            TransportEvent::Message { topic, payload } => {
                debug!("LINK: {} bytes on {}", payload.len(), topic);
                return Some(InboundMessage { topic, payload });
            }
            TransportEvent::PubAck(id) | TransportEvent::PubComp(id) => {
                if !self.pool.drain(id) {
                    debug!("LINK: ack for untracked id {}", id);
                }
            }
            TransportEvent::PubRec(id) => {
                if self.pool.mark_released(id) {
                    if let Err(e) = self.send_release(id) {
                        warn!("LINK: PUBREL {} failed: {}", id, e);
                    }
                }
            }
            TransportEvent::SubAck(id) => {
                let n = self.topics.ack_subscribe(id);
                info!("LINK: SUBACK {} ({} topic(s))", id, n);
                if let Err(e) = self.flush_subscriptions() {
                    warn!("LINK: subscribe flush failed: {}", e);
                }
            }
            TransportEvent::UnsubAck(id) => {
                let n = self.topics.ack_unsubscribe(id);
                info!("LINK: UNSUBACK {} ({} topic(s))", id, n);
            }
            TransportEvent::PingResp => {}
        }
        None
    }

    // ── Outbound ────────────────────────────────────────────

    /// Publish `payload` on `topic`.
    ///
    /// QoS 0 is fire-and-forget. QoS 1/2 messages get a fresh message id and
    /// are tracked in the retry pool until acknowledged; if the pool is full
    /// nothing is written. Returns the id assigned, if any.
    pub fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<Option<u16>, LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        if qos.is_tracked() {
            RetryPool::fits(topic, payload)?;
        }

        let mut t = self.lock_transport()?;
        if !qos.is_tracked() {
            t.publish(&OutboundPublish {
                topic,
                payload,
                qos,
                retain,
                dup: false,
                message_id: None,
            })?;
            return Ok(None);
        }

        if self.pool.is_full() {
            warn!("LINK: retry pool full, dropping publish to {}", topic);
            return Err(LinkError::PoolFull);
        }
        let id = self.next_message_id();
        t.publish(&OutboundPublish {
            topic,
            payload,
            qos,
            retain,
            dup: false,
            message_id: Some(id),
        })?;
        self.pool
            .register(id, topic, payload, qos, retain, self.clock.now_ms())?;
        Ok(Some(id))
    }

    fn send_release(&self, id: u16) -> Result<(), LinkError> {
        self.lock_transport()?.release(id)
    }

    /// Retransmit every tracked message that is due. Returns the number
    /// handed to the transport.
    pub fn sweep(&self) -> usize {
        if !self.is_connected() {
            return 0;
        }
        self.pool.sweep(self.clock.now_ms(), |msg| {
            if let Err(e) = self.resend(msg) {
                warn!("LINK: resend of id {} failed: {}", msg.message_id, e);
            }
        })
    }

    fn resend(&self, msg: &PooledMessage) -> Result<(), LinkError> {
        let mut t = self.lock_transport()?;
        // Acked while waiting for the lock.
        if !self.pool.contains(msg.message_id) {
            return Ok(());
        }
        if msg.released {
            t.release(msg.message_id)?;
        } else {
            t.publish(&OutboundPublish {
                topic: &msg.topic,
                payload: &msg.payload,
                qos: msg.qos,
                retain: msg.retain,
                dup: true,
                message_id: Some(msg.message_id),
            })?;
        }
        self.resends.fetch_add(1, Ordering::Relaxed);
        debug!(
            "LINK: resent id {} (attempt {})",
            msg.message_id, msg.publish_count
        );
        Ok(())
    }

    // ── Subscriptions ───────────────────────────────────────

    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), LinkError> {
        if self.topics.subscribe(topic, qos)? {
            self.flush_subscriptions()?;
        }
        Ok(())
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<(), LinkError> {
        if self.topics.unsubscribe(topic) {
            self.flush_subscriptions()?;
        }
        Ok(())
    }

    /// Write SUBSCRIBE/UNSUBSCRIBE requests for every topic not yet carried
    /// by one. No-op while disconnected.
    pub fn flush_subscriptions(&self) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Ok(());
        }
        let mut t = self.lock_transport()?;

        if self.topics.has_unsent_subscribes() {
            let id = self.next_message_id();
            let batch = self.topics.take_subscribe_batch(id);
            let list: heapless::Vec<(&str, QoS), MAX_TOPICS> =
                batch.iter().map(|(name, qos)| (name.as_str(), *qos)).collect();
            if let Err(e) = t.subscribe(id, &list) {
                self.topics.cancel_request(id);
                return Err(e);
            }
            info!("LINK: SUBSCRIBE {} ({} topic(s))", id, list.len());
        }

        if self.topics.has_unsent_unsubscribes() {
            let id = self.next_message_id();
            let batch = self.topics.take_unsubscribe_batch(id);
            let list: heapless::Vec<&str, MAX_TOPICS> = batch.iter().map(|n| n.as_str()).collect();
            if let Err(e) = t.unsubscribe(id, &list) {
                self.topics.cancel_request(id);
                return Err(e);
            }
            info!("LINK: UNSUBSCRIBE {} ({} topic(s))", id, list.len());
        }
        Ok(())
    }

    // ── Keep-alive ──────────────────────────────────────────

    /// Evaluate link liveness.
    ///
    /// A connected link with no inbound traffic for a full keep-alive
    /// interval is torn down; after half an interval without traffic or a
    /// ping, a ping is sent. A connect attempt that has produced no outcome
    /// within one interval counts as failed.
    pub fn keepalive_check(&self) -> KeepAlive {
        let now = self.clock.now_ms();
        let keepalive_ms = self.keepalive_secs as u64 * 1000;
        let s = self.status();

        match s.state {
            LinkState::Disconnected => KeepAlive::Idle,
            LinkState::Connecting => {
                if now.saturating_sub(s.connect_started) < keepalive_ms {
                    return KeepAlive::Idle;
                }
                if let Ok(mut t) = self.lock_transport() {
                    t.disconnect();
                }
                self.on_connect_failed(ConnectError::Timeout);
                KeepAlive::Dropped
            }
            LinkState::Connected => {
                let silent = now.saturating_sub(s.last_rx);
                if silent >= keepalive_ms {
                    warn!("LINK: no traffic for {} ms, dropping session", silent);
                    self.drop_session();
                    return KeepAlive::Dropped;
                }
                if now.saturating_sub(s.last_rx.max(s.last_ping)) < keepalive_ms / 2 {
                    return KeepAlive::Idle;
                }
                match self.lock_transport().and_then(|mut t| t.ping()) {
                    Ok(()) => {
                        self.update(|s| s.last_ping = now);
                        debug!("LINK: ping");
                        KeepAlive::PingSent
                    }
                    Err(e) => {
                        warn!("LINK: ping failed: {}", e);
                        KeepAlive::Idle
                    }
                }
            }
        }
    }
}

// ── Responder ───────────────────────────────────────────────

/// [`Responder`] over a channel, replying on a fixed topic at QoS 1.
pub struct ChannelResponder<'a, T: PubSubTransport, C: Clock> {
    channel: &'a ReliableChannel<T, C>,
    reply_topic: &'a str,
}

impl<'a, T: PubSubTransport, C: Clock> ChannelResponder<'a, T, C> {
    pub fn new(channel: &'a ReliableChannel<T, C>, reply_topic: &'a str) -> Self {
        Self {
            channel,
            reply_topic,
        }
    }
}

impl<T: PubSubTransport, C: Clock> Responder for ChannelResponder<'_, T, C> {
    fn reply(&self, payload: &[u8]) -> Result<(), LinkError> {
        self.channel
            .publish(self.reply_topic, payload, QoS::AtLeastOnce, false)
            .map(|_| ())
    }

    fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), LinkError> {
        self.channel.publish(topic, payload, qos, false).map(|_| ())
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), LinkError> {
        self.channel.subscribe(topic, qos)
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), LinkError> {
        self.channel.unsubscribe(topic)
    }
}
