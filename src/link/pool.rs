//! RetryPool: bounded store of QoS>0 publishes awaiting acknowledgment.
//!
//! Slots live in a fixed arena; a stack of free indices gives O(1)
//! allocation and an id → slot index gives O(1) drain on acknowledgment.
//! Every method takes `&self`: the pool is shared by the I/O task (drain on
//! ack), the publishing path (register) and the retry task (sweep), so its
//! state sits behind an `embassy_sync` blocking mutex.
//!
//! ```text
//!   register ──▶ [slot: id, topic, payload, count, due_at] ──▶ drain (ack)
//!                        │
//!                        └── sweep: due? ──▶ resend(dup) ─┐
//!                                   ▲─────────────────────┘
//! ```

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use heapless::FnvIndexMap;
use log::{debug, warn};

use crate::error::LinkError;
use crate::link::transport::{MAX_TOPIC_LEN, QoS, TopicString};

/// Number of messages that can be awaiting acknowledgment at once.
pub const POOL_CAPACITY: usize = 10;

/// Largest payload the pool retains for retransmission.
pub const MAX_RETAINED_PAYLOAD: usize = 512;

// Index capacity must be a power of two no smaller than POOL_CAPACITY.
const INDEX_CAPACITY: usize = 16;

/// A tracked publish, copied out of the pool for retransmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PooledMessage {
    pub message_id: u16,
    pub topic: TopicString,
    pub payload: heapless::Vec<u8, MAX_RETAINED_PAYLOAD>,
    pub qos: QoS,
    pub retain: bool,
    /// How many times the message has gone out, the first send included.
    pub publish_count: u32,
    /// Monotonic time (ms) at which the next resend is due.
    pub due_at: u64,
    /// QoS 2 only: PUBREC seen, PUBREL is what gets retransmitted.
    pub released: bool,
}

struct Slots {
    slots: [Option<PooledMessage>; POOL_CAPACITY],
    free: heapless::Vec<u8, POOL_CAPACITY>,
    index: FnvIndexMap<u16, u8, INDEX_CAPACITY>,
}

impl Slots {
    fn new() -> Self {
        let mut free = heapless::Vec::new();
        // Pop order hands out slot 0 first.
        for i in (0..POOL_CAPACITY as u8).rev() {
            let _ = free.push(i);
        }
        Self {
            slots: core::array::from_fn(|_| None),
            free,
            index: FnvIndexMap::new(),
        }
    }
}

pub struct RetryPool {
    inner: Mutex<CriticalSectionRawMutex, RefCell<Slots>>,
    retry_interval_ms: u64,
}

impl RetryPool {
    pub fn new(retry_interval_ms: u64) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Slots::new())),
            retry_interval_ms,
        }
    }

    pub fn capacity(&self) -> usize {
        POOL_CAPACITY
    }

    pub fn len(&self) -> usize {
        self.inner.lock(|s| s.borrow().index.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock(|s| s.borrow().free.is_empty())
    }

    pub fn contains(&self, message_id: u16) -> bool {
        self.inner.lock(|s| s.borrow().index.contains_key(&message_id))
    }

    /// Whether `topic` and `payload` fit the fixed slot buffers.
    pub fn fits(topic: &str, payload: &[u8]) -> Result<(), LinkError> {
        if topic.len() > MAX_TOPIC_LEN {
            return Err(LinkError::TopicTooLong);
        }
        if payload.len() > MAX_RETAINED_PAYLOAD {
            return Err(LinkError::PayloadTooLarge);
        }
        Ok(())
    }

    /// Start tracking a message that has just been written to the transport.
    ///
    /// The topic and payload are copied into the slot.
    pub fn register(
        &self,
        message_id: u16,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
        now_ms: u64,
    ) -> Result<(), LinkError> {
        let topic = TopicString::try_from(topic).map_err(|_| LinkError::TopicTooLong)?;
        let payload = heapless::Vec::from_slice(payload).map_err(|_| LinkError::PayloadTooLarge)?;
        let msg = PooledMessage {
            message_id,
            topic,
            payload,
            qos,
            retain,
            publish_count: 1,
            due_at: now_ms + self.retry_interval_ms,
            released: false,
        };

        self.inner.lock(|s| {
            let mut s = s.borrow_mut();
            if s.index.contains_key(&message_id) {
                warn!("POOL: id {} already in flight", message_id);
                return Err(LinkError::DuplicateId);
            }
            let Some(slot) = s.free.pop() else {
                warn!("POOL: full, cannot track id {}", message_id);
                return Err(LinkError::PoolFull);
            };
            if s.index.insert(message_id, slot).is_err() {
                let _ = s.free.push(slot);
                return Err(LinkError::PoolFull);
            }
            s.slots[slot as usize] = Some(msg);
            debug!("POOL: tracking id {} in slot {}", message_id, slot);
            Ok(())
        })
    }

    /// Stop tracking `message_id`. Returns `false` if it was not tracked.
    pub fn drain(&self, message_id: u16) -> bool {
        self.inner.lock(|s| {
            let mut s = s.borrow_mut();
            let Some(slot) = s.index.remove(&message_id) else {
                return false;
            };
            s.slots[slot as usize] = None;
            let _ = s.free.push(slot);
            debug!("POOL: drained id {}", message_id);
            true
        })
    }

    /// Record that the broker has received a QoS 2 message; subsequent
    /// retransmissions send the release instead of the publish.
    pub fn mark_released(&self, message_id: u16) -> bool {
        self.inner.lock(|s| {
            let mut s = s.borrow_mut();
            let Some(&slot) = s.index.get(&message_id) else {
                return false;
            };
            match s.slots[slot as usize].as_mut() {
                Some(m) => {
                    m.released = true;
                    true
                }
                None => false,
            }
        })
    }

    /// Copy of the tracked message, if any.
    pub fn get(&self, message_id: u16) -> Option<PooledMessage> {
        self.inner.lock(|s| {
            let s = s.borrow();
            let slot = *s.index.get(&message_id)?;
            s.slots[slot as usize].clone()
        })
    }

    /// Hand every message that is due to `resend`, bumping its publish count
    /// and rescheduling it one retry interval later.
    ///
    /// The lock is held only while a single slot is inspected; `resend` runs
    /// outside it, so it may publish or drain freely. A slot drained during
    /// the sweep is skipped. Returns the number of messages handed out.
    pub fn sweep(&self, now_ms: u64, mut resend: impl FnMut(&PooledMessage)) -> usize {
        let mut sent = 0;
        for slot in 0..POOL_CAPACITY {
            let due = self.inner.lock(|s| {
                let mut s = s.borrow_mut();
                let msg = s.slots[slot].as_mut()?;
                if now_ms < msg.due_at {
                    return None;
                }
                msg.publish_count += 1;
                msg.due_at = now_ms + self.retry_interval_ms;
                Some(msg.clone())
            });
            if let Some(msg) = due {
                debug!(
                    "POOL: id {} due, attempt {}",
                    msg.message_id, msg.publish_count
                );
                resend(&msg);
                sent += 1;
            }
        }
        sent
    }
}
