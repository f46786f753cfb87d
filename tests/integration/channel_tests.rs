//! ReliableChannel against the mock transport: tracked delivery, retry,
//! backoff tiers, keep-alive and subscription bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use sensorlink::config::LinkConfig;
use sensorlink::error::LinkError;
use sensorlink::link::channel::{Backoff, KeepAlive, LinkState};
use sensorlink::link::pool::POOL_CAPACITY;
use sensorlink::link::topics::TopicState;
use sensorlink::link::transport::{ConnectError, QoS, TransportEvent};

use crate::mock_link::{START_MS, UID, Wire, channel_with, connected_channel, publish_ids, take_log};

fn cfg() -> LinkConfig {
    LinkConfig::default()
}

// ── Publishing ────────────────────────────────────────────────

#[test]
fn publish_while_disconnected_is_refused() {
    let (channel, shared, _clock) = channel_with(&cfg());
    assert_eq!(
        channel.publish("t", b"x", QoS::AtLeastOnce, false),
        Err(LinkError::NotConnected)
    );
    assert!(take_log(&shared).is_empty());
}

#[test]
fn qos0_is_untracked() {
    let (channel, shared, _clock) = connected_channel(&cfg());
    assert_eq!(channel.publish("t", b"x", QoS::AtMostOnce, false), Ok(None));
    assert!(channel.pool().is_empty());
    assert_eq!(
        take_log(&shared),
        vec![Wire::Publish {
            topic: "t".into(),
            payload: b"x".to_vec(),
            qos: QoS::AtMostOnce,
            dup: false,
            id: None,
        }]
    );
}

#[test]
fn qos1_tracked_until_puback() {
    let (channel, _shared, _clock) = connected_channel(&cfg());
    let id = channel
        .publish("t", b"x", QoS::AtLeastOnce, false)
        .unwrap()
        .expect("tracked publish gets an id");
    assert_ne!(id, 0);
    assert!(channel.pool().contains(id));

    channel.handle_event(TransportEvent::PubAck(id));
    assert!(channel.pool().is_empty());
}

#[test]
fn full_pool_rejects_without_writing() {
    let (channel, shared, _clock) = connected_channel(&cfg());
    for _ in 0..POOL_CAPACITY {
        channel.publish("t", b"x", QoS::AtLeastOnce, false).unwrap();
    }
    take_log(&shared);

    assert_eq!(
        channel.publish("t", b"x", QoS::AtLeastOnce, false),
        Err(LinkError::PoolFull)
    );
    assert!(take_log(&shared).is_empty(), "nothing reaches the wire");
    assert_eq!(channel.pool().len(), POOL_CAPACITY);
}

#[test]
fn ids_are_unique_among_tracked_messages() {
    let (channel, shared, _clock) = connected_channel(&cfg());
    for _ in 0..POOL_CAPACITY {
        channel.publish("t", b"x", QoS::AtLeastOnce, false).unwrap();
    }
    let mut ids = publish_ids(&take_log(&shared));
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), POOL_CAPACITY);
    assert!(!ids.contains(&0));
}

#[test]
fn oversized_payload_is_rejected_before_write() {
    let (channel, shared, _clock) = connected_channel(&cfg());
    let big = vec![0u8; 4096];
    assert_eq!(
        channel.publish("t", &big, QoS::AtLeastOnce, false),
        Err(LinkError::PayloadTooLarge)
    );
    assert!(take_log(&shared).is_empty());
}

#[test]
fn transport_failure_leaves_pool_untouched() {
    let (channel, shared, _clock) = connected_channel(&cfg());
    shared.lock().unwrap().fail_writes = true;
    assert_eq!(
        channel.publish("t", b"x", QoS::AtLeastOnce, false),
        Err(LinkError::Transport)
    );
    assert!(channel.pool().is_empty());
}

#[test]
fn publish_waiting_past_lock_timeout_is_dropped() {
    let c = LinkConfig {
        publish_timeout_ms: 50,
        ..cfg()
    };
    let (channel, shared, _clock) = connected_channel(&c);
    shared.lock().unwrap().hold_publishes = true;

    let first = {
        let channel = Arc::clone(&channel);
        std::thread::spawn(move || channel.publish("first", b"x", QoS::AtLeastOnce, false))
    };
    while shared.lock().unwrap().held == 0 {
        std::thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(
        channel.publish("second", b"y", QoS::AtLeastOnce, false),
        Err(LinkError::LockTimeout)
    );
    assert!(channel.pool().is_empty(), "nothing registered while blocked");

    shared.lock().unwrap().hold_publishes = false;
    let id = first.join().unwrap().unwrap().expect("tracked publish gets an id");
    assert_eq!(channel.pool().len(), 1);
    assert!(channel.pool().contains(id));
    let log = take_log(&shared);
    assert_eq!(log.len(), 1);
    assert!(matches!(&log[0], Wire::Publish { topic, .. } if topic == "first"));
}

#[test]
fn concurrent_publishers_get_distinct_ids() {
    let (channel, shared, _clock) = connected_channel(&cfg());
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let channel = Arc::clone(&channel);
            std::thread::spawn(move || {
                (0..2)
                    .map(|_| channel.publish("t", b"x", QoS::AtLeastOnce, false).unwrap().unwrap())
                    .collect::<Vec<u16>>()
            })
        })
        .collect();
    let mut ids: Vec<u16> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 8);
    assert_eq!(channel.pool().len(), 8);
    assert_eq!(publish_ids(&take_log(&shared)).len(), 8);
}

// ── Retry sweep ───────────────────────────────────────────────

#[test]
fn sweep_resends_with_dup_after_interval() {
    let c = cfg();
    let (channel, shared, clock) = connected_channel(&c);
    let id = channel
        .publish("t", b"x", QoS::AtLeastOnce, false)
        .unwrap()
        .unwrap();
    take_log(&shared);

    clock.advance(c.retry_interval_ms as u64 - 1);
    assert_eq!(channel.sweep(), 0, "not due yet");

    clock.advance(1);
    assert_eq!(channel.sweep(), 1);
    assert_eq!(
        take_log(&shared),
        vec![Wire::Publish {
            topic: "t".into(),
            payload: b"x".to_vec(),
            qos: QoS::AtLeastOnce,
            dup: true,
            id: Some(id),
        }]
    );
    assert_eq!(channel.pool().get(id).unwrap().publish_count, 2);
    assert_eq!(channel.resends(), 1);

    assert_eq!(channel.sweep(), 0, "rescheduled a full interval out");
}

#[test]
fn sweep_does_nothing_while_disconnected() {
    let c = cfg();
    let (channel, shared, clock) = connected_channel(&c);
    channel.publish("t", b"x", QoS::AtLeastOnce, false).unwrap();
    channel.handle_event(TransportEvent::Disconnected);
    take_log(&shared);

    clock.advance(c.retry_interval_ms as u64 * 3);
    assert_eq!(channel.sweep(), 0);
    assert_eq!(channel.pool().len(), 1, "retained for the next session");
}

#[test]
fn qos2_release_and_complete() {
    let c = cfg();
    let (channel, shared, clock) = connected_channel(&c);
    let id = channel
        .publish("t", b"x", QoS::ExactlyOnce, false)
        .unwrap()
        .unwrap();
    take_log(&shared);

    channel.handle_event(TransportEvent::PubRec(id));
    assert_eq!(take_log(&shared), vec![Wire::Release(id)]);
    assert!(channel.pool().get(id).unwrap().released);

    clock.advance(c.retry_interval_ms as u64);
    channel.sweep();
    assert_eq!(take_log(&shared), vec![Wire::Release(id)], "PUBREL resent, not the payload");

    channel.handle_event(TransportEvent::PubComp(id));
    assert!(channel.pool().is_empty());
}

#[test]
fn unknown_ack_is_ignored() {
    let (channel, _shared, _clock) = connected_channel(&cfg());
    channel.publish("t", b"x", QoS::AtLeastOnce, false).unwrap();
    channel.handle_event(TransportEvent::PubAck(999));
    assert_eq!(channel.pool().len(), 1);
}

// ── Connection lifecycle ──────────────────────────────────────

#[test]
fn connect_presents_uid_as_client_id() {
    let (channel, shared, _clock) = channel_with(&cfg());
    assert!(channel.connect());
    assert_eq!(channel.state(), LinkState::Connecting);
    assert_eq!(take_log(&shared), vec![Wire::Connect(UID.into())]);
    assert!(!channel.connect(), "already connecting");
}

#[test]
fn session_loss_uses_short_backoff() {
    let c = cfg();
    let (channel, _shared, clock) = connected_channel(&c);
    channel.handle_event(TransportEvent::Disconnected);

    assert_eq!(channel.state(), LinkState::Disconnected);
    assert_eq!(channel.backoff(), Some(Backoff::Short));
    assert_eq!(channel.retry_at(), START_MS + c.reconnect_short_ms as u64);
    assert_eq!(channel.reconnects(), 1);

    clock.advance(c.reconnect_short_ms as u64 - 1);
    assert!(!channel.connect());
    clock.advance(1);
    assert!(channel.connect());
}

#[test]
fn failed_connect_uses_long_backoff() {
    let c = cfg();
    let (channel, _shared, clock) = channel_with(&c);
    assert!(channel.connect());
    channel.handle_event(TransportEvent::ConnectFailed(ConnectError::ServerUnavailable));

    assert_eq!(channel.backoff(), Some(Backoff::Long));
    assert_eq!(channel.retry_at(), START_MS + c.reconnect_long_ms as u64);
    assert_eq!(channel.reconnects(), 0, "never established");

    clock.advance(c.reconnect_short_ms as u64);
    assert!(!channel.connect(), "short delay is not enough");
    clock.advance(c.reconnect_long_ms as u64);
    assert!(channel.connect());
}

#[test]
fn synchronous_connect_refusal_backs_off_long() {
    let (channel, shared, _clock) = channel_with(&cfg());
    shared.lock().unwrap().refuse_connect = Some(ConnectError::Refused);
    assert!(channel.connect(), "an attempt was made");
    assert_eq!(channel.state(), LinkState::Disconnected);
    assert_eq!(channel.backoff(), Some(Backoff::Long));
}

#[test]
fn close_stops_reconnecting() {
    let (channel, shared, clock) = connected_channel(&cfg());
    channel.close();
    assert_eq!(take_log(&shared), vec![Wire::Disconnect]);
    clock.advance(3_600_000);
    assert!(!channel.connect());
}

// ── Keep-alive ────────────────────────────────────────────────

#[test]
fn pings_at_half_interval_and_drops_at_full() {
    let c = cfg();
    let half = c.keepalive_ms() / 2;
    let (channel, shared, clock) = connected_channel(&c);

    clock.advance(half - 1);
    assert_eq!(channel.keepalive_check(), KeepAlive::Idle);

    clock.advance(1);
    assert_eq!(channel.keepalive_check(), KeepAlive::PingSent);
    assert_eq!(take_log(&shared), vec![Wire::Ping]);
    assert_eq!(channel.keepalive_check(), KeepAlive::Idle, "one ping per half interval");

    clock.advance(half);
    assert_eq!(channel.keepalive_check(), KeepAlive::Dropped);
    assert_eq!(take_log(&shared), vec![Wire::Disconnect]);
    assert_eq!(channel.backoff(), Some(Backoff::Short));
}

#[test]
fn inbound_traffic_keeps_link_alive() {
    let c = cfg();
    let (channel, _shared, clock) = connected_channel(&c);
    for _ in 0..4 {
        clock.advance(c.keepalive_ms() / 2 - 1);
        channel.handle_event(TransportEvent::PingResp);
        assert_eq!(channel.keepalive_check(), KeepAlive::Idle);
    }
    assert!(channel.is_connected());
}

#[test]
fn stalled_connect_times_out_after_one_interval() {
    let c = cfg();
    let (channel, _shared, clock) = channel_with(&c);
    assert!(channel.connect());
    clock.advance(c.keepalive_ms());
    assert_eq!(channel.keepalive_check(), KeepAlive::Dropped);
    assert_eq!(channel.backoff(), Some(Backoff::Long));
}

// ── Subscriptions ─────────────────────────────────────────────

#[test]
fn subscriptions_queue_until_connected() {
    let (channel, shared, _clock) = channel_with(&cfg());
    channel.subscribe("a", QoS::AtLeastOnce).unwrap();
    channel.subscribe("b", QoS::AtLeastOnce).unwrap();
    assert!(channel.connect());
    take_log(&shared);

    channel.handle_event(TransportEvent::Connected);
    let log = take_log(&shared);
    let [Wire::Subscribe { id, topics }] = log.as_slice() else {
        panic!("expected one SUBSCRIBE, got {:?}", log);
    };
    assert_eq!(topics, &["a".to_string(), "b".to_string()]);

    channel.handle_event(TransportEvent::SubAck(*id));
    assert!(channel.topics().is_subscribed("a"));
    assert!(channel.topics().is_subscribed("b"));
}

#[test]
fn unsubscribe_while_pending_subscribe() {
    let (channel, shared, _clock) = connected_channel(&cfg());
    channel.subscribe("a", QoS::AtLeastOnce).unwrap();
    let sub_id = match take_log(&shared).as_slice() {
        [Wire::Subscribe { id, .. }] => *id,
        other => panic!("unexpected {:?}", other),
    };

    channel.unsubscribe("a").unwrap();
    assert!(matches!(
        channel.topics().state_of("a"),
        Some(TopicState::PendingUnsubscribe { .. })
    ));
    let log = take_log(&shared);
    let [Wire::Unsubscribe { id: unsub_id, .. }] = log.as_slice() else {
        panic!("expected one UNSUBSCRIBE, got {:?}", log);
    };

    // The stale SUBACK must not resurrect the topic.
    channel.handle_event(TransportEvent::SubAck(sub_id));
    assert!(!channel.topics().is_subscribed("a"));
    channel.handle_event(TransportEvent::UnsubAck(*unsub_id));
    assert_eq!(channel.topics().state_of("a"), None);
}

#[test]
fn session_loss_resubscribes_on_reconnect() {
    let c = cfg();
    let (channel, shared, clock) = connected_channel(&c);
    channel.subscribe("a", QoS::AtLeastOnce).unwrap();
    let id = match take_log(&shared).as_slice() {
        [Wire::Subscribe { id, .. }] => *id,
        other => panic!("unexpected {:?}", other),
    };
    channel.handle_event(TransportEvent::SubAck(id));

    channel.handle_event(TransportEvent::Disconnected);
    assert!(!channel.topics().is_subscribed("a"));

    clock.advance(c.reconnect_short_ms as u64);
    assert!(channel.connect());
    channel.handle_event(TransportEvent::Connected);
    assert!(take_log(&shared)
        .iter()
        .any(|w| matches!(w, Wire::Subscribe { topics, .. } if topics == &["a".to_string()])));
}

#[test]
fn inbound_message_is_handed_up() {
    let (channel, _shared, _clock) = connected_channel(&cfg());
    let msg = channel
        .handle_event(TransportEvent::message("api/cmd/x", b"\x01\x00").unwrap())
        .expect("application message");
    assert_eq!(msg.topic.as_str(), "api/cmd/x");
    assert_eq!(msg.payload, b"\x01\x00");
}
