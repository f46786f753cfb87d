//! Engine: topic routing, command decoding, dispatch and replies.

use std::sync::Arc;

use sensorlink::adapters::time::ManualClock;
use sensorlink::adapters::update_store::MemoryUpdateStore;
use sensorlink::config::{FIRMWARE_VERSION, LinkConfig};
use sensorlink::engine::Engine;
use sensorlink::link::transport::TransportEvent;
use sensorlink::ota::session::SessionState;
use sensorlink::ota::wire::WriteFlag;
use sensorlink::rpc::codec::{CommandKey, encode_binary};
use sensorlink::sync::barrier::PauseBarrier;

use crate::mock_link::{
    DeviceCall, MockDevice, MockTransport, Shared, UID, Wire, channel_with, published_on, queue,
    take_log,
};

type TestEngine = Engine<MockTransport, ManualClock, MemoryUpdateStore, MockDevice>;

fn started_engine(cfg: &LinkConfig) -> (TestEngine, Shared) {
    let (channel, shared, _clock) = channel_with(cfg);
    let mut engine = Engine::new(
        cfg,
        UID,
        channel,
        MemoryUpdateStore::new(),
        MockDevice::default(),
        Arc::new(PauseBarrier::new()),
    )
    .unwrap();
    engine.start().unwrap();
    assert!(engine.channel().connect());
    engine.handle_event(TransportEvent::Connected);
    (engine, shared)
}

fn engine() -> (TestEngine, Shared) {
    started_engine(&LinkConfig::default())
}

fn replies(engine: &TestEngine, shared: &Shared) -> Vec<Vec<u8>> {
    published_on(shared, &engine.topics().reply)
}

fn send(engine: &mut TestEngine, topic: &str, payload: &[u8]) {
    engine.handle_event(TransportEvent::message(topic, payload).unwrap());
}

// ── Startup ───────────────────────────────────────────────────

#[test]
fn start_subscribes_inbound_topics_and_confirms_image() {
    let (engine, shared) = engine();
    assert!(engine.session().store().running_valid());

    let log = take_log(&shared);
    let subscribed: Vec<String> = log
        .iter()
        .filter_map(|w| match w {
            Wire::Subscribe { topics, .. } => Some(topics.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(
        subscribed,
        vec![
            format!("api/cmd/{UID}"),
            format!("api/strcmd/{UID}"),
            "api/update".to_string(),
            format!("api/update/{UID}/drx/1"),
        ]
    );
}

#[test]
fn poll_drains_transport_events() {
    let (mut engine, shared) = engine();
    take_log(&shared);
    let ping = TransportEvent::message(&engine.topics().command, &encode_binary(CommandKey::Ping, &[]));
    queue(&shared, ping.unwrap());
    assert!(engine.poll());
    assert!(!engine.poll(), "queue is empty");
    assert_eq!(replies(&engine, &shared).len(), 1);
}

// ── Binary envelope ───────────────────────────────────────────

#[test]
fn binary_ping_replies_pong() {
    let (mut engine, shared) = engine();
    let topic = engine.topics().command.clone();
    send(&mut engine, &topic, &encode_binary(CommandKey::Ping, &[]));
    assert_eq!(replies(&engine, &shared), vec![b"\x01\x00pong".to_vec()]);
    assert_eq!(engine.commands_dispatched(), 1);
}

#[test]
fn binary_get_version_is_little_endian() {
    let (mut engine, shared) = engine();
    let topic = engine.topics().command.clone();
    send(&mut engine, &topic, &encode_binary(CommandKey::GetVersion, &[]));
    let v = FIRMWARE_VERSION.to_le_bytes();
    assert_eq!(replies(&engine, &shared), vec![vec![0x02, 0x00, v[0], v[1]]]);
}

#[test]
fn binary_setters_drive_the_device() {
    let (mut engine, shared) = engine();
    let topic = engine.topics().command.clone();
    send(&mut engine, &topic, &encode_binary(CommandKey::SetReportInterval, &120u32.to_le_bytes()));
    send(&mut engine, &topic, &encode_binary(CommandKey::SetBrightness, &[40]));
    send(&mut engine, &topic, &encode_binary(CommandKey::Identify, &10u16.to_le_bytes()));
    assert_eq!(
        engine.device().calls,
        vec![
            DeviceCall::ReportInterval(120),
            DeviceCall::Brightness(40),
            DeviceCall::Identify(10),
        ]
    );
    assert!(replies(&engine, &shared).is_empty(), "setters do not reply");
}

#[test]
fn out_of_range_argument_is_rejected() {
    let (mut engine, _shared) = engine();
    let topic = engine.topics().command.clone();
    send(&mut engine, &topic, &encode_binary(CommandKey::SetBrightness, &[101]));
    assert!(engine.device().calls.is_empty());
    assert_eq!(engine.commands_rejected(), 1);
    assert_eq!(engine.commands_dispatched(), 0);
}

#[test]
fn unknown_key_and_short_payload_are_no_ops() {
    let (mut engine, shared) = engine();
    let topic = engine.topics().command.clone();
    send(&mut engine, &topic, &[0x77, 0x77]);
    send(&mut engine, &topic, &[0x01]);
    assert!(replies(&engine, &shared).is_empty());
    assert_eq!(engine.commands_dispatched(), 0);
    assert_eq!(engine.commands_rejected(), 0);
}

#[test]
fn restart_command_restarts_device() {
    let (mut engine, _shared) = engine();
    let topic = engine.topics().command.clone();
    send(&mut engine, &topic, &encode_binary(CommandKey::Restart, &[]));
    assert!(engine.device().restarted());
}

#[test]
fn get_status_reply_carries_key_prefix() {
    let (mut engine, shared) = engine();
    let topic = engine.topics().command.clone();
    send(&mut engine, &topic, &encode_binary(CommandKey::GetStatus, &[]));
    let r = replies(&engine, &shared);
    assert_eq!(r.len(), 1);
    assert_eq!(&r[0][..2], &[0x04, 0x00]);
    assert!(r[0].len() > 2);
}

// ── JSON envelope ─────────────────────────────────────────────

#[test]
fn json_command_with_json_reply() {
    let (mut engine, shared) = engine();
    let topic = engine.topics().json_command.clone();
    send(&mut engine, &topic, br#"{"cmd":"GetVersion","retfmt":"json"}"#);
    let r = replies(&engine, &shared);
    let v: serde_json::Value = serde_json::from_slice(&r[0]).unwrap();
    assert_eq!(v["cmd"], "GetVersion");
    assert_eq!(v["ret"], FIRMWARE_VERSION);
}

#[test]
fn json_command_defaults_to_binary_reply() {
    let (mut engine, shared) = engine();
    let topic = engine.topics().json_command.clone();
    send(&mut engine, &topic, br#"{"cmd":"Ping"}"#);
    assert_eq!(replies(&engine, &shared), vec![b"\x01\x00pong".to_vec()]);
}

#[test]
fn json_get_info_reports_identity() {
    let (mut engine, shared) = engine();
    let topic = engine.topics().json_command.clone();
    send(&mut engine, &topic, br#"{"cmd":"GetInfo","retfmt":"json"}"#);
    let v: serde_json::Value = serde_json::from_slice(&replies(&engine, &shared)[0]).unwrap();
    assert_eq!(v["ret"]["uid"], UID);
    assert_eq!(v["ret"]["uptime_secs"], 3600);
}

#[test]
fn json_missing_field_gets_error_reply() {
    let (mut engine, shared) = engine();
    let topic = engine.topics().json_command.clone();
    send(&mut engine, &topic, br#"{"cmd":"SetBrightness"}"#);
    let v: serde_json::Value = serde_json::from_slice(&replies(&engine, &shared)[0]).unwrap();
    assert_eq!(v["cmd"], "SetBrightness");
    assert_eq!(v["ret"]["error"], "missing field 'level'");
    assert_eq!(engine.commands_rejected(), 1);
    assert!(engine.device().calls.is_empty());
}

#[test]
fn json_unknown_command_is_silent_no_op() {
    let (mut engine, shared) = engine();
    let topic = engine.topics().json_command.clone();
    send(&mut engine, &topic, br#"{"cmd":"Bogus","retfmt":"json"}"#);
    assert!(replies(&engine, &shared).is_empty());
    assert_eq!(engine.commands_rejected(), 0);
    assert_eq!(engine.commands_dispatched(), 0);
    assert!(engine.device().calls.is_empty());
}

#[test]
fn json_garbage_is_rejected() {
    let (mut engine, _shared) = engine();
    let topic = engine.topics().json_command.clone();
    send(&mut engine, &topic, b"{not json");
    assert_eq!(engine.commands_rejected(), 1);
}

// ── Intake ────────────────────────────────────────────────────

#[test]
fn command_flood_is_rate_limited() {
    let cfg = LinkConfig {
        command_rate_per_sec: 1,
        command_burst: 3,
        ..LinkConfig::default()
    };
    let (mut engine, _shared) = started_engine(&cfg);
    let topic = engine.topics().command.clone();
    for _ in 0..6 {
        send(&mut engine, &topic, &encode_binary(CommandKey::Ping, &[]));
    }
    assert!(engine.commands_rejected() >= 2);
    assert!(engine.commands_dispatched() <= 4);
}

#[test]
fn messages_on_foreign_topics_are_ignored() {
    let (mut engine, shared) = engine();
    send(&mut engine, "api/cmd/someone-else", &encode_binary(CommandKey::Restart, &[]));
    assert!(engine.device().calls.is_empty());
    assert!(replies(&engine, &shared).is_empty());
}

#[test]
fn update_command_starts_session() {
    let (mut engine, shared) = engine();
    let topic = engine.topics().command.clone();
    send(&mut engine, &topic, &encode_binary(CommandKey::Update, &[]));
    assert_eq!(engine.session().state(), SessionState::AwaitingVersionInfo);
    let flags = published_on(&shared, &engine.topics().update_tx);
    assert_eq!(flags, vec![WriteFlag::VERSION.encode().to_vec()]);
}

#[test]
fn status_report_reflects_counters() {
    let (mut engine, _shared) = engine();
    let topic = engine.topics().command.clone();
    send(&mut engine, &topic, &encode_binary(CommandKey::Ping, &[]));
    send(&mut engine, &topic, &encode_binary(CommandKey::SetBrightness, &[200]));
    let status = engine.status_report();
    assert!(status.connected);
    assert_eq!(status.commands, 1);
    assert_eq!(status.rejected, 1);
    assert_eq!(status.update_state, SessionState::Idle);
}
