//! Firmware update handshake end to end through the engine: announce,
//! pull-style chunk requests, digest verification and every abort path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sensorlink::adapters::time::ManualClock;
use sensorlink::adapters::update_store::MemoryUpdateStore;
use sensorlink::config::{FIRMWARE_VERSION, LinkConfig};
use sensorlink::engine::Engine;
use sensorlink::link::transport::TransportEvent;
use sensorlink::ota::session::SessionState;
use sensorlink::ota::status::StatusCode;
use sensorlink::ota::wire::{Chunk, VersionAnnounce, WriteFlag, image_digest};
use sensorlink::sync::barrier::PauseBarrier;

use crate::mock_link::{MockDevice, MockTransport, Shared, UID, Wire, channel_with, take_log};

type TestEngine = Engine<MockTransport, ManualClock, MemoryUpdateStore, MockDevice>;

/// Plays the update peer and the broker: every tracked publish is acked
/// as soon as the device writes it.
struct Peer {
    engine: TestEngine,
    shared: Shared,
    sent: Vec<(String, Vec<u8>)>,
}

impl Peer {
    fn new(cfg: &LinkConfig, barrier: Arc<PauseBarrier>) -> Self {
        let (channel, shared, _clock) = channel_with(cfg);
        let mut engine = Engine::new(
            cfg,
            UID,
            channel,
            MemoryUpdateStore::new(),
            MockDevice::default(),
            barrier,
        )
        .unwrap();
        engine.start().unwrap();
        assert!(engine.channel().connect());
        engine.handle_event(TransportEvent::Connected);
        take_log(&shared);
        Self {
            engine,
            shared,
            sent: Vec::new(),
        }
    }

    fn with_defaults() -> Self {
        Self::new(&LinkConfig::default(), Arc::new(PauseBarrier::new()))
    }

    fn pump(&mut self) {
        for wire in take_log(&self.shared) {
            if let Wire::Publish { topic, payload, id, .. } = wire {
                if let Some(id) = id {
                    self.engine.handle_event(TransportEvent::PubAck(id));
                }
                self.sent.push((topic, payload));
            }
        }
    }

    fn deliver(&mut self, topic: &str, payload: &[u8]) {
        self.engine
            .handle_event(TransportEvent::message(topic, payload).unwrap());
        self.pump();
    }

    fn announce_update(&mut self) {
        let topic = self.engine.topics().update_announce.clone();
        self.deliver(&topic, b"");
    }

    fn send_data(&mut self, payload: &[u8]) {
        let topic = self.engine.topics().update_rx.clone();
        self.deliver(&topic, payload);
    }

    fn flags(&self) -> Vec<WriteFlag> {
        let topic = self.engine.topics().update_tx.as_str();
        self.sent
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| WriteFlag::parse(p).unwrap())
            .collect()
    }

    fn last_flag(&self) -> WriteFlag {
        *self.flags().last().expect("no write flag published")
    }

    /// `(code, val)` of every status message, in order.
    fn statuses(&self) -> Vec<(u8, u32)> {
        let topic = self.engine.topics().update_status.as_str();
        self.sent
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| {
                let v: serde_json::Value = serde_json::from_slice(p).unwrap();
                (
                    v["code"].as_str().unwrap().parse().unwrap(),
                    v["val"].as_str().unwrap().parse().unwrap(),
                )
            })
            .collect()
    }

    fn last_status(&self) -> (u8, u32) {
        *self.statuses().last().expect("no status published")
    }

    /// Answer write flags until the session stops asking.
    fn serve(&mut self, image: &[u8], version: u16) {
        for _ in 0..1_000 {
            if !self.engine.session().is_active() {
                return;
            }
            let flag = self.last_flag();
            if flag.requires_version() {
                let announce = VersionAnnounce {
                    version,
                    size: image.len() as u32,
                };
                self.send_data(&announce.encode());
            } else if flag.requires_verify() {
                self.send_data(&image_digest(image));
            } else {
                let from = flag.next_offset as usize;
                let to = from + flag.chunk_size as usize;
                let chunk = Chunk {
                    offset: flag.next_offset,
                    data: &image[from..to],
                };
                self.send_data(&chunk.encode());
            }
        }
        panic!("update never finished");
    }
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

const OK: u8 = StatusCode::UpdateOk as u8;

// ── Happy path ────────────────────────────────────────────────

#[test]
fn full_update_stages_image_and_restarts() {
    let mut peer = Peer::with_defaults();
    let img = image(5_000);
    peer.announce_update();
    assert_eq!(peer.last_flag(), WriteFlag::VERSION);

    peer.serve(&img, FIRMWARE_VERSION + 1);

    let flags = peer.flags();
    assert_eq!(flags[1], WriteFlag::data(0, 1_024));
    assert_eq!(flags[5], WriteFlag::data(4_096, 904), "last block is short");
    assert_eq!(*flags.last().unwrap(), WriteFlag::VERIFY);

    let statuses = peer.statuses();
    let tail = &statuses[statuses.len() - 2..];
    assert_eq!(
        tail,
        &[
            (StatusCode::DigestOk as u8, 0),
            (OK, (FIRMWARE_VERSION + 1) as u32)
        ]
    );
    let progress: Vec<u32> = statuses
        .iter()
        .filter(|(c, _)| *c == StatusCode::DownloadProgress as u8)
        .map(|(_, v)| *v)
        .collect();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(*progress.last().unwrap(), 100);

    assert_eq!(peer.engine.session().store().boot_image(), Some(&img[..]));
    assert!(peer.engine.device().restarted());
    assert_eq!(peer.engine.session().state(), SessionState::Idle);
}

#[test]
fn update_started_by_command_uses_same_flow() {
    let mut peer = Peer::with_defaults();
    let topic = peer.engine.topics().json_command.clone();
    peer.deliver(&topic, br#"{"cmd":"Update"}"#);
    let img = image(100);
    peer.serve(&img, FIRMWARE_VERSION + 3);
    assert_eq!(peer.engine.session().store().boot_image(), Some(&img[..]));
}

// ── Refusals ──────────────────────────────────────────────────

#[test]
fn same_version_reports_already_latest() {
    let barrier = Arc::new(PauseBarrier::new());
    let mut peer = Peer::new(&LinkConfig::default(), Arc::clone(&barrier));
    peer.announce_update();
    peer.send_data(
        &VersionAnnounce {
            version: FIRMWARE_VERSION,
            size: 100,
        }
        .encode(),
    );
    assert_eq!(peer.last_status(), (OK, FIRMWARE_VERSION as u32));
    assert_eq!(peer.engine.session().state(), SessionState::Idle);
    assert!(!peer.engine.session().store().is_open());
    assert!(!peer.engine.device().restarted());
    assert!(barrier.is_pause_requested(), "peripherals stay paused");
}

#[test]
fn oversized_image_is_refused_and_peripherals_resume() {
    let cfg = LinkConfig::default();
    let barrier = Arc::new(PauseBarrier::new());
    let mut peer = Peer::new(&cfg, Arc::clone(&barrier));
    peer.announce_update();
    assert!(barrier.is_pause_requested());
    peer.send_data(
        &VersionAnnounce {
            version: FIRMWARE_VERSION + 1,
            size: cfg.max_firmware_size + 1,
        }
        .encode(),
    );
    assert_eq!(peer.last_status().0, StatusCode::RxDataTooLarge as u8);
    assert!(!barrier.is_pause_requested());
}

#[test]
fn second_start_is_busy() {
    let mut peer = Peer::with_defaults();
    peer.announce_update();
    peer.announce_update();
    assert_eq!(peer.last_status().0, StatusCode::UpdateBusy as u8);
    assert_eq!(
        peer.engine.session().state(),
        SessionState::AwaitingVersionInfo,
        "the active session is untouched"
    );
}

#[test]
fn data_without_session_is_ignored() {
    let mut peer = Peer::with_defaults();
    peer.send_data(&[1, 2, 3, 4]);
    assert!(peer.sent.is_empty());
}

// ── Aborts ────────────────────────────────────────────────────

fn peer_awaiting_data(size: u32) -> Peer {
    let mut peer = Peer::with_defaults();
    peer.announce_update();
    peer.send_data(
        &VersionAnnounce {
            version: FIRMWARE_VERSION + 1,
            size,
        }
        .encode(),
    );
    assert_eq!(peer.engine.session().state(), SessionState::AwaitingData);
    peer
}

#[test]
fn out_of_order_chunk_aborts() {
    let mut peer = peer_awaiting_data(2_048);
    peer.send_data(
        &Chunk {
            offset: 1_024,
            data: &[0; 1_024],
        }
        .encode(),
    );
    assert_eq!(peer.last_status().0, StatusCode::RxDataMismatched as u8);
    assert_eq!(peer.engine.session().state(), SessionState::Idle);
    assert!(!peer.engine.session().store().is_open());
}

#[test]
fn chunk_past_announced_size_aborts() {
    let mut peer = peer_awaiting_data(10);
    peer.send_data(
        &Chunk {
            offset: 0,
            data: &[0; 11],
        }
        .encode(),
    );
    assert_eq!(peer.last_status().0, StatusCode::RxDataTooLarge as u8);
    assert!(!peer.engine.session().store().is_open());
}

#[test]
fn digest_mismatch_discards_image() {
    let mut peer = peer_awaiting_data(16);
    peer.send_data(
        &Chunk {
            offset: 0,
            data: &[9; 16],
        }
        .encode(),
    );
    assert_eq!(peer.last_flag(), WriteFlag::VERIFY);
    peer.send_data(&[0u8; 32]);
    assert_eq!(peer.last_status().0, StatusCode::DigestFailed as u8);
    assert_eq!(peer.engine.session().store().boot_image(), None);
    assert!(!peer.engine.device().restarted());
}

#[test]
fn unacknowledged_flags_fill_the_pool_and_abort() {
    let (channel, _shared, _clock) = channel_with(&LinkConfig::default());
    let mut engine: TestEngine = Engine::new(
        &LinkConfig::default(),
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

    // Nobody acks: each start/refusal leaves tracked publishes behind.
    let announce = engine.topics().update_announce.clone();
    for _ in 0..12 {
        engine.handle_event(TransportEvent::message(&announce, b"").unwrap());
        if engine.session().is_active() {
            engine.session_mut().reset();
        }
    }
    assert!(engine.channel().pool().is_full());
    assert_eq!(engine.session().state(), SessionState::Idle);
}

// ── Peripheral pause ──────────────────────────────────────────

#[test]
fn peripherals_that_never_pause_block_the_update() {
    let cfg = LinkConfig {
        pause_timeout_ms: 20,
        ..LinkConfig::default()
    };
    let barrier = Arc::new(PauseBarrier::new());
    let _stuck = barrier.join().unwrap();
    let mut peer = Peer::new(&cfg, Arc::clone(&barrier));

    peer.announce_update();
    assert_eq!(peer.last_status().0, StatusCode::PeripheralsBusy as u8);
    assert_eq!(peer.engine.session().state(), SessionState::Idle);
    assert!(!barrier.is_pause_requested(), "pause request withdrawn");
}

#[test]
fn cooperating_peripheral_is_parked_and_released() {
    let barrier = Arc::new(PauseBarrier::new());
    let id = barrier.join().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let worker = {
        let barrier = Arc::clone(&barrier);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut parked = 0;
            while !stop.load(Ordering::SeqCst) {
                if barrier.checkpoint(id) {
                    parked += 1;
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            parked
        })
    };

    let mut peer = Peer::new(&LinkConfig::default(), Arc::clone(&barrier));
    peer.announce_update();
    assert_eq!(peer.engine.session().state(), SessionState::AwaitingVersionInfo);

    // A refused image resumes the worker.
    peer.send_data(
        &VersionAnnounce {
            version: FIRMWARE_VERSION + 1,
            size: 0,
        }
        .encode(),
    );
    assert!(!barrier.is_pause_requested());

    stop.store(true, Ordering::SeqCst);
    assert_eq!(worker.join().unwrap(), 1);
}

#[test]
fn update_after_already_latest_reuses_parked_peripheral() {
    let barrier = Arc::new(PauseBarrier::new());
    let id = barrier.join().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let worker = {
        let barrier = Arc::clone(&barrier);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let mut parked = 0;
            while !stop.load(Ordering::SeqCst) {
                if barrier.checkpoint(id) {
                    parked += 1;
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            parked
        })
    };

    let mut peer = Peer::new(&LinkConfig::default(), Arc::clone(&barrier));
    peer.announce_update();
    peer.send_data(
        &VersionAnnounce {
            version: FIRMWARE_VERSION,
            size: 100,
        }
        .encode(),
    );
    assert_eq!(peer.last_status(), (OK, FIRMWARE_VERSION as u32));
    assert!(barrier.is_pause_requested(), "peripheral stays parked");

    // The second offer must not wait on the task that never woke up.
    peer.announce_update();
    assert_eq!(peer.engine.session().state(), SessionState::AwaitingVersionInfo);
    assert_ne!(peer.last_status().0, StatusCode::PeripheralsBusy as u8);

    let img = image(300);
    peer.serve(&img, FIRMWARE_VERSION + 1);
    assert_eq!(peer.engine.session().store().boot_image(), Some(&img[..]));
    assert!(barrier.is_pause_requested(), "held for the restart");

    barrier.resume();
    stop.store(true, Ordering::SeqCst);
    assert_eq!(worker.join().unwrap(), 1);
}
