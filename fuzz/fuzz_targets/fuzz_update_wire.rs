//! Fuzz target: update session fed arbitrary peer payloads.
//!
//! The first byte picks how far the session is driven before the rest of
//! the input is delivered as update data. Whatever arrives, the session
//! must not panic, and an idle session never leaves the store open.
//!
//! cargo fuzz run fuzz_update_wire

#![no_main]

use libfuzzer_sys::fuzz_target;
use sensorlink::adapters::update_store::MemoryUpdateStore;
use sensorlink::app::ports::Responder;
use sensorlink::config::LinkConfig;
use sensorlink::error::LinkError;
use sensorlink::link::topics::TopicNames;
use sensorlink::link::transport::QoS;
use sensorlink::ota::session::UpdateSession;
use sensorlink::ota::wire::{Chunk, VersionAnnounce};
use sensorlink::sync::barrier::PauseBarrier;

struct Sink;

impl Responder for Sink {
    fn reply(&self, _: &[u8]) -> Result<(), LinkError> {
        Ok(())
    }
    fn publish(&self, _: &str, _: &[u8], _: QoS) -> Result<(), LinkError> {
        Ok(())
    }
    fn subscribe(&self, _: &str, _: QoS) -> Result<(), LinkError> {
        Ok(())
    }
    fn unsubscribe(&self, _: &str) -> Result<(), LinkError> {
        Ok(())
    }
}

fuzz_target!(|data: &[u8]| {
    let Some((&stage, rest)) = data.split_first() else {
        return;
    };
    let cfg = LinkConfig::default();
    let topics = TopicNames::new("fuzz", cfg.board_version).unwrap();
    let barrier = PauseBarrier::new();
    let mut session = UpdateSession::new(MemoryUpdateStore::new(), &cfg, &topics);

    session.start(&Sink, &barrier);
    if stage & 1 == 1 {
        let announce = VersionAnnounce {
            version: cfg.firmware_version + 1,
            size: 64,
        };
        session.on_data(&announce.encode(), &Sink, &barrier);
    }
    if stage & 2 == 2 {
        let chunk = Chunk {
            offset: 0,
            data: &[0xA5; 64],
        };
        session.on_data(&chunk.encode(), &Sink, &barrier);
    }

    for piece in rest.chunks(37) {
        session.on_data(piece, &Sink, &barrier);
        assert!(session.bytes_written() <= session.expected_size());
        if !session.is_active() {
            assert!(!session.store().is_open());
        }
    }
});
