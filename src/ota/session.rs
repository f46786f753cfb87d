//! UpdateSession: the device side of the firmware download handshake.
//!
//! ```text
//!   Idle ──start──▶ AwaitingVersionInfo ──announce──▶ AwaitingData
//!                                                       │  ▲ chunk
//!                                                       ▼──┘
//!   Idle ◀──digest ok: RestartRequired── AwaitingVerification
//! ```
//!
//! Every failure returns the session to `Idle`, closes any open store
//! handle and publishes a status code. Peripherals paused at `start` are
//! resumed on every failure except an already-current version offer and a
//! digest mismatch.
//!
//! Data travels pull-style: after each accepted payload the session
//! publishes a [`WriteFlag`] naming what it wants next.

use core::fmt::Write;
use core::time::Duration;

use log::{error, info, warn};
use serde::Serialize;

use crate::app::ports::{Responder, UpdateStore};
use crate::config::LinkConfig;
use crate::error::UpdateError;
use crate::link::topics::TopicNames;
use crate::link::transport::{QoS, TopicString};
use crate::ota::status::{self, StatusCode};
use crate::ota::wire::{Chunk, DIGEST_LEN, Digest, VersionAnnounce, WriteFlag};
use crate::sync::barrier::{PauseBarrier, PauseOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    AwaitingVersionInfo,
    AwaitingData,
    AwaitingVerification,
}

/// What the caller should do after feeding the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Waiting for the next payload from the peer.
    Continue,
    /// The new image is staged and marked for boot; restart the device.
    RestartRequired,
    /// The session ended without applying an image.
    Aborted(UpdateError),
    /// `start` was refused; the active session is untouched.
    Rejected(UpdateError),
    /// Data arrived while no session was active.
    Ignored,
}

pub struct UpdateSession<S: UpdateStore> {
    store: S,
    state: SessionState,
    current_version: u16,
    block_size: u32,
    max_image_size: u32,
    pause_timeout: Duration,
    progress_step: u8,
    tx_topic: TopicString,
    status_topic: TopicString,

    // Per-session
    offered_version: u16,
    expected_size: u32,
    bytes_written: u32,
    last_progress: u8,
    hasher: Option<hmac_sha256::Hash>,
    digest: Option<Digest>,
}

impl<S: UpdateStore> UpdateSession<S> {
    pub fn new(store: S, cfg: &LinkConfig, topics: &TopicNames) -> Self {
        Self {
            store,
            state: SessionState::Idle,
            current_version: cfg.firmware_version,
            block_size: cfg.update_block_size,
            max_image_size: cfg.max_firmware_size,
            pause_timeout: Duration::from_millis(cfg.pause_timeout_ms as u64),
            progress_step: cfg.progress_step_percent.max(1),
            tx_topic: topics.update_tx.clone(),
            status_topic: topics.update_status.clone(),
            offered_version: 0,
            expected_size: 0,
            bytes_written: 0,
            last_progress: 0,
            hasher: None,
            digest: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != SessionState::Idle
    }

    pub fn bytes_written(&self) -> u32 {
        self.bytes_written
    }

    pub fn expected_size(&self) -> u32 {
        self.expected_size
    }

    /// Digest of the received image, available once every byte is in.
    pub fn computed_digest(&self) -> Option<Digest> {
        self.digest
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Begin an update: check the running image, pause peripherals and ask
    /// the peer for its version announce.
    pub fn start(&mut self, out: &impl Responder, barrier: &PauseBarrier) -> Step {
        if self.is_active() {
            warn!("OTA: start refused, session in {:?}", self.state);
            self.report(out, StatusCode::UpdateBusy, "update already in progress", 0);
            return Step::Rejected(UpdateError::Busy);
        }

        if !self.store.running_is_boot() {
            return self.fail(UpdateError::RunningNotBoot, out, barrier);
        }

        if let PauseOutcome::TimedOut {
            acknowledged,
            expected,
        } = barrier.request_pause(self.pause_timeout)
        {
            warn!(
                "OTA: only {}/{} peripheral task(s) paused",
                acknowledged, expected
            );
            return self.fail(UpdateError::PeripheralsBusy, out, barrier);
        }

        self.state = SessionState::AwaitingVersionInfo;
        info!("OTA: session started, requesting version");
        self.request(WriteFlag::VERSION, out, barrier)
    }

    /// Feed one payload received on the update data topic.
    pub fn on_data(&mut self, payload: &[u8], out: &impl Responder, barrier: &PauseBarrier) -> Step {
        match self.state {
            SessionState::Idle => {
                warn!("OTA: {} bytes of update data with no session", payload.len());
                Step::Ignored
            }
            SessionState::AwaitingVersionInfo => self.on_announce(payload, out, barrier),
            SessionState::AwaitingData => self.on_chunk(payload, out, barrier),
            SessionState::AwaitingVerification => self.on_digest(payload, out, barrier),
        }
    }

    /// Drop any session in progress without reporting.
    pub fn reset(&mut self) {
        if self.is_active() {
            warn!("OTA: session reset in {:?}", self.state);
        }
        self.store.abort();
        self.clear();
    }

    fn on_announce(&mut self, payload: &[u8], out: &impl Responder, barrier: &PauseBarrier) -> Step {
        let Ok(announce) = VersionAnnounce::parse(payload) else {
            return self.fail(UpdateError::Malformed, out, barrier);
        };
        info!(
            "OTA: offered v{} ({} bytes), running v{}",
            announce.version, announce.size, self.current_version
        );

        if announce.version <= self.current_version {
            return self.fail(UpdateError::AlreadyLatest, out, barrier);
        }
        if announce.size == 0 || announce.size > self.max_image_size {
            return self.fail(UpdateError::TooLarge, out, barrier);
        }
        if let Err(e) = self.store.begin(announce.size) {
            return self.fail(e.into(), out, barrier);
        }

        self.offered_version = announce.version;
        self.expected_size = announce.size;
        self.bytes_written = 0;
        self.last_progress = 0;
        self.hasher = Some(hmac_sha256::Hash::new());
        self.state = SessionState::AwaitingData;
        let first = self.block_size.min(announce.size);
        self.request(WriteFlag::data(0, first), out, barrier)
    }

    fn on_chunk(&mut self, payload: &[u8], out: &impl Responder, barrier: &PauseBarrier) -> Step {
        let Ok(chunk) = Chunk::parse(payload) else {
            return self.fail(UpdateError::Malformed, out, barrier);
        };
        if chunk.offset != self.bytes_written {
            warn!(
                "OTA: chunk at {} but {} bytes written",
                chunk.offset, self.bytes_written
            );
            return self.fail(UpdateError::OutOfOrder, out, barrier);
        }
        let len = chunk.data.len() as u32;
        if len > self.expected_size - self.bytes_written {
            return self.fail(UpdateError::Overflow, out, barrier);
        }

        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(chunk.data);
        }
        if let Err(e) = self.store.write(chunk.data) {
            return self.fail(e.into(), out, barrier);
        }
        self.bytes_written += len;
        self.report_progress(out);

        if self.bytes_written < self.expected_size {
            let remaining = self.expected_size - self.bytes_written;
            let next = WriteFlag::data(self.bytes_written, self.block_size.min(remaining));
            return self.request(next, out, barrier);
        }

        self.digest = self.hasher.take().map(hmac_sha256::Hash::finalize);
        self.state = SessionState::AwaitingVerification;
        info!("OTA: all {} bytes received, requesting digest", self.expected_size);
        self.request(WriteFlag::VERIFY, out, barrier)
    }

    fn on_digest(&mut self, payload: &[u8], out: &impl Responder, barrier: &PauseBarrier) -> Step {
        let matches = payload.len() == DIGEST_LEN && self.digest.is_some_and(|d| d[..] == payload[..]);
        if !matches {
            error!("OTA: digest mismatch, image discarded");
            return self.fail(UpdateError::DigestMismatch, out, barrier);
        }

        if let Err(e) = self.store.finish() {
            return self.fail(e.into(), out, barrier);
        }
        if let Err(e) = self.store.set_boot_target() {
            return self.fail(e.into(), out, barrier);
        }

        let version = self.offered_version;
        self.report(out, StatusCode::DigestOk, "digest ok", 0);
        self.report(out, StatusCode::UpdateOk, "update applied, restarting", version as u32);
        info!("OTA: v{} staged for boot", version);
        self.clear();
        Step::RestartRequired
    }

    /// End the session with `err`: close the store, report, and resume
    /// peripherals unless the error is one that leaves them paused.
    fn fail(&mut self, err: UpdateError, out: &impl Responder, barrier: &PauseBarrier) -> Step {
        self.store.abort();
        let val = match err {
            UpdateError::AlreadyLatest => self.current_version as u32,
            _ => self.bytes_written,
        };
        self.clear();

        let mut msg = heapless::String::<64>::new();
        let _ = write!(msg, "{}", err);
        if err == UpdateError::AlreadyLatest {
            info!("OTA: {}", msg);
        } else {
            error!("OTA: aborted: {}", msg);
        }
        self.report(out, err.status(), &msg, val);

        if !matches!(err, UpdateError::AlreadyLatest | UpdateError::DigestMismatch) {
            barrier.resume();
        }
        Step::Aborted(err)
    }

    fn clear(&mut self) {
        self.state = SessionState::Idle;
        self.offered_version = 0;
        self.expected_size = 0;
        self.bytes_written = 0;
        self.last_progress = 0;
        self.hasher = None;
        self.digest = None;
    }

    /// Publish the next write flag. If it cannot go out the peer will
    /// never answer, so the session is abandoned.
    fn request(&mut self, flag: WriteFlag, out: &impl Responder, barrier: &PauseBarrier) -> Step {
        match out.publish(&self.tx_topic, &flag.encode(), QoS::AtLeastOnce) {
            Ok(()) => Step::Continue,
            Err(e) => {
                error!("OTA: write flag not sent: {}", e);
                self.fail(UpdateError::Link(e), out, barrier)
            }
        }
    }

    fn report_progress(&mut self, out: &impl Responder) {
        let percent = (self.bytes_written as u64 * 100 / self.expected_size as u64) as u8;
        if percent / self.progress_step > self.last_progress / self.progress_step {
            self.last_progress = percent;
            self.report(out, StatusCode::DownloadProgress, "downloading", percent as u32);
        }
    }

    fn report(&self, out: &impl Responder, code: StatusCode, msg: &str, val: u32) {
        let payload = status::encode(code, msg, val);
        if let Err(e) = out.publish(&self.status_topic, &payload, QoS::AtLeastOnce) {
            warn!("OTA: status {} not published: {}", code.as_u8(), e);
        }
    }
}
