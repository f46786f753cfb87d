//! Engine: the single entry point for inbound traffic.
//!
//! Owns the command router, the update session and the device port, and
//! shares the [`ReliableChannel`] with the retry and keep-alive tasks.
//! Every transport event read by the I/O task passes through
//! [`Engine::handle_event`]:
//!
//! ```text
//!   api/cmd/U ─────┐
//!   api/strcmd/U ──┼─▶ limiter ─▶ decode ─▶ CommandRouter ─▶ reply / action
//!                  │                                  └────▶ UpdateSession
//!   api/update ────┼─▶ UpdateSession::start
//!   api/update/U/drx/B ─▶ UpdateSession::on_data
//! ```

use core::fmt::Write;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::app::ports::{Clock, DevicePort, PubSubTransport, Responder, UpdateStore};
use crate::config::LinkConfig;
use crate::error::{DecodeError, Error};
use crate::link::channel::{ChannelResponder, ReliableChannel};
use crate::link::topics::{InboundTopic, TopicNames};
use crate::link::transport::{QoS, TransportEvent};
use crate::ota::session::{Step, UpdateSession};
use crate::rpc::codec::{self, Command};
use crate::rpc::limiter::CommandLimiter;
use crate::rpc::router::{self, CommandRouter, Dispatch, ReplyValue, StatusReport};
use crate::sync::barrier::PauseBarrier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Envelope {
    Binary,
    Json,
}

pub struct Engine<T: PubSubTransport, C: Clock, S: UpdateStore, D: DevicePort> {
    channel: Arc<ReliableChannel<T, C>>,
    topics: TopicNames,
    router: CommandRouter,
    session: UpdateSession<S>,
    device: D,
    barrier: Arc<PauseBarrier>,
    limiter: CommandLimiter,
    commands: u32,
    rejected: u32,
}

impl<T, C, S, D> Engine<T, C, S, D>
where
    T: PubSubTransport,
    C: Clock,
    S: UpdateStore,
    D: DevicePort,
{
    pub fn new(
        cfg: &LinkConfig,
        uid: &str,
        channel: Arc<ReliableChannel<T, C>>,
        store: S,
        device: D,
        barrier: Arc<PauseBarrier>,
    ) -> Result<Self, Error> {
        cfg.validate()?;
        let topics = TopicNames::new(uid, cfg.board_version)?;
        Ok(Self {
            router: CommandRouter::new(uid, cfg.board_version, cfg.firmware_version),
            session: UpdateSession::new(store, cfg, &topics),
            limiter: CommandLimiter::new(cfg.command_rate_per_sec, cfg.command_burst),
            topics,
            channel,
            device,
            barrier,
            commands: 0,
            rejected: 0,
        })
    }

    /// Confirm the running image and queue the inbound subscriptions.
    /// They go out as soon as the link is up.
    pub fn start(&mut self) -> Result<(), Error> {
        match self.session.store_mut().mark_running_valid() {
            Ok(()) => info!("OTA: running image marked valid"),
            Err(e) => warn!("OTA: could not mark running image valid: {}", e),
        }
        for topic in self.topics.inbound() {
            self.channel.subscribe(topic, QoS::AtLeastOnce)?;
        }
        info!("CMD: listening on {}", self.topics.command);
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────

    pub fn channel(&self) -> &Arc<ReliableChannel<T, C>> {
        &self.channel
    }

    pub fn topics(&self) -> &TopicNames {
        &self.topics
    }

    pub fn session(&self) -> &UpdateSession<S> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut UpdateSession<S> {
        &mut self.session
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn commands_dispatched(&self) -> u32 {
        self.commands
    }

    pub fn commands_rejected(&self) -> u32 {
        self.rejected
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            connected: self.channel.is_connected(),
            unacked: self.channel.pool().len() as u8,
            update_state: self.session.state(),
            commands: self.commands,
            rejected: self.rejected,
            resends: self.channel.resends(),
            reconnects: self.channel.reconnects(),
        }
    }

    // ── Inbound ─────────────────────────────────────────────

    /// Read and handle one transport event. Returns `false` when the
    /// transport had nothing to deliver.
    pub fn poll(&mut self) -> bool {
        match self.channel.poll() {
            Some(event) => {
                self.handle_event(event);
                true
            }
            None => false,
        }
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        if let Some(msg) = self.channel.handle_event(event) {
            self.handle_message(&msg.topic, &msg.payload);
        }
    }

    pub fn handle_message(&mut self, topic: &str, payload: &[u8]) {
        match self.topics.classify(topic) {
            InboundTopic::BinaryCommand => self.on_command(payload, Envelope::Binary),
            InboundTopic::JsonCommand => self.on_command(payload, Envelope::Json),
            InboundTopic::UpdateAnnounce => {
                info!("OTA: update announced");
                self.start_update();
            }
            InboundTopic::UpdateData => {
                let out = ChannelResponder::new(&self.channel, &self.topics.reply);
                let step = self.session.on_data(payload, &out, &self.barrier);
                self.after_step(step);
            }
            InboundTopic::Other => debug!("CMD: ignoring message on {}", topic),
        }
    }

    fn on_command(&mut self, payload: &[u8], envelope: Envelope) {
        if !self.limiter.admit() {
            self.rejected += 1;
            warn!("CMD: rate limit exceeded, command dropped");
            return;
        }

        let decoded = match envelope {
            Envelope::Binary => codec::decode_binary(payload),
            Envelope::Json => codec::decode_json(payload),
        };
        let cmd = match decoded {
            Ok(cmd) => cmd,
            Err(e) => {
                self.rejected += 1;
                warn!("CMD: rejected {:?} command: {}", envelope, e);
                if envelope == Envelope::Json {
                    self.reply_decode_error(payload, e);
                }
                return;
            }
        };
        if cmd.is_nop() {
            debug!("CMD: no-op");
            return;
        }

        self.commands += 1;
        self.dispatch(&cmd);
    }

    fn dispatch(&mut self, cmd: &Command) {
        debug!("CMD: {} ({} arg bytes)", cmd.key, cmd.args.len());
        let status = self.status_report();
        match self.router.dispatch(cmd, &mut self.device, || status) {
            Dispatch::Reply(bytes) => {
                let out = ChannelResponder::new(&self.channel, &self.topics.reply);
                if let Err(e) = out.reply(&bytes) {
                    warn!("CMD: reply to {} not sent: {}", cmd.key, e);
                }
            }
            Dispatch::StartUpdate => self.start_update(),
            Dispatch::Done | Dispatch::Ignored => {}
        }
    }

    fn reply_decode_error(&self, payload: &[u8], err: DecodeError) {
        let name = codec::json_command_name(payload);
        let mut text = heapless::String::<48>::new();
        let _ = write!(text, "{}", err);
        let bytes = router::encode_json_reply(&name, &ReplyValue::Error { error: &text });
        let out = ChannelResponder::new(&self.channel, &self.topics.reply);
        if let Err(e) = out.reply(&bytes) {
            debug!("CMD: error reply not sent: {}", e);
        }
    }

    fn start_update(&mut self) {
        let out = ChannelResponder::new(&self.channel, &self.topics.reply);
        let step = self.session.start(&out, &self.barrier);
        self.after_step(step);
    }

    fn after_step(&mut self, step: Step) {
        match step {
            Step::RestartRequired => {
                info!("OTA: restarting into new image");
                self.device.restart();
            }
            Step::Aborted(e) => debug!("OTA: session ended: {}", e),
            Step::Rejected(e) => debug!("OTA: start rejected: {}", e),
            Step::Continue | Step::Ignored => {}
        }
    }
}
