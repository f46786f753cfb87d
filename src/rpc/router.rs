//! CommandRouter: maps decoded commands to handlers and formats replies.
//!
//! Replies follow the envelope the command asked for:
//!
//! ```text
//! binary  [key:u16 LE][body]          body = LE scalar | UTF-8 | postcard
//! json    {"ret": <value>, "cmd": "<Name>"}
//! ```
//!
//! The router holds only the device identity; per-command state lives with
//! the [`DevicePort`] it drives.

use serde::Serialize;

use crate::app::ports::DevicePort;
use crate::ota::session::SessionState;
use crate::rpc::codec::{Command, CommandKey, ReplyFormat};

pub type Uid = heapless::String<16>;

/// Identity reported by `GetInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub uid: Uid,
    pub board: u16,
    pub version: u16,
    pub uptime_secs: u64,
}

/// Engine snapshot reported by `GetStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub connected: bool,
    pub unacked: u8,
    pub update_state: SessionState,
    pub commands: u32,
    pub rejected: u32,
    pub resends: u32,
    pub reconnects: u32,
}

/// Value carried in a reply.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ReplyValue<'a> {
    Text(&'a str),
    Version(u16),
    Info(DeviceInfo),
    Status(StatusReport),
    Error { error: &'a str },
}

#[derive(Serialize)]
struct JsonReply<'a> {
    ret: &'a ReplyValue<'a>,
    cmd: &'a str,
}

/// Encode a reply in the requested envelope.
pub fn encode_reply(key: CommandKey, format: ReplyFormat, value: &ReplyValue<'_>) -> Vec<u8> {
    match format {
        ReplyFormat::Json => encode_json_reply(key.name(), value),
        ReplyFormat::Binary => {
            let mut out = Vec::with_capacity(32);
            out.extend_from_slice(&key.as_u16().to_le_bytes());
            match value {
                ReplyValue::Text(s) => out.extend_from_slice(s.as_bytes()),
                ReplyValue::Version(v) => out.extend_from_slice(&v.to_le_bytes()),
                ReplyValue::Info(info) => append_postcard(&mut out, info),
                ReplyValue::Status(status) => append_postcard(&mut out, status),
                ReplyValue::Error { error } => out.extend_from_slice(error.as_bytes()),
            }
            out
        }
    }
}

/// JSON reply for a command identified only by name, as used for decode
/// errors.
pub fn encode_json_reply(cmd: &str, value: &ReplyValue<'_>) -> Vec<u8> {
    serde_json::to_vec(&JsonReply { ret: value, cmd }).unwrap_or_default()
}

fn append_postcard<T: Serialize>(out: &mut Vec<u8>, value: &T) {
    if let Ok(bytes) = postcard::to_allocvec(value) {
        out.extend_from_slice(&bytes);
    }
}

/// Outcome of dispatching one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Publish this payload on the reply topic.
    Reply(Vec<u8>),
    /// The action ran; nothing to send.
    Done,
    /// The caller must start a firmware update session.
    StartUpdate,
    /// No-op command.
    Ignored,
}

pub struct CommandRouter {
    uid: Uid,
    board_version: u16,
    firmware_version: u16,
}

impl CommandRouter {
    pub fn new(uid: &str, board_version: u16, firmware_version: u16) -> Self {
        let mut id = Uid::new();
        let _ = id.push_str(uid);
        Self {
            uid: id,
            board_version,
            firmware_version,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Run the handler for `cmd`. `status` is consulted only by `GetStatus`.
    pub fn dispatch<D: DevicePort>(
        &self,
        cmd: &Command,
        device: &mut D,
        status: impl FnOnce() -> StatusReport,
    ) -> Dispatch {
        let reply = |value| Dispatch::Reply(encode_reply(cmd.key, cmd.reply_format, &value));

        match cmd.key {
            CommandKey::Nop => Dispatch::Ignored,
            CommandKey::Ping => reply(ReplyValue::Text("pong")),
            CommandKey::GetVersion => reply(ReplyValue::Version(self.firmware_version)),
            CommandKey::GetInfo => reply(ReplyValue::Info(DeviceInfo {
                uid: self.uid.clone(),
                board: self.board_version,
                version: self.firmware_version,
                uptime_secs: device.uptime_secs(),
            })),
            CommandKey::GetStatus => reply(ReplyValue::Status(status())),
            CommandKey::Restart => {
                device.restart();
                Dispatch::Done
            }
            CommandKey::SetReportInterval => {
                device.set_report_interval(cmd.arg_u32(0));
                Dispatch::Done
            }
            CommandKey::SetBrightness => {
                device.set_brightness(cmd.arg_u8(0));
                Dispatch::Done
            }
            CommandKey::Identify => {
                device.identify(cmd.arg_u16(0));
                Dispatch::Done
            }
            CommandKey::Update => Dispatch::StartUpdate,
        }
    }
}
