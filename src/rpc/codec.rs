//! Command envelope decoding.
//!
//! Two envelopes reach the device and both decode into the same
//! [`Command`]:
//!
//! ```text
//! binary  api/cmd/U     ┌────────────┬──────────────────┐
//!                       │ key u16 LE │ packed args (N B)│
//!                       └────────────┴──────────────────┘
//! json    api/strcmd/U  {"cmd":"SetBrightness","level":40,"retfmt":"json"}
//! ```
//!
//! Unknown keys and too-short binary envelopes decode to the no-op command.
//! Arguments of a known command are validated here, before dispatch.

use core::fmt;

use serde_json::{Map, Value};

use crate::error::DecodeError;

/// Largest packed argument block.
pub const MAX_ARGS: usize = 16;

pub type Args = heapless::Vec<u8, MAX_ARGS>;

/// Every command the device understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandKey {
    Nop = 0x0000,
    Ping = 0x0001,
    GetVersion = 0x0002,
    GetInfo = 0x0003,
    GetStatus = 0x0004,
    Restart = 0x0010,
    SetReportInterval = 0x0011,
    SetBrightness = 0x0012,
    Identify = 0x0013,
    Update = 0x0020,
}

impl CommandKey {
    pub const ALL: [Self; 10] = [
        Self::Nop,
        Self::Ping,
        Self::GetVersion,
        Self::GetInfo,
        Self::GetStatus,
        Self::Restart,
        Self::SetReportInterval,
        Self::SetBrightness,
        Self::Identify,
        Self::Update,
    ];

    pub fn from_u16(key: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|k| *k as u16 == key)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| *k != Self::Nop && k.name() == name)
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Name used in JSON envelopes and replies.
    pub fn name(self) -> &'static str {
        match self {
            Self::Nop => "",
            Self::Ping => "Ping",
            Self::GetVersion => "GetVersion",
            Self::GetInfo => "GetInfo",
            Self::GetStatus => "GetStatus",
            Self::Restart => "Restart",
            Self::SetReportInterval => "SetReportInterval",
            Self::SetBrightness => "SetBrightness",
            Self::Identify => "Identify",
            Self::Update => "Update",
        }
    }

    /// Exact packed argument length.
    pub fn args_len(self) -> usize {
        match self {
            Self::SetReportInterval => 4,
            Self::SetBrightness => 1,
            Self::Identify => 2,
            _ => 0,
        }
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nop => write!(f, "Nop"),
            other => write!(f, "{}", other.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyFormat {
    Binary,
    Json,
}

/// A decoded command with its arguments packed in binary layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub key: CommandKey,
    pub args: Args,
    pub reply_format: ReplyFormat,
}

impl Command {
    pub fn nop() -> Self {
        Self {
            key: CommandKey::Nop,
            args: Args::new(),
            reply_format: ReplyFormat::Binary,
        }
    }

    pub fn is_nop(&self) -> bool {
        self.key == CommandKey::Nop
    }

    /// Little-endian u32 argument at `at`. Validated lengths make this total
    /// for the commands that carry one.
    pub fn arg_u32(&self, at: usize) -> u32 {
        let mut b = [0u8; 4];
        if let Some(src) = self.args.get(at..at + 4) {
            b.copy_from_slice(src);
        }
        u32::from_le_bytes(b)
    }

    pub fn arg_u16(&self, at: usize) -> u16 {
        let mut b = [0u8; 2];
        if let Some(src) = self.args.get(at..at + 2) {
            b.copy_from_slice(src);
        }
        u16::from_le_bytes(b)
    }

    pub fn arg_u8(&self, at: usize) -> u8 {
        self.args.get(at).copied().unwrap_or(0)
    }
}

// ── Argument ranges ────────────────────────────────────────

const REPORT_INTERVAL_SECS: core::ops::RangeInclusive<u64> = 1..=86_400;
const BRIGHTNESS_LEVEL: core::ops::RangeInclusive<u64> = 0..=100;
const IDENTIFY_SECS: core::ops::RangeInclusive<u64> = 1..=600;

/// Range-check packed arguments. Shared by both envelopes.
fn check_args(cmd: &Command) -> Result<(), DecodeError> {
    let (field, value, range) = match cmd.key {
        CommandKey::SetReportInterval => ("secs", cmd.arg_u32(0) as u64, REPORT_INTERVAL_SECS),
        CommandKey::SetBrightness => ("level", cmd.arg_u8(0) as u64, BRIGHTNESS_LEVEL),
        CommandKey::Identify => ("secs", cmd.arg_u16(0) as u64, IDENTIFY_SECS),
        _ => return Ok(()),
    };
    if range.contains(&value) {
        Ok(())
    } else {
        Err(DecodeError::InvalidField(field))
    }
}

// ── Binary envelope ────────────────────────────────────────

/// Decode `[key:u16 LE][args]`.
pub fn decode_binary(bytes: &[u8]) -> Result<Command, DecodeError> {
    if bytes.len() < 2 {
        return Ok(Command::nop());
    }
    let Some(key) = CommandKey::from_u16(u16::from_le_bytes([bytes[0], bytes[1]])) else {
        return Ok(Command::nop());
    };
    let raw = &bytes[2..];
    if raw.len() > MAX_ARGS {
        return Err(DecodeError::ArgsTooLong);
    }
    if raw.len() != key.args_len() {
        return Err(DecodeError::ArgsLength);
    }
    let cmd = Command {
        key,
        args: Args::from_slice(raw).map_err(|_| DecodeError::ArgsTooLong)?,
        reply_format: ReplyFormat::Binary,
    };
    check_args(&cmd)?;
    Ok(cmd)
}

/// Build a binary envelope. The host simulator and tests speak this.
pub fn encode_binary(key: CommandKey, args: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + args.len());
    out.extend_from_slice(&key.as_u16().to_le_bytes());
    out.extend_from_slice(args);
    out
}

// ── JSON envelope ──────────────────────────────────────────

/// Decode `{"cmd": "<Name>", <fields>..., "retfmt": "json"?}`.
pub fn decode_json(bytes: &[u8]) -> Result<Command, DecodeError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|_| DecodeError::InvalidJson)?;
    let Value::Object(obj) = value else {
        return Err(DecodeError::InvalidJson);
    };
    let name = obj
        .get("cmd")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingCommand)?;
    let reply_format = match obj.get("retfmt").and_then(Value::as_str) {
        Some("json") => ReplyFormat::Json,
        _ => ReplyFormat::Binary,
    };
    let Some(key) = CommandKey::from_name(name) else {
        return Ok(Command {
            reply_format,
            ..Command::nop()
        });
    };

    let mut args = Args::new();
    let packed = match key {
        CommandKey::SetReportInterval => {
            let secs = field_u64(&obj, "secs", u32::MAX as u64)?;
            args.extend_from_slice(&(secs as u32).to_le_bytes())
        }
        CommandKey::SetBrightness => {
            let level = field_u64(&obj, "level", u8::MAX as u64)?;
            args.extend_from_slice(&[level as u8])
        }
        CommandKey::Identify => {
            let secs = field_u64(&obj, "secs", u16::MAX as u64)?;
            args.extend_from_slice(&(secs as u16).to_le_bytes())
        }
        _ => Ok(()),
    };
    packed.map_err(|_| DecodeError::ArgsTooLong)?;

    let cmd = Command {
        key,
        args,
        reply_format,
    };
    check_args(&cmd)?;
    Ok(cmd)
}

fn field_u64(obj: &Map<String, Value>, name: &'static str, max: u64) -> Result<u64, DecodeError> {
    let v = obj.get(name).ok_or(DecodeError::MissingField(name))?;
    v.as_u64()
        .filter(|n| *n <= max)
        .ok_or(DecodeError::InvalidField(name))
}

/// Best-effort name of the command in a JSON envelope that failed to
/// decode, for the error reply.
pub fn json_command_name(bytes: &[u8]) -> heapless::String<32> {
    let mut out = heapless::String::new();
    if let Ok(Value::Object(obj)) = serde_json::from_slice::<Value>(bytes) {
        if let Some(name) = obj.get("cmd").and_then(Value::as_str) {
            let _ = out.push_str(name);
        }
    }
    out
}
