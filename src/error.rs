//! Unified error types for the SensorLink engine.
//!
//! A single `Error` enum that every subsystem converts into, keeping the
//! task loops' error handling uniform. All variants are `Copy` so they can
//! be passed between the I/O, retry and keep-alive tasks without allocation.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation in the engine funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The reliable channel could not deliver or track a message.
    Link(LinkError),
    /// An inbound command envelope was malformed.
    Decode(DecodeError),
    /// The firmware update session aborted.
    Update(UpdateError),
    /// The update store rejected an operation.
    Store(StoreError),
    /// Configuration is invalid or could not be loaded.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Link(e) => write!(f, "link: {e}"),
            Self::Decode(e) => write!(f, "decode: {e}"),
            Self::Update(e) => write!(f, "update: {e}"),
            Self::Store(e) => write!(f, "store: {e}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Link errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// The transport is not connected to the broker.
    NotConnected,
    /// Every retry slot is occupied; a QoS>0 publish cannot be tracked.
    PoolFull,
    /// The message id is already tracked by the retry pool.
    DuplicateId,
    /// The publish lock could not be taken within the configured timeout.
    LockTimeout,
    /// The transport rejected the write.
    Transport,
    /// Topic name exceeds the fixed topic buffer.
    TopicTooLong,
    /// Payload exceeds the fixed retained-payload buffer.
    PayloadTooLarge,
    /// The subscription table has no room for another topic.
    TopicTableFull,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected"),
            Self::PoolFull => write!(f, "retry pool full"),
            Self::DuplicateId => write!(f, "message id already in flight"),
            Self::LockTimeout => write!(f, "publish lock timed out"),
            Self::Transport => write!(f, "transport write failed"),
            Self::TopicTooLong => write!(f, "topic too long"),
            Self::PayloadTooLarge => write!(f, "payload too large"),
            Self::TopicTableFull => write!(f, "topic table full"),
        }
    }
}

impl From<LinkError> for Error {
    fn from(e: LinkError) -> Self {
        Self::Link(e)
    }
}

// ---------------------------------------------------------------------------
// Decode errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload is not a JSON object.
    InvalidJson,
    /// The `cmd` field is missing or not a string.
    MissingCommand,
    /// A required per-command field is absent.
    MissingField(&'static str),
    /// A per-command field has the wrong type or is out of range.
    InvalidField(&'static str),
    /// Argument bytes do not match the command's fixed layout.
    ArgsLength,
    /// Argument bytes exceed the packed argument buffer.
    ArgsTooLong,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson => write!(f, "invalid JSON envelope"),
            Self::MissingCommand => write!(f, "missing cmd"),
            Self::MissingField(name) => write!(f, "missing field '{name}'"),
            Self::InvalidField(name) => write!(f, "invalid field '{name}'"),
            Self::ArgsLength => write!(f, "argument length mismatch"),
            Self::ArgsTooLong => write!(f, "arguments too long"),
        }
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

// ---------------------------------------------------------------------------
// Update store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// No inactive partition is available to receive the image.
    NoPartition,
    /// Opening the update handle failed.
    Begin,
    /// Writing image bytes failed.
    Write,
    /// Closing (validating) the written image failed.
    End,
    /// Marking the new image as boot target failed.
    SetBoot,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPartition => write!(f, "no update partition"),
            Self::Begin => write!(f, "update begin failed"),
            Self::Write => write!(f, "update write failed"),
            Self::End => write!(f, "update end failed"),
            Self::SetBoot => write!(f, "set boot partition failed"),
        }
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

// ---------------------------------------------------------------------------
// Update session errors
// ---------------------------------------------------------------------------

/// Reasons an update session returned to `Idle` without applying an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateError {
    /// Another update session is already active.
    Busy,
    /// The running image is not the one marked for boot.
    RunningNotBoot,
    /// Peripheral tasks did not acknowledge the pause in time.
    PeripheralsBusy,
    /// The offered version is not newer than the running one.
    AlreadyLatest,
    /// Announced image size is zero or exceeds the partition budget.
    TooLarge,
    /// A payload arrived that does not fit the current state.
    Malformed,
    /// Chunk offset does not match the bytes written so far.
    OutOfOrder,
    /// Chunk would write past the announced size.
    Overflow,
    /// The received digest does not match the computed one.
    DigestMismatch,
    /// The update store failed.
    Store(StoreError),
    /// A handshake request could not be published.
    Link(LinkError),
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "update already in progress"),
            Self::RunningNotBoot => write!(f, "running partition is not boot partition"),
            Self::PeripheralsBusy => write!(f, "peripherals did not pause"),
            Self::AlreadyLatest => write!(f, "already latest"),
            Self::TooLarge => write!(f, "image size out of range"),
            Self::Malformed => write!(f, "malformed update payload"),
            Self::OutOfOrder => write!(f, "chunk offset mismatched"),
            Self::Overflow => write!(f, "chunk exceeds image size"),
            Self::DigestMismatch => write!(f, "digest mismatch"),
            Self::Store(e) => write!(f, "{e}"),
            Self::Link(e) => write!(f, "{e}"),
        }
    }
}

impl From<StoreError> for UpdateError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<UpdateError> for Error {
    fn from(e: UpdateError) -> Self {
        Self::Update(e)
    }
}

impl core::error::Error for Error {}
impl core::error::Error for LinkError {}
impl core::error::Error for DecodeError {}
impl core::error::Error for StoreError {}
impl core::error::Error for UpdateError {}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Engine-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
