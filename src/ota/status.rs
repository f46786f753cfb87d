//! Update status codes and the JSON status message published on
//! `api/updatecode/U`.

use core::fmt::Write;

use serde::Serialize;

use crate::error::{StoreError, UpdateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    UpdateOk = 0,
    RunningPartitionNotBoot = 1,
    GetUpdatePartitionFailed = 2,
    SetBootPartitionFailed = 3,
    BeginFailed = 4,
    EndFailed = 5,
    WriteFailed = 6,
    RxDataMismatched = 7,
    RxDataTooLarge = 8,
    DigestOk = 9,
    DigestFailed = 10,
    DownloadProgress = 11,
    UpdateBusy = 12,
    PeripheralsBusy = 13,
}

impl StatusCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<StoreError> for StatusCode {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NoPartition => Self::GetUpdatePartitionFailed,
            StoreError::Begin => Self::BeginFailed,
            StoreError::Write => Self::WriteFailed,
            StoreError::End => Self::EndFailed,
            StoreError::SetBoot => Self::SetBootPartitionFailed,
        }
    }
}

impl UpdateError {
    /// Status code reported when a session ends with this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Busy => StatusCode::UpdateBusy,
            Self::RunningNotBoot => StatusCode::RunningPartitionNotBoot,
            Self::PeripheralsBusy => StatusCode::PeripheralsBusy,
            Self::AlreadyLatest => StatusCode::UpdateOk,
            Self::TooLarge | Self::Overflow => StatusCode::RxDataTooLarge,
            Self::Malformed | Self::OutOfOrder | Self::Link(_) => StatusCode::RxDataMismatched,
            Self::DigestMismatch => StatusCode::DigestFailed,
            Self::Store(e) => (*e).into(),
        }
    }
}

type Field = heapless::String<12>;

#[derive(Serialize)]
struct StatusMessage<'a> {
    code: Field,
    msg: &'a str,
    val: Field,
}

/// Encode `{"code":"<n>","msg":"<text>","val":"<n>"}`.
pub fn encode(code: StatusCode, msg: &str, val: u32) -> Vec<u8> {
    let mut code_field = Field::new();
    let _ = write!(code_field, "{}", code.as_u8());
    let mut val_field = Field::new();
    let _ = write!(val_field, "{}", val);
    let message = StatusMessage {
        code: code_field,
        msg,
        val: val_field,
    };
    // A struct of strings always serializes.
    serde_json::to_vec(&message).unwrap_or_default()
}
