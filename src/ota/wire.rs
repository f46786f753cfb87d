//! Firmware update handshake payloads.
//!
//! All integers are little-endian.
//!
//! | Direction | Payload | Layout |
//! |-----------|---------|--------|
//! | in (drx)  | version announce | `[version:u16][size:u32]` |
//! | in (drx)  | chunk | `[offset:u32][bytes..]` |
//! | in (drx)  | digest | 32 raw SHA-256 bytes |
//! | out (dtx) | write flag | `[next_offset:u32][chunk_size:u32]` |

use core::fmt;

/// Length of the image digest (SHA-256).
pub const DIGEST_LEN: usize = 32;

pub type Digest = [u8; DIGEST_LEN];

/// Write-flag value asking the peer for the image digest.
pub const REQUIRE_VERIFY: u32 = 0xFFFF_FFFF;

/// Write-flag value asking the peer for the version announce.
pub const REQUIRE_VERSION: u32 = 0xFFFF_FFFE;

const ANNOUNCE_LEN: usize = 6;
const CHUNK_HEADER_LEN: usize = 4;
const WRITE_FLAG_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Payload shorter than its fixed header.
    Truncated,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "payload truncated"),
        }
    }
}

// ── Version announce ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionAnnounce {
    pub version: u16,
    pub size: u32,
}

impl VersionAnnounce {
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < ANNOUNCE_LEN {
            return Err(WireError::Truncated);
        }
        Ok(Self {
            version: u16::from_le_bytes([bytes[0], bytes[1]]),
            size: u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
        })
    }

    pub fn encode(&self) -> [u8; ANNOUNCE_LEN] {
        let mut out = [0u8; ANNOUNCE_LEN];
        out[..2].copy_from_slice(&self.version.to_le_bytes());
        out[2..].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

// ── Chunk ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub offset: u32,
    pub data: &'a [u8],
}

impl<'a> Chunk<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, WireError> {
        if bytes.len() < CHUNK_HEADER_LEN {
            return Err(WireError::Truncated);
        }
        let (header, data) = bytes.split_at(CHUNK_HEADER_LEN);
        Ok(Self {
            offset: u32::from_le_bytes([header[0], header[1], header[2], header[3]]),
            data,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + self.data.len());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(self.data);
        out
    }
}

// ── Write flag ─────────────────────────────────────────────

/// Outbound request telling the peer what to send next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteFlag {
    pub next_offset: u32,
    pub chunk_size: u32,
}

impl WriteFlag {
    pub const VERIFY: Self = Self {
        next_offset: REQUIRE_VERIFY,
        chunk_size: REQUIRE_VERIFY,
    };

    pub const VERSION: Self = Self {
        next_offset: REQUIRE_VERSION,
        chunk_size: REQUIRE_VERSION,
    };

    pub fn data(next_offset: u32, chunk_size: u32) -> Self {
        Self {
            next_offset,
            chunk_size,
        }
    }

    pub fn requires_verify(&self) -> bool {
        *self == Self::VERIFY
    }

    pub fn requires_version(&self) -> bool {
        *self == Self::VERSION
    }

    pub fn encode(&self) -> [u8; WRITE_FLAG_LEN] {
        let mut out = [0u8; WRITE_FLAG_LEN];
        out[..4].copy_from_slice(&self.next_offset.to_le_bytes());
        out[4..].copy_from_slice(&self.chunk_size.to_le_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < WRITE_FLAG_LEN {
            return Err(WireError::Truncated);
        }
        Ok(Self {
            next_offset: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            chunk_size: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }
}

/// SHA-256 of a complete image, as the update peer computes it.
pub fn image_digest(image: &[u8]) -> Digest {
    hmac_sha256::Hash::hash(image)
}
