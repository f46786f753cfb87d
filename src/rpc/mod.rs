//! Command intake.
//!
//! ```text
//!   payload ──▶ limiter ──▶ codec (binary | JSON) ──▶ router ──▶ reply
//! ```

pub mod codec;
pub mod limiter;
pub mod router;
