//! Inbound command rate limiting.
//!
//! A token bucket (via `burster`) sits in front of both command topics.
//! Commands over budget are dropped before decoding.

use core::time::Duration;

use burster::Limiter;

pub struct CommandLimiter {
    bucket: burster::TokenBucket<fn() -> Duration>,
}

impl CommandLimiter {
    /// `rate_per_sec` tokens refill each second, up to `burst`.
    pub fn new(rate_per_sec: u32, burst: u32) -> Self {
        Self::with_time_provider(rate_per_sec, burst, platform_now)
    }

    pub fn with_time_provider(rate_per_sec: u32, burst: u32, now: fn() -> Duration) -> Self {
        Self {
            bucket: burster::TokenBucket::new_with_time_provider(
                rate_per_sec.into(),
                burst.into(),
                now,
            ),
        }
    }

    /// Take one token. `false` means the command must be dropped.
    pub fn admit(&mut self) -> bool {
        self.bucket.try_consume(1).is_ok()
    }
}

#[cfg(target_os = "espidf")]
fn platform_now() -> Duration {
    let us = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
    Duration::from_micros(us as u64)
}

#[cfg(not(target_os = "espidf"))]
fn platform_now() -> Duration {
    use std::time::Instant;
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    START.get_or_init(Instant::now).elapsed()
}
