//! Capped exponential backoff with jitter for handler retries.
//!
//! `base = 2^(attempts - 2)` seconds, `jitter` uniform in `[0, base)`, and the
//! sum capped at ten minutes. The first two attempts wait 250ms and 500ms base.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

const MAX_BACKOFF_MS: u64 = 600_000;

/// Upper bound on any single retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_millis(MAX_BACKOFF_MS);

/// Base delay in milliseconds before jitter.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn base_delay_ms(attempts: u32) -> u64 {
    let exponent = i32::try_from(attempts).unwrap_or(i32::MAX).saturating_sub(2);
    let millis = 2f64.powi(exponent) * 1000.0;
    if millis >= MAX_BACKOFF_MS as f64 {
        MAX_BACKOFF_MS
    } else {
        millis as u64
    }
}

/// Delay before retry number `attempts + 1`, drawn with `rng`.
pub fn delay_with<R: Rng + ?Sized>(attempts: u32, rng: &mut R) -> Duration {
    let base = base_delay_ms(attempts);
    let jitter = if base == 0 { 0 } else { rng.gen_range(0..base) };
    Duration::from_millis(base.saturating_add(jitter)).min(MAX_BACKOFF)
}

#[must_use]
pub fn delay(attempts: u32) -> Duration {
    delay_with(attempts, &mut rand::thread_rng())
}

/// Absolute time of the next attempt, measured from now.
#[must_use]
pub fn next_trigger_time(attempts: u32) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(delay(attempts)).unwrap_or(chrono::Duration::zero());
    Utc::now() + delay
}
