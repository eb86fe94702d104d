//! Retry delay calculation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Longest delay ever returned, whatever the attempt number.
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// `base * 2^(attempt - 1)`, saturating at [`MAX_BACKOFF`].
///
/// `attempt` is the number of the attempt that just failed, starting at 1.
pub fn exponential_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

/// Exponential delay plus uniform jitter in `[0, jitter]`.
pub fn backoff_delay<R: Rng + ?Sized>(
    base: Duration,
    jitter: Duration,
    attempt: u32,
    rng: &mut R,
) -> Duration {
    let delay = exponential_delay(base, attempt);
    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rng.gen_range(0..=jitter_ms))
}

/// Parse a `Retry-After` header: either delta-seconds or an HTTP-date.
///
/// A date in the past yields zero. Unparseable values yield `None`.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs).min(MAX_BACKOFF));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some(
        (at - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(MAX_BACKOFF),
    )
}
