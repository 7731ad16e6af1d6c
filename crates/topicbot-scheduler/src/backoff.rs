//! Retry backoff: exponential with jitter, capped.

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `retry` (1-based): exponential doubling from
/// `base`, capped at `max`, with full jitter over the upper half so a burst
/// of failing jobs does not retry in lockstep.
pub fn backoff_delay(retry: u32, base: Duration, max: Duration) -> Duration {
    let shift = retry.saturating_sub(1).min(16);
    let exp = base.saturating_mul(1u32 << shift).min(max);
    let half = exp / 2;
    let jitter = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
    half + Duration::from_millis(jitter)
}
