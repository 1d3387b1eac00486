//! Capped exponential backoff for sink retries and broker reconnects.

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `attempt` (1-based): `initial * 2^(attempt-1)`, capped.
///
/// Strictly increasing in `attempt` until the cap is reached.
pub fn retry_delay(attempt: u32, initial_ms: u64, max_ms: u64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let delay_ms = initial_ms.saturating_mul(1u64 << exponent);
    Duration::from_millis(delay_ms.min(max_ms))
}

/// Reconnect delay with equal jitter: half the capped exponential delay is
/// fixed, the other half random, so a fleet of consumers does not reconnect
/// in lockstep after a broker restart.
pub fn reconnect_delay(attempt: u32, initial_ms: u64, max_ms: u64) -> Duration {
    let ceiling = retry_delay(attempt, initial_ms, max_ms).as_millis() as u64;
    let half = ceiling / 2;
    let jitter = if half == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=half)
    };
    Duration::from_millis(ceiling - half + jitter)
}
