//! Retry backoff with jitter.
//!
//! The curve is a configuration parameter, not a constant: the push client
//! and the deliverer each carry their own [`Backoff`] instance built from
//! daemon configuration.

use std::time::Duration;

/// An exponential backoff curve with random jitter.
///
/// Delay for attempt `n` (1-based) is `min(cap, base * 2^(n-1))` plus a
/// uniform random jitter. Jitter spreads out reconnect storms when many
/// clients lose the same broker at once.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: Duration,
}

impl Backoff {
    /// Create a backoff curve.
    pub fn new(base: Duration, cap: Duration, jitter: Duration) -> Self {
        Self { base, cap, jitter }
    }

    /// The delay before the given attempt (1-based).
    ///
    /// Attempt 0 is treated as attempt 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let scaled = self
            .base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.cap)
            .min(self.cap);
        scaled + self.jitter_sample()
    }

    fn jitter_sample(&self) -> Duration {
        let span = self.jitter.as_millis() as u64;
        if span == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(random_u64() % (span + 1))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: Duration::from_millis(1000),
        }
    }
}

fn random_u64() -> u64 {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    u64::from_le_bytes(bytes)
}
