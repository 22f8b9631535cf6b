//! Reconnect backoff shared by the gateway and service sides.
//!
//! `delay(attempt) = min(base * 2^min(attempt, 10), max) * jitter`, with
//! jitter drawn uniformly from `[0.8, 1.2]` on every call. The policy never
//! gives up; the owner stops retrying by shutting down.

use std::time::Duration;

use rand::Rng;

/// Exponent cap so `2^attempt` cannot overflow.
const MAX_EXPONENT: u32 = 10;

/// Jitter bounds applied to every computed delay.
pub const JITTER_MIN: f64 = 0.8;
pub const JITTER_MAX: f64 = 1.2;

/// Jitter-free delay for `attempt`.
pub fn capped_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32 << attempt.min(MAX_EXPONENT);
    base.saturating_mul(factor).min(max)
}

/// Delay for `attempt` scaled by an explicit jitter factor.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration, jitter: f64) -> Duration {
    capped_delay(attempt, base, max).mul_f64(jitter)
}

/// Stateful backoff tracking the current attempt number.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Number of consecutive failed attempts since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Expected (jitter-free) delay for the next retry.
    pub fn expected_delay(&self) -> Duration {
        capped_delay(self.attempt, self.base, self.max)
    }

    /// Jittered delay for the next retry; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        let delay = backoff_delay(self.attempt, self.base, self.max, jitter);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Called after a successful handshake.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
