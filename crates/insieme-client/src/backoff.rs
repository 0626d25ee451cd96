//! Reconnect backoff state machine.
//!
//! `delay = min(max_delay, initial × factor^(attempt-1))` with uniform jitter
//! of ±`jitter × delay`, capped at `max_attempts`. The RNG is seedable so
//! tests get deterministic schedules.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Reconnect policy.
///
/// Reconnects are attempted only for transport faults and `server_error`;
/// `auth_failed` and `protocol_version_unsupported` never retry.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// First delay.
    pub initial_delay: Duration,
    /// Exponential growth factor.
    pub factor: f64,
    /// Upper bound on the computed delay (before jitter).
    pub max_delay: Duration,
    /// Jitter fraction in `[0, 1]`; the delay varies by ±`jitter × delay`.
    pub jitter: f64,
    /// Give up after this many attempts.
    pub max_attempts: u32,
    /// RNG seed for deterministic schedules in tests.
    pub seed: Option<u64>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
            max_attempts: 10,
            seed: None,
        }
    }
}

/// Mutable backoff state for one disconnect episode.
#[derive(Debug)]
pub(crate) struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
    rng: StdRng,
}

impl Backoff {
    pub(crate) fn new(policy: ReconnectPolicy) -> Self {
        let rng = match policy.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { policy, attempt: 0, rng }
    }

    /// Current attempt number (1-based after the first `next_delay`).
    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Next delay, or `None` once `max_attempts` is exhausted.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        self.attempt += 1;
        let exponent = i32::try_from(self.attempt - 1).unwrap_or(i32::MAX);
        let raw = self.policy.initial_delay.as_secs_f64() * self.policy.factor.powi(exponent);
        let capped = raw.min(self.policy.max_delay.as_secs_f64());
        let span = capped * self.policy.jitter;
        let jittered = if span > 0.0 {
            capped + self.rng.gen_range(-span..=span)
        } else {
            capped
        };
        Some(Duration::from_secs_f64(jittered.max(0.0)))
    }

    /// Reset after a successful reconnect.
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}
