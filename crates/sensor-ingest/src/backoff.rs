// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Capped exponential backoff.
//!
//! Used for broker reconnects and for optional store write retries.
//!
//! The delay doubles per attempt until it reaches the cap. Jitter is
//! derived from the attempt number and a caller-supplied salt rather than an
//! RNG, so a run is reproducible in tests while two services with different
//! salts (the broker port, say) still spread their retries apart.

use std::time::Duration;

/// Backoff state for one retry sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    salt: u32,
    /// Current attempt number (0-based).
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, salt: u32) -> Self {
        Self {
            initial,
            max: max.max(initial),
            salt,
            attempt: 0,
        }
    }

    /// Attempts made since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = Self::delay_for(self.initial, self.max, self.attempt, self.salt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Back to the initial delay (after a successful attempt).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay for a given attempt, jitter included.
    ///
    /// Always within 75% to 125% of `min(initial * 2^attempt, max)`, and
    /// never below 1ms.
    pub fn delay_for(initial: Duration, max: Duration, attempt: u32, salt: u32) -> Duration {
        let base = initial
            .checked_mul(2u32.saturating_pow(attempt))
            .map_or(max, |delay| delay.min(max));

        let percent = 75 + attempt.wrapping_mul(7).wrapping_add(salt) % 50;
        let jittered = base.checked_mul(percent).map_or(base, |d| d / 100);

        jittered.max(Duration::from_millis(1))
    }
}
