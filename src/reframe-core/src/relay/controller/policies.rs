// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Relay operational policies for bus-off recovery and transmit retries.
//!
//! Policies are pure: they look at the attempt count and return a decision.
//! The relay keeps one attempt counter per channel and asks the policy
//! separately for each.

use std::time::Duration;

/// Default number of reopen attempts after a bus-off.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default wait before each reopen attempt.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Outcome of consulting a recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Bounded-retry decision applied after a bus-off.
pub fn decide(attempt: u32, max_retries: u32, delay: Duration) -> RecoveryDecision {
    if attempt < max_retries {
        RecoveryDecision::RetryAfter(delay)
    } else {
        RecoveryDecision::GiveUp
    }
}

/// Policy for reopening a channel after bus-off.
pub trait RecoveryPolicy: Send + Sync {
    /// Decide what to do given the number of failed reopen attempts so far.
    fn decide(&self, attempt: u32) -> RecoveryDecision;

    /// Get the maximum number of reopen attempts allowed.
    fn max_retries(&self) -> u32;
}

/// Fixed delay recovery policy.
///
/// Uses a constant delay between reopen attempts.
#[derive(Debug, Clone)]
pub struct FixedDelay {
    max_retries: u32,
    delay: Duration,
}

impl FixedDelay {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for FixedDelay {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY)
    }
}

impl RecoveryPolicy for FixedDelay {
    fn decide(&self, attempt: u32) -> RecoveryDecision {
        decide(attempt, self.max_retries, self.delay)
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Exponential backoff policy.
///
/// Delays increase exponentially with each attempt, up to a configured
/// maximum delay.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt);
        let delay = self.base_delay.saturating_mul(multiplier);
        delay.min(self.max_delay)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl RecoveryPolicy for ExponentialBackoff {
    fn decide(&self, attempt: u32) -> RecoveryDecision {
        decide(attempt, self.max_attempts, self.delay(attempt))
    }

    fn max_retries(&self) -> u32 {
        self.max_attempts
    }
}

/// Transmit backpressure handling for the output channel.
#[derive(Debug, Clone)]
pub struct TxThrottle {
    /// Send attempts per frame while the transmit buffer is full.
    pub max_send_retries: u32,
    /// Backoff between those attempts, doubling and capped.
    pub backoff: ExponentialBackoff,
    /// Minimum spacing between two sends.
    pub min_gap: Duration,
    /// Pause after a frame had to be dropped.
    pub overflow_cooldown: Duration,
}

impl TxThrottle {
    pub fn new(
        max_send_retries: u32,
        initial_delay: Duration,
        min_gap: Duration,
        overflow_cooldown: Duration,
    ) -> Self {
        let max_send_retries = max_send_retries.max(1);
        Self {
            max_send_retries,
            backoff: ExponentialBackoff::new(
                max_send_retries,
                initial_delay,
                Duration::from_millis(200),
            ),
            min_gap,
            overflow_cooldown,
        }
    }
}

impl Default for TxThrottle {
    fn default() -> Self {
        Self::new(
            10,
            Duration::from_millis(10),
            Duration::ZERO,
            Duration::from_millis(50),
        )
    }
}
