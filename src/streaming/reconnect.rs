//! Bounded, fixed-interval reconnection policy
//!
//! Pure bookkeeping with no clock: the transport asks what to do after each
//! unexpected closure and does the waiting itself. An attempt that fails
//! before the connection opens counts as another closure. A successful open
//! resets the counter.

use std::time::Duration;

/// Maximum reconnection attempts after an unexpected closure
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Fixed spacing between attempt initiations (no backoff)
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Start attempt number `attempt` (1-based) `delay` after the previous initiation
    Retry { attempt: u32, delay: Duration },
    /// Attempts exhausted
    GiveUp { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    interval: Duration,
    attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_INTERVAL)
    }
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            attempts: 0,
        }
    }

    /// Record a closure that was not requested by `close()`.
    pub fn on_unexpected_close(&mut self) -> ReconnectDecision {
        if self.attempts >= self.max_attempts {
            return ReconnectDecision::GiveUp {
                attempts: self.attempts,
            };
        }
        self.attempts += 1;
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay: self.interval,
        }
    }

    /// Record a successful open
    pub fn on_connected(&mut self) {
        self.attempts = 0;
    }

    /// Attempts made since the last successful open
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
