//! ============================================================================
//! Replay Retry Logic - Bounded attempts with exponential backoff
//! ============================================================================
//! Applies to queued scans the authority rejected at the application level.
//! Transport failures never count against a record; they only end the cycle.
//! ============================================================================

use rand::Rng;
use std::time::Duration;

/// Retry bounds for rejected replays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Rejections after which a record is dropped
    pub max_attempts: u32,
    /// Base delay before the next replay (multiplied by 2^(attempt-1))
    pub base_delay_ms: u64,
    /// Maximum delay between replays
    pub max_delay_ms: u64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 30_000,
            max_delay_ms: 15 * 60 * 1000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Whether `attempts` rejections exhaust the budget
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Result of recording one rejection against a queued scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Kept; will be replayed again after the backoff
    Retry { attempts: u32, delay: Duration },
    /// Removed from the queue after the final rejection
    Dropped { attempts: u32 },
    /// The record was no longer queued
    Missing,
}

/// Calculate delay after the given number of rejections (1-based) with
/// exponential backoff and optional jitter
pub fn calculate_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63);
    let multiplier = 2u64.saturating_pow(exponent);
    let capped_delay = policy
        .base_delay_ms
        .saturating_mul(multiplier)
        .min(policy.max_delay_ms);

    let final_delay = if policy.jitter {
        // Add random jitter (0-50% of delay)
        let jitter_factor = 1.0 + rand::thread_rng().gen_range(0.0..0.5);
        (capped_delay as f64 * jitter_factor) as u64
    } else {
        capped_delay
    };

    Duration::from_millis(final_delay)
}
