//! Stage retry policy with exponential backoff and jitter.
//!
//! A policy counts *total* attempts (the first try included). The
//! orchestrator drives the loop itself because every attempt must be
//! recorded; this module only answers "may I try again" and "how long
//! should I wait".

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry behaviour for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one (minimum 1).
    pub max_attempts: u32,

    /// Delay before the second attempt.
    #[serde(with = "millis")]
    pub initial_backoff: Duration,

    /// Upper bound for any single delay.
    #[serde(with = "millis")]
    pub max_backoff: Duration,

    /// Multiplier for exponential backoff (e.g., 2.0 = double each time).
    pub multiplier: f64,

    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Default::default() }
    }

    /// Fixed attempt count with tiny, deterministic delays. Handy for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Policy for stages dominated by long model calls.
    pub fn agent_heavy() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Effective attempt budget (never below one).
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Whether another attempt is allowed after `used` attempts.
    pub fn allows_another(&self, used: u32) -> bool {
        used < self.attempts()
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base_delay = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_backoff.as_millis() as f64);

        let final_delay = if self.jitter {
            let jitter_factor = 1.0 + rand::thread_rng().gen_range(0.0..0.25);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Delay after a failed attempt, honouring a provider backoff hint.
    pub fn backoff(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let computed = self.delay_for_attempt(attempt);
        hint.map_or(computed, |hint| computed.max(hint))
    }
}

/// Serialize `Duration` as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
