//! Retry policies
//!
//! Per-step attempt limits with fixed or exponential backoff.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay strategy between attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry
    Fixed {
        #[serde(default)]
        delay_ms: u64,
    },
    /// Delay grows by `multiplier` per attempt, capped at `max_ms`
    Exponential {
        #[serde(default = "default_initial_ms")]
        initial_ms: u64,
        #[serde(default = "default_max_ms")]
        max_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(default = "default_jitter")]
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_initial_ms() -> u64 {
    1_000
}

fn default_max_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

/// Jitter factor applied to exponential delays (0.0 to 1.0)
const JITTER_FACTOR: f64 = 0.3;

/// Retry policy declared on a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed { delay_ms: 0 },
        }
    }

    /// Fixed delay between attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed {
                delay_ms: delay.as_millis() as u64,
            },
        }
    }

    /// Exponential backoff with default timings
    pub fn exponential(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Whether another attempt is allowed after `attempts_made` executions
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay before the retry that follows attempt `attempt` (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        match &self.backoff {
            Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Backoff::Exponential {
                initial_ms,
                max_ms,
                multiplier,
                jitter,
            } => {
                let base = Duration::from_millis(*initial_ms)
                    .mul_f64(multiplier.powi((attempt - 1) as i32));
                let delay = base.min(Duration::from_millis(*max_ms));

                if *jitter {
                    add_jitter(delay)
                } else {
                    delay
                }
            }
        }
    }
}

/// Randomly add or subtract up to `JITTER_FACTOR` of the delay
fn add_jitter(delay: Duration) -> Duration {
    let jitter_range = delay.mul_f64(JITTER_FACTOR);
    if jitter_range.is_zero() {
        return delay;
    }

    let mut rng = rand::thread_rng();
    let jitter = rng.gen_range(Duration::ZERO..jitter_range);

    if rng.gen_bool(0.5) {
        delay + jitter
    } else {
        delay.saturating_sub(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(250));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn test_exponential_without_jitter_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff: Backoff::Exponential {
                initial_ms: 100,
                max_ms: 1_000,
                multiplier: 2.0,
                jitter: false,
            },
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                initial_ms: 1_000,
                max_ms: 10_000,
                multiplier: 2.0,
                jitter: true,
            },
        };

        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(700));
            assert!(delay <= Duration::from_millis(1_300));
        }
    }

    #[test]
    fn test_should_retry_counts_total_attempts() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn test_deserialize_from_yaml() {
        let policy: RetryPolicy = serde_yaml::from_str(
            "max_attempts: 5\nbackoff:\n  type: fixed\n  delay_ms: 10\n",
        )
        .unwrap();

        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff, Backoff::Fixed { delay_ms: 10 });

        let defaulted: RetryPolicy = serde_yaml::from_str("max_attempts: 2\n").unwrap();
        assert!(matches!(defaulted.backoff, Backoff::Exponential { .. }));
    }
}
