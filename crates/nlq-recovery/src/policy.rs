//! Bounded retry decisions.

use std::time::Duration;

use nlq_core::config::RecoveryConfig;
use serde::Serialize;

use crate::classifier::{ClassifiedError, RetryStrategy};

/// What to do after a failed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Generate new SQL with corrective feedback.
    Regenerate,
    /// Ask the user before trying again.
    Clarify,
    /// Re-run the identical SQL after `delay`.
    Backoff { delay: Duration },
    /// Stop; the turn fails.
    GiveUp { reason: GiveUpReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GiveUpReason {
    /// The error kind is never retried.
    Fatal,
    /// Regeneration ceiling reached.
    RetriesExhausted,
    /// Backoff attempts used up.
    BackoffExhausted,
}

/// Retry ceilings and the backoff schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub max_backoff_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RecoveryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            max_backoff_attempts: config.max_backoff_attempts,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: if config.backoff_multiplier >= 1.0 {
                config.backoff_multiplier
            } else {
                1.0
            },
        }
    }

    /// Delay before backoff retry number `step` (0-based):
    /// `initial_delay * multiplier^step`, capped at `max_delay`.
    pub fn backoff_delay(&self, step: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(step as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Whether another regeneration or clarification is allowed.
    pub fn can_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Decide the next step for a classified failure.
    ///
    /// `retry_count` counts regeneration and clarification attempts this
    /// turn; `backoff_attempts` counts same-SQL re-executions.
    pub fn decide(
        &self,
        error: &ClassifiedError,
        retry_count: u32,
        backoff_attempts: u32,
    ) -> RetryDecision {
        match error.retry_strategy {
            RetryStrategy::NoRetry => RetryDecision::GiveUp {
                reason: GiveUpReason::Fatal,
            },
            RetryStrategy::BackoffRetry => {
                if backoff_attempts < self.max_backoff_attempts {
                    RetryDecision::Backoff {
                        delay: self.backoff_delay(backoff_attempts),
                    }
                } else {
                    RetryDecision::GiveUp {
                        reason: GiveUpReason::BackoffExhausted,
                    }
                }
            }
            RetryStrategy::RegenerateSql if self.can_retry(retry_count) => {
                RetryDecision::Regenerate
            }
            RetryStrategy::ClarifyIntent if self.can_retry(retry_count) => RetryDecision::Clarify,
            RetryStrategy::RegenerateSql | RetryStrategy::ClarifyIntent => RetryDecision::GiveUp {
                reason: GiveUpReason::RetriesExhausted,
            },
        }
    }
}
