//! Backoff policy for failed tasks.
//!
//! A failed task gets `retry_count += 1`. While `retry_count < max_retries`
//! it is rescheduled `initial_delay * multiplier^retry_count` from now;
//! otherwise it is dropped. With the defaults that is 120s then 240s, and the
//! third failure removes the task.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::models::AgentTask;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Base delay before exponentiation
    pub initial_delay: Duration,
    /// Multiplier applied per retry
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

/// What happened to a task after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Still queued, eligible again at `at`.
    Rescheduled { at: DateTime<Utc> },
    /// Attempts used up; the task must be removed.
    Exhausted,
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            ..Default::default()
        }
    }

    /// Delay for a task whose counter has already been incremented to `retry_count`.
    /// Saturates at `Duration::MAX`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX)
    }

    /// Record one failure on `task` and decide its fate.
    pub fn record_failure(&self, task: &mut AgentTask, now: DateTime<Utc>) -> RetryDecision {
        task.retry_count = task.retry_count.saturating_add(1);
        if task.retry_count >= task.max_retries {
            return RetryDecision::Exhausted;
        }

        let delay = chrono::Duration::from_std(self.delay_for(task.retry_count))
            .unwrap_or(chrono::Duration::MAX);
        let at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        task.scheduled_for = Some(at);
        RetryDecision::Rescheduled { at }
    }
}
