//! Capped exponential backoff for unexpected worker exits.

use std::time::Duration;

use crate::config::RestartSettings;

/// What to do after a failure was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Relaunch after `delay`. `attempt` counts from 1.
    Retry { attempt: u32, delay: Duration },
    /// Budget exhausted; stay down.
    GiveUp { failures: u32 },
}

/// Consecutive-failure counter.
///
/// Only the supervisor control loop mutates it. A successful readiness
/// transition calls [`reset`](Self::reset), giving a later crash a fresh budget.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    failures: u32,
    max_retries: u32,
    base: Duration,
    cap: Duration,
}

impl RestartPolicy {
    pub fn new(max_retries: u32, base: Duration, cap: Duration) -> Self {
        Self {
            failures: 0,
            max_retries,
            base,
            cap,
        }
    }

    pub fn from_settings(settings: &RestartSettings) -> Self {
        Self::new(
            settings.max_retries,
            Duration::from_millis(settings.base_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
        )
    }

    /// `min(base * 2^(attempt-1), cap)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map(|d| d.min(self.cap))
            .unwrap_or(self.cap)
    }

    pub fn record_failure(&mut self) -> RestartDecision {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.max_retries {
            return RestartDecision::GiveUp {
                failures: self.failures,
            };
        }
        RestartDecision::Retry {
            attempt: self.failures,
            delay: self.delay_for(self.failures),
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}
