// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{HubError, HubResult};

/// Retry policy. The delay before attempt `n > 1` is
/// `min(initial_delay * factor^(n-1), max_delay)`, jittered to
/// `[0.5d, 1.5d]` when `jitter` is set.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Fixed small policy for quick in-process operations.
    pub fn quick() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            factor: 2.0,
            jitter: true,
        }
    }

    fn delay_before(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.factor.powi(exp);
        let capped = base.min(self.max_delay.as_secs_f64());
        let secs = if self.jitter {
            capped * rand::rng().random_range(0.5..=1.5)
        } else {
            capped
        };
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Invoke `op` until it succeeds, returns a non-retryable error, the attempt
/// budget is exhausted, or `cancel` fires during a backoff sleep.
///
/// An exhausted retry surfaces the last underlying error annotated with the
/// attempt count. Cancellation surfaces as a timeout-kind error.
pub async fn retry<T, F, Fut>(
    cancel: &CancellationToken,
    config: &RetryConfig,
    mut op: F,
) -> HubResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = HubResult<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut last_err: Option<HubError> = None;

    for attempt in 1..=attempts {
        if attempt > 1 {
            let delay = config.delay_before(attempt);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(HubError::timeout("retry cancelled")
                        .with_context("attempt", attempt.to_string()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                tracing::debug!(attempt, err = %e, "retryable attempt failed");
                last_err = Some(e);
            }
        }
    }

    match last_err {
        Some(e) => Err(e.with_context("attempts", attempts.to_string())),
        // Unreachable with attempts >= 1, but the lint disallows panicking.
        None => Err(HubError::service("retry loop exited without an attempt")),
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
