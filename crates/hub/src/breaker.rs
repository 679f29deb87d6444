// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Circuit breaker gating a unit of work.
//!
//! Closed until `failure_threshold` consecutive failures, then Open for
//! `reset_timeout`, then a single Half-Open probe decides whether to close
//! again. The state lock is never held across the guarded operation.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::{HubError, HubResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

enum Admission {
    Normal,
    Probe,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Run `op` through the breaker. In Open state the call returns a
    /// service error without invoking `op`; in Half-Open exactly one caller
    /// gets to probe while the rest are rejected.
    pub async fn execute<T, F, Fut>(&self, op: F) -> HubResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = HubResult<T>>,
    {
        let admission = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                BreakerState::Closed => Admission::Normal,
                BreakerState::Open => {
                    let ready = inner
                        .opened_at
                        .is_some_and(|at| at.elapsed() >= self.reset_timeout);
                    if !ready {
                        return Err(self.rejection());
                    }
                    tracing::debug!(breaker = %self.name, "reset timeout elapsed, probing");
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    Admission::Probe
                }
                BreakerState::HalfOpen => {
                    if inner.probe_in_flight {
                        return Err(self.rejection());
                    }
                    inner.probe_in_flight = true;
                    Admission::Probe
                }
            }
        };

        let result = op().await;

        let mut inner = self.inner.lock().await;
        match &result {
            Ok(_) => {
                if inner.state != BreakerState::Closed {
                    tracing::info!(breaker = %self.name, "probe succeeded, closing circuit");
                }
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
            }
            Err(e) => match admission {
                Admission::Probe => {
                    tracing::warn!(breaker = %self.name, err = %e, "probe failed, reopening circuit");
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.probe_in_flight = false;
                }
                Admission::Normal => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.failure_threshold {
                        tracing::warn!(
                            breaker = %self.name,
                            failures = inner.consecutive_failures,
                            "failure threshold reached, opening circuit"
                        );
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(Instant::now());
                    }
                }
            },
        }

        result
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.inner.lock().await.consecutive_failures
    }

    fn rejection(&self) -> HubError {
        HubError::service("circuit open").with_context("breaker", self.name.clone())
    }
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;
