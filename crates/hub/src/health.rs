// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Named liveness probes with an aggregated snapshot.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::RwLock;

use crate::error::{HubError, HubResult};

/// A registered probe. Returns `Ok(())` when the checked subsystem is healthy.
pub type HealthCheck = Box<dyn Fn() -> BoxFuture<'static, HubResult<()>> + Send + Sync>;

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct HealthRegistry {
    checks: RwLock<HashMap<String, HealthCheck>>,
    probe_timeout: Duration,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::with_probe_timeout(DEFAULT_PROBE_TIMEOUT)
    }

    pub fn with_probe_timeout(probe_timeout: Duration) -> Self {
        Self { checks: RwLock::new(HashMap::new()), probe_timeout }
    }

    /// Register (or replace) a named probe.
    pub async fn register(&self, name: impl Into<String>, check: HealthCheck) {
        self.checks.write().await.insert(name.into(), check);
    }

    /// Run all probes concurrently, each bounded by the per-probe timeout.
    /// Returns `name -> None` for healthy probes and `name -> Some(err)`
    /// otherwise. Results are not cached.
    pub async fn snapshot(&self) -> HashMap<String, Option<HubError>> {
        let pending: Vec<(String, BoxFuture<'static, HubResult<()>>)> = {
            let checks = self.checks.read().await;
            checks.iter().map(|(name, check)| (name.clone(), check())).collect()
        };

        let timeout = self.probe_timeout;
        let probes = pending.into_iter().map(|(name, fut)| async move {
            let outcome = match tokio::time::timeout(timeout, fut).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(_) => Some(
                    HubError::timeout("health probe timed out")
                        .with_context("probe", name.clone()),
                ),
            };
            (name, outcome)
        });

        futures_util::future::join_all(probes).await.into_iter().collect()
    }

    /// True when every registered probe currently passes.
    pub async fn is_healthy(&self) -> bool {
        self.snapshot().await.values().all(Option::is_none)
    }
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;
