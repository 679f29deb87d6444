// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::error::ErrorKind;

async fn failing_call(breaker: &CircuitBreaker, calls: &Arc<AtomicU32>) -> HubResult<()> {
    let calls = Arc::clone(calls);
    breaker
        .execute(|| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(HubError::connection("refused"))
        })
        .await
}

#[tokio::test]
async fn opens_after_threshold_and_rejects_without_invoking_op() -> anyhow::Result<()> {
    let breaker = CircuitBreaker::new("test", 2, Duration::from_millis(50));
    let calls = Arc::new(AtomicU32::new(0));

    // First two calls fail and trip the breaker.
    assert!(failing_call(&breaker, &calls).await.is_err());
    assert!(failing_call(&breaker, &calls).await.is_err());
    assert_eq!(breaker.state().await, BreakerState::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Third call is rejected with "circuit open" and must not run the op.
    let result = failing_call(&breaker, &calls).await;
    let err = match result {
        Err(e) => e,
        Ok(()) => anyhow::bail!("expected rejection"),
    };
    assert_eq!(err.kind(), ErrorKind::Service);
    assert!(err.to_string().contains("circuit open"), "got: {err}");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn half_open_probe_success_closes_circuit() -> anyhow::Result<()> {
    let breaker = CircuitBreaker::new("test", 2, Duration::from_millis(50));
    let calls = Arc::new(AtomicU32::new(0));

    assert!(failing_call(&breaker, &calls).await.is_err());
    assert!(failing_call(&breaker, &calls).await.is_err());
    let rejected = failing_call(&breaker, &calls).await;
    assert!(matches!(rejected, Err(e) if e.to_string().contains("circuit open")));

    tokio::time::sleep(Duration::from_millis(60)).await;

    // Probe succeeds: circuit closes, counter zeroed.
    let probe = breaker.execute(|| async { Ok::<_, HubError>("up") }).await;
    assert_eq!(probe.ok(), Some("up"));
    assert_eq!(breaker.state().await, BreakerState::Closed);
    assert_eq!(breaker.consecutive_failures().await, 0);

    // Subsequent calls execute the op again.
    let after = breaker.execute(|| async { Ok::<_, HubError>(1) }).await;
    assert_eq!(after.ok(), Some(1));
    Ok(())
}

#[tokio::test]
async fn half_open_probe_failure_reopens() -> anyhow::Result<()> {
    let breaker = CircuitBreaker::new("test", 1, Duration::from_millis(30));
    let calls = Arc::new(AtomicU32::new(0));

    assert!(failing_call(&breaker, &calls).await.is_err());
    assert_eq!(breaker.state().await, BreakerState::Open);

    tokio::time::sleep(Duration::from_millis(40)).await;

    assert!(failing_call(&breaker, &calls).await.is_err());
    assert_eq!(breaker.state().await, BreakerState::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Still rejecting until the reset timeout elapses again.
    let rejected = failing_call(&breaker, &calls).await;
    assert!(matches!(rejected, Err(e) if e.to_string().contains("circuit open")));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn success_resets_consecutive_failures() -> anyhow::Result<()> {
    let breaker = CircuitBreaker::new("test", 3, Duration::from_millis(50));
    let calls = Arc::new(AtomicU32::new(0));

    assert!(failing_call(&breaker, &calls).await.is_err());
    assert!(failing_call(&breaker, &calls).await.is_err());
    assert_eq!(breaker.consecutive_failures().await, 2);

    let ok = breaker.execute(|| async { Ok::<_, HubError>(()) }).await;
    assert!(ok.is_ok());
    assert_eq!(breaker.consecutive_failures().await, 0);
    assert_eq!(breaker.state().await, BreakerState::Closed);
    Ok(())
}

#[tokio::test]
async fn concurrent_callers_in_open_state_all_rejected() -> anyhow::Result<()> {
    let breaker = Arc::new(CircuitBreaker::new("test", 1, Duration::from_secs(60)));
    let calls = Arc::new(AtomicU32::new(0));

    assert!(failing_call(&breaker, &calls).await.is_err());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let breaker = Arc::clone(&breaker);
        let calls = Arc::clone(&calls);
        handles.push(tokio::spawn(async move {
            breaker
                .execute(|| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, HubError>(())
                })
                .await
        }));
    }
    for handle in handles {
        let result = handle.await?;
        assert!(matches!(result, Err(e) if e.to_string().contains("circuit open")));
    }
    // Only the original failing call ever ran.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}
