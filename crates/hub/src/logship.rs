// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded log-shipping queue feeding an external sink.
//!
//! A single worker task drains the channel, publishing each record through a
//! circuit breaker with retry. Overflow falls back to one direct best-effort
//! publish; records that still cannot be delivered are dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::breaker::CircuitBreaker;
use crate::error::HubResult;
use crate::logger::LogRecord;
use crate::retry::{retry, RetryConfig};

/// External log sink (collaborator). Failures loop back through the
/// shipper's overflow policy.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn publish_log(&self, record: &LogRecord) -> HubResult<()>;
}

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

const SHIP_BREAKER_THRESHOLD: u32 = 5;
const SHIP_BREAKER_RESET: Duration = Duration::from_secs(30);

/// Cheap cloneable producer side of the shipping queue.
#[derive(Clone)]
pub struct ShipperHandle {
    tx: mpsc::Sender<LogRecord>,
    sink: Arc<dyn LogSink>,
    dropped: Arc<AtomicU64>,
}

impl ShipperHandle {
    /// Non-blocking enqueue. When the channel is full, one direct publish is
    /// attempted; a record that still cannot be delivered is dropped.
    pub fn enqueue(&self, record: LogRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                let sink = Arc::clone(&self.sink);
                let dropped = Arc::clone(&self.dropped);
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            if let Err(e) = sink.publish_log(&record).await {
                                dropped.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(err = %e, "log queue full, record dropped");
                            }
                        });
                    }
                    Err(_) => {
                        dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Total records dropped because neither the queue nor a direct publish
    /// could take them.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Spawn the shipping worker and return the producer handle.
///
/// The worker exits when `cancel` fires or all handles are dropped, draining
/// remaining records with best-effort direct publishes on the way out.
pub fn spawn_shipper(
    sink: Arc<dyn LogSink>,
    capacity: usize,
    cancel: CancellationToken,
) -> ShipperHandle {
    let (tx, mut rx) = mpsc::channel::<LogRecord>(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));

    let handle = ShipperHandle {
        tx,
        sink: Arc::clone(&sink),
        dropped: Arc::clone(&dropped),
    };

    tokio::spawn(async move {
        let breaker =
            CircuitBreaker::new("log-shipper", SHIP_BREAKER_THRESHOLD, SHIP_BREAKER_RESET);
        let retry_config = RetryConfig::quick();

        loop {
            let record = tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = rx.recv() => match maybe {
                    Some(record) => record,
                    None => break,
                },
            };

            let result = breaker
                .execute(|| retry(&cancel, &retry_config, || sink.publish_log(&record)))
                .await;
            if let Err(e) = result {
                dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(err = %e, "failed to ship log record");
            }
        }

        // Best-effort drain on shutdown.
        rx.close();
        while let Ok(record) = rx.try_recv() {
            if sink.publish_log(&record).await.is_err() {
                dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        tracing::debug!("log shipper stopped");
    });

    handle
}

/// Ships records over the pub/sub bus on `homeautomation/logs`.
pub struct BusLogSink {
    bus: Arc<crate::bus::client::MqttClient>,
}

impl BusLogSink {
    pub fn new(bus: Arc<crate::bus::client::MqttClient>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl LogSink for BusLogSink {
    async fn publish_log(&self, record: &LogRecord) -> HubResult<()> {
        let message = crate::bus::BusMessage::json(
            crate::bus::topics::LOGS,
            record,
            crate::bus::Qos::AtLeastOnce,
            false,
        )?;
        self.bus.publish(message).await
    }
}

#[cfg(test)]
#[path = "logship_tests.rs"]
mod tests;
