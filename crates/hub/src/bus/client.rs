// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection state machine over a [`BusTransport`].
//!
//! The client validates and breaker-wraps subscribe/publish, routes inbound
//! messages to per-subscription workers (serial delivery per subscription,
//! bounded queue with drop-oldest), and runs a reconnection watchdog that
//! wakes every 10 seconds or when nudged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, Mutex, Notify, RwLock};
use tokio_util::sync::CancellationToken;

use crate::breaker::CircuitBreaker;
use crate::bus::{topic_matches, topics, BusMessage, BusTransport, Qos, TransportEvent};
use crate::error::{HubError, HubResult};
use crate::logger::ServiceLogger;
use crate::retry::{retry, RetryConfig};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);
const DISPATCH_CAPACITY: usize = 64;
const BUS_BREAKER_THRESHOLD: u32 = 5;
const BUS_BREAKER_RESET: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Broker endpoint and identity.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Subscription callback. Invoked serially per subscription; an error is
/// logged and does not tear the subscription down.
pub type MessageHandler =
    Arc<dyn Fn(BusMessage) -> BoxFuture<'static, HubResult<()>> + Send + Sync>;

struct Subscription {
    pattern: String,
    qos: Qos,
    dispatch_tx: broadcast::Sender<BusMessage>,
}

pub struct MqttClient {
    settings: MqttSettings,
    transport: Arc<dyn BusTransport>,
    state: RwLock<ConnectionState>,
    subscriptions: RwLock<Vec<Subscription>>,
    breaker: CircuitBreaker,
    logger: ServiceLogger,
    nudge: Notify,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    tasks: Mutex<Option<CancellationToken>>,
    background_started: AtomicBool,
    dropped_dispatch: Arc<AtomicU64>,
}

impl MqttClient {
    /// `events` is the receiving end of the channel the transport pushes
    /// [`TransportEvent`]s into.
    pub fn new(
        settings: MqttSettings,
        transport: Arc<dyn BusTransport>,
        events: mpsc::Receiver<TransportEvent>,
        logger: ServiceLogger,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            transport,
            state: RwLock::new(ConnectionState::Disconnected),
            subscriptions: RwLock::new(Vec::new()),
            breaker: CircuitBreaker::new("mqtt", BUS_BREAKER_THRESHOLD, BUS_BREAKER_RESET),
            logger,
            nudge: Notify::new(),
            events: Mutex::new(Some(events)),
            tasks: Mutex::new(None),
            background_started: AtomicBool::new(false),
            dropped_dispatch: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Validate the configured endpoint and establish the connection with
    /// retry. Spawns the router and reconnection watchdog on first success.
    pub async fn connect(self: &Arc<Self>) -> HubResult<()> {
        if self.settings.host.trim().is_empty() {
            return Err(HubError::validation("mqtt broker host is empty"));
        }
        if self.settings.port == 0 {
            return Err(HubError::validation("mqtt broker port is zero"));
        }

        {
            let mut state = self.state.write().await;
            if *state == ConnectionState::Connected {
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }

        let cancel = {
            let mut tasks = self.tasks.lock().await;
            tasks.get_or_insert_with(CancellationToken::new).clone()
        };

        match retry(&cancel, &RetryConfig::default(), || self.connect_once()).await {
            Ok(()) => {
                *self.state.write().await = ConnectionState::Connected;
                self.spawn_background(cancel);
                self.logger.info("mqtt connected", None);
                Ok(())
            }
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                Err(HubError::wrap(e, "mqtt connect failed"))
            }
        }
    }

    /// Cancel background tasks and drop the link. Idempotent.
    pub async fn disconnect(&self) -> HubResult<()> {
        if let Some(token) = self.tasks.lock().await.take() {
            token.cancel();
        }
        let _ = self.transport.disconnect().await;
        let mut state = self.state.write().await;
        if *state != ConnectionState::Disconnected {
            *state = ConnectionState::Disconnected;
            self.logger.info("mqtt disconnected", None);
        }
        Ok(())
    }

    /// Subscribe `handler` to `topic` (QoS 1). Requires a connected client.
    pub async fn subscribe(&self, topic: &str, handler: MessageHandler) -> HubResult<()> {
        if topic.trim().is_empty() {
            return Err(HubError::validation("subscribe topic is empty"));
        }
        if !self.is_connected().await {
            return Err(HubError::connection("not connected").with_context("topic", topic));
        }

        let qos = Qos::AtLeastOnce;
        self.breaker.execute(|| self.transport.subscribe(topic, qos)).await?;

        let (dispatch_tx, mut dispatch_rx) = broadcast::channel::<BusMessage>(DISPATCH_CAPACITY);
        let logger = self.logger.clone();
        let dropped = Arc::clone(&self.dropped_dispatch);
        let pattern = topic.to_owned();
        let cancel = self.tasks.lock().await.clone().unwrap_or_default();

        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => break,
                    recv = dispatch_rx.recv() => match recv {
                        Ok(msg) => msg,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            dropped.fetch_add(n, Ordering::Relaxed);
                            logger.warn(
                                &format!("dispatch queue for {pattern} lagged, dropped {n} messages"),
                                None,
                            );
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                if let Err(e) = handler(msg).await {
                    logger.log_tagged_error(&HubError::wrap(
                        e,
                        format!("subscription handler for {pattern} failed"),
                    ));
                }
            }
        });

        self.subscriptions.write().await.push(Subscription {
            pattern: topic.to_owned(),
            qos,
            dispatch_tx,
        });
        Ok(())
    }

    /// Publish a message. Requires a connected client.
    pub async fn publish(&self, message: BusMessage) -> HubResult<()> {
        if message.topic.trim().is_empty() {
            return Err(HubError::validation("publish topic is empty"));
        }
        if !self.is_connected().await {
            return Err(
                HubError::connection("not connected").with_context("topic", message.topic)
            );
        }
        self.breaker.execute(|| self.transport.publish(message)).await
    }

    /// Publish the retained per-device state map.
    pub async fn publish_device_state(
        &self,
        device_id: &str,
        state: &HashMap<String, serde_json::Value>,
    ) -> HubResult<()> {
        let msg = BusMessage::json(topics::device_state(device_id), state, Qos::AtLeastOnce, true)?;
        self.publish(msg).await
    }

    /// Publish a per-sensor reading map.
    pub async fn publish_sensor_reading(
        &self,
        sensor_id: &str,
        reading: &HashMap<String, serde_json::Value>,
    ) -> HubResult<()> {
        let msg =
            BusMessage::json(topics::sensor_reading(sensor_id), reading, Qos::AtLeastOnce, false)?;
        self.publish(msg).await
    }

    /// Publish a thermostat control record.
    pub async fn publish_thermostat_control(
        &self,
        thermostat_id: &str,
        payload: &serde_json::Value,
    ) -> HubResult<()> {
        let msg = BusMessage::json(
            topics::thermostat_control(thermostat_id),
            payload,
            Qos::AtLeastOnce,
            false,
        )?;
        self.publish(msg).await
    }

    /// Nudge the watchdog. Non-blocking and idempotent.
    pub fn trigger_reconnect(&self) {
        self.nudge.notify_one();
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    /// Messages dropped across all subscription dispatch queues.
    pub fn dropped_dispatch(&self) -> u64 {
        self.dropped_dispatch.load(Ordering::Relaxed)
    }

    async fn connect_once(&self) -> HubResult<()> {
        match tokio::time::timeout(CONNECT_TIMEOUT, self.transport.connect()).await {
            Ok(result) => result,
            Err(_) => Err(HubError::timeout("broker connect timed out")),
        }
    }

    fn spawn_background(self: &Arc<Self>, cancel: CancellationToken) {
        if self.background_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let router = Arc::clone(self);
        let router_cancel = cancel.clone();
        tokio::spawn(async move {
            let events = router.events.lock().await.take();
            let Some(rx) = events else {
                return;
            };
            router.router_loop(rx, router_cancel).await;
        });

        let watchdog = Arc::clone(self);
        tokio::spawn(async move {
            watchdog.watchdog_loop(cancel).await;
        });
    }

    async fn router_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = rx.recv() => match maybe {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                TransportEvent::Connected => {
                    *self.state.write().await = ConnectionState::Connected;
                    // The broker may have lost our session; re-issue every
                    // subscription on each (re)connect.
                    let patterns: Vec<(String, Qos)> = {
                        let subs = self.subscriptions.read().await;
                        subs.iter().map(|s| (s.pattern.clone(), s.qos)).collect()
                    };
                    for (pattern, qos) in patterns {
                        if let Err(e) = self.transport.subscribe(&pattern, qos).await {
                            self.logger.log_tagged_error(&HubError::wrap(
                                e,
                                format!("re-subscribe {pattern} failed"),
                            ));
                        }
                    }
                }
                TransportEvent::Disconnected { reason } => {
                    let mut state = self.state.write().await;
                    if *state == ConnectionState::Connected {
                        *state = ConnectionState::Reconnecting;
                        drop(state);
                        self.logger.warn(&format!("broker connection lost: {reason}"), None);
                        self.nudge.notify_one();
                    }
                }
                TransportEvent::Message(msg) => {
                    let subs = self.subscriptions.read().await;
                    for sub in subs.iter() {
                        if topic_matches(&sub.pattern, &msg.topic) {
                            // No receiver means the worker is gone; nothing to do.
                            let _ = sub.dispatch_tx.send(msg.clone());
                        }
                    }
                }
            }
        }
    }

    async fn watchdog_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(WATCHDOG_INTERVAL) => {}
                _ = self.nudge.notified() => {}
            }

            let current = *self.state.read().await;
            if current == ConnectionState::Connected || current == ConnectionState::Connecting {
                continue;
            }

            *self.state.write().await = ConnectionState::Reconnecting;
            self.logger.warn("mqtt not connected, attempting reconnect", None);
            match retry(&cancel, &RetryConfig::default(), || self.connect_once()).await {
                Ok(()) => {
                    *self.state.write().await = ConnectionState::Connected;
                    self.logger.info("mqtt reconnected", None);
                }
                Err(e) => {
                    self.logger.log_tagged_error(&HubError::wrap(e, "mqtt reconnect failed"));
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
