// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test doubles for the end-to-end scenario specs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use homehub::bus::client::{MqttClient, MqttSettings};
use homehub::bus::{BusMessage, BusTransport, Qos, TransportEvent};
use homehub::error::HubResult;
use homehub::logger::ServiceLogger;

/// In-process bus transport: records publishes, lets tests inject traffic.
pub struct MockBus {
    events: mpsc::Sender<TransportEvent>,
    pub published: Mutex<Vec<BusMessage>>,
    pub subscribed: Mutex<Vec<String>>,
}

impl MockBus {
    pub fn new(events: mpsc::Sender<TransportEvent>) -> Arc<Self> {
        Arc::new(Self {
            events,
            published: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
        })
    }

    /// Deliver an inbound message as if the broker pushed it.
    pub async fn inject(&self, topic: &str, payload: serde_json::Value) {
        let message =
            BusMessage::new(topic, payload.to_string().into_bytes(), Qos::AtLeastOnce, false);
        let _ = self.events.send(TransportEvent::Message(message)).await;
    }

    /// Messages published on topics starting with `prefix`.
    pub async fn published_on(&self, prefix: &str) -> Vec<BusMessage> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|m| m.topic.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BusTransport for MockBus {
    async fn connect(&self) -> HubResult<()> {
        let _ = self.events.send(TransportEvent::Connected).await;
        Ok(())
    }

    async fn disconnect(&self) -> HubResult<()> {
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, _qos: Qos) -> HubResult<()> {
        self.subscribed.lock().await.push(pattern.to_owned());
        Ok(())
    }

    async fn publish(&self, message: BusMessage) -> HubResult<()> {
        self.published.lock().await.push(message);
        Ok(())
    }
}

/// A connected bus client over a fresh mock transport.
pub async fn connected_client() -> anyhow::Result<(Arc<MqttClient>, Arc<MockBus>)> {
    let (event_tx, event_rx) = mpsc::channel(256);
    let transport = MockBus::new(event_tx);
    let client = MqttClient::new(
        MqttSettings {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "homehub-spec".into(),
            username: None,
            password: None,
        },
        Arc::clone(&transport) as Arc<dyn BusTransport>,
        event_rx,
        ServiceLogger::new("mqtt"),
    );
    client.connect().await.map_err(|e| anyhow::anyhow!("connect failed: {e}"))?;
    Ok((client, transport))
}

/// Poll `condition` for up to two seconds.
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition().await
}
