// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! rumqttc-backed [`BusTransport`].
//!
//! Each `connect` tears down any previous link, builds a fresh client with a
//! retained last-will on the coordinator status topic, and spawns a driver
//! task that forwards broker traffic as [`TransportEvent`]s. The driver ends
//! on the first connection error; reconnection policy belongs to the client
//! state machine, not the transport.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::bus::client::MqttSettings;
use crate::bus::{topics, BusMessage, BusTransport, Qos, TransportEvent};
use crate::error::{HubError, HubResult};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const EVENT_LOOP_CAPACITY: usize = 64;

struct ActiveLink {
    client: AsyncClient,
    cancel: CancellationToken,
}

pub struct MqttTransport {
    settings: MqttSettings,
    events: mpsc::Sender<TransportEvent>,
    active: Mutex<Option<ActiveLink>>,
}

impl MqttTransport {
    pub fn new(settings: MqttSettings, events: mpsc::Sender<TransportEvent>) -> Self {
        Self { settings, events, active: Mutex::new(None) }
    }

    fn options(&self) -> MqttOptions {
        let mut options =
            MqttOptions::new(&self.settings.client_id, &self.settings.host, self.settings.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_last_will(LastWill::new(
            topics::COORDINATOR_STATUS,
            &b"offline"[..],
            QoS::AtLeastOnce,
            true,
        ));
        if let (Some(user), Some(pass)) = (&self.settings.username, &self.settings.password) {
            options.set_credentials(user.clone(), pass.clone());
        }
        options
    }
}

#[async_trait]
impl BusTransport for MqttTransport {
    async fn connect(&self) -> HubResult<()> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            previous.cancel.cancel();
            let _ = previous.client.disconnect().await;
        }

        let (client, mut event_loop) = AsyncClient::new(self.options(), EVENT_LOOP_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel::<HubResult<()>>();
        let cancel = CancellationToken::new();

        let driver_cancel = cancel.clone();
        let events = self.events.clone();
        let status_client = client.clone();
        tokio::spawn(async move {
            let mut ready = Some(ready_tx);
            loop {
                let polled = tokio::select! {
                    _ = driver_cancel.cancelled() => break,
                    polled = event_loop.poll() => polled,
                };

                match polled {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(Ok(()));
                        }
                        let _ = events.send(TransportEvent::Connected).await;
                        // Retained online announcement; the LWT flips it back.
                        let _ = status_client
                            .publish(
                                topics::COORDINATOR_STATUS,
                                QoS::AtLeastOnce,
                                true,
                                &b"online"[..],
                            )
                            .await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = BusMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                            qos: from_mqtt_qos(publish.qos),
                            retain: publish.retain,
                        };
                        let _ = events.send(TransportEvent::Message(message)).await;
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        let _ = events
                            .send(TransportEvent::Disconnected {
                                reason: "broker disconnect".into(),
                            })
                            .await;
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(Err(HubError::connection(
                                "broker connection failed",
                            )
                            .with_cause(e)));
                        } else {
                            let _ = events
                                .send(TransportEvent::Disconnected { reason: e.to_string() })
                                .await;
                        }
                        break;
                    }
                }
            }
        });

        *active = Some(ActiveLink { client, cancel });
        drop(active);

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(HubError::connection("mqtt driver exited before acknowledging")),
        }
    }

    async fn disconnect(&self) -> HubResult<()> {
        let Some(link) = self.active.lock().await.take() else {
            return Ok(());
        };
        // Best-effort graceful offline announcement before dropping the link.
        let _ = link
            .client
            .publish(topics::COORDINATOR_STATUS, QoS::AtLeastOnce, true, &b"offline"[..])
            .await;
        let _ = link.client.disconnect().await;
        link.cancel.cancel();
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, qos: Qos) -> HubResult<()> {
        let active = self.active.lock().await;
        let Some(link) = active.as_ref() else {
            return Err(HubError::connection("no active mqtt link"));
        };
        link.client
            .subscribe(pattern, to_mqtt_qos(qos))
            .await
            .map_err(|e| HubError::connection("subscribe failed").with_cause(e))
    }

    async fn publish(&self, message: BusMessage) -> HubResult<()> {
        let active = self.active.lock().await;
        let Some(link) = active.as_ref() else {
            return Err(HubError::connection("no active mqtt link"));
        };
        link.client
            .publish(
                message.topic,
                to_mqtt_qos(message.qos),
                message.retain,
                message.payload,
            )
            .await
            .map_err(|e| HubError::connection("publish failed").with_cause(e))
    }
}

fn to_mqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn from_mqtt_qos(qos: QoS) -> Qos {
    match qos {
        QoS::AtMostOnce => Qos::AtMostOnce,
        QoS::AtLeastOnce => Qos::AtLeastOnce,
        QoS::ExactlyOnce => Qos::ExactlyOnce,
    }
}
