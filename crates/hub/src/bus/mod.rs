// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pub/sub plumbing: message types, the transport contract, and topic
//! matching. The connection state machine lives in [`client`]; the rumqttc
//! transport in [`mqtt`].

pub mod client;
pub mod mqtt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};

/// Quality of service for published and subscribed messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// One pub/sub message.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>, qos: Qos, retain: bool) -> Self {
        Self { topic: topic.into(), payload, qos, retain }
    }

    /// Build a message with a JSON-encoded payload.
    pub fn json<T: Serialize>(
        topic: impl Into<String>,
        value: &T,
        qos: Qos,
        retain: bool,
    ) -> HubResult<Self> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| HubError::validation("payload not serializable").with_cause(e))?;
        Ok(Self::new(topic, payload, qos, retain))
    }
}

/// Connection lifecycle and inbound traffic surfaced by a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// The broker acknowledged the connection (initial or re-established).
    Connected,
    /// The link dropped; the state machine decides what to do next.
    Disconnected { reason: String },
    /// An inbound message on a subscribed topic.
    Message(BusMessage),
}

/// Minimal transport contract so the connection state machine can be driven
/// by a real broker or an in-process test double. Implementations push
/// [`TransportEvent`]s into the channel handed to them at construction.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Establish the link. Resolves once the broker has acknowledged.
    async fn connect(&self) -> HubResult<()>;

    /// Tear the link down. Idempotent.
    async fn disconnect(&self) -> HubResult<()>;

    async fn subscribe(&self, pattern: &str, qos: Qos) -> HubResult<()>;

    async fn publish(&self, message: BusMessage) -> HubResult<()>;
}

/// Match `topic` against `pattern` with single-level `+` wildcards and an
/// optional trailing multi-level `#`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_segments = pattern.split('/').peekable();
    let mut topic_segments = topic.split('/');

    loop {
        match (pattern_segments.next(), topic_segments.next()) {
            (None, None) => return true,
            (Some("#"), _) => return pattern_segments.peek().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            _ => return false,
        }
    }
}

/// Outbound topic templates.
pub mod topics {
    /// Retained per-device state map.
    pub fn device_state(device_id: &str) -> String {
        format!("homeautomation/devices/{device_id}/state")
    }

    /// Per-sensor reading map.
    pub fn sensor_reading(sensor_id: &str) -> String {
        format!("homeautomation/sensors/{sensor_id}/reading")
    }

    /// Automation rule events for a room.
    pub fn automation(room_id: &str) -> String {
        format!("automation/{room_id}")
    }

    /// Unified smart-plug energy readings.
    pub fn plug_energy(device_id: &str) -> String {
        format!("tapo/{device_id}/energy")
    }

    /// Thermostat control stream.
    pub fn thermostat_control(thermostat_id: &str) -> String {
        format!("thermostat/{thermostat_id}/control")
    }

    /// Coordinator online/offline announcements (retained, also the LWT).
    pub const COORDINATOR_STATUS: &str = "status/homehub";

    /// Shipped warn-and-above log records.
    pub const LOGS: &str = "homeautomation/logs";

    /// Scalar temperature readout requested through a climate device.
    pub const TEMP_READOUT: &str = "temp";
}

#[cfg(test)]
#[path = "topic_tests.rs"]
mod tests;
