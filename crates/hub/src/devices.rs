// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory device registry and command dispatch.
//!
//! The registry is the authoritative view of device status and properties;
//! property updates are serialized by the map lock. Mutations republish the
//! retained device-state topic best-effort when a bus client is attached.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::bus::client::MqttClient;
use crate::bus::{topics, BusMessage, Qos};
use crate::error::{HubError, HubResult};
use crate::logger::ServiceLogger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Light,
    Switch,
    Climate,
    Plug,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Switch => "switch",
            Self::Climate => "climate",
            Self::Plug => "plug",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub status: String,
    pub properties: HashMap<String, serde_json::Value>,
    pub room_id: Option<String>,
    pub last_updated_at: DateTime<Utc>,
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: DeviceKind,
        room_id: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            status: "unknown".into(),
            properties: HashMap::new(),
            room_id,
            last_updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceCommand {
    pub device_id: String,
    pub action: String,
    pub value: Option<serde_json::Value>,
}

impl DeviceCommand {
    pub fn new(device_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self { device_id: device_id.into(), action: action.into(), value: None }
    }

    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = Some(value);
        self
    }
}

pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
    bus: RwLock<Option<Arc<MqttClient>>>,
    logger: ServiceLogger,
}

impl DeviceRegistry {
    pub fn new(logger: ServiceLogger) -> Arc<Self> {
        Arc::new(Self {
            devices: RwLock::new(HashMap::new()),
            bus: RwLock::new(None),
            logger,
        })
    }

    /// Attach the bus client used for state republication and the climate
    /// temperature readout.
    pub async fn attach_bus(&self, bus: Arc<MqttClient>) {
        *self.bus.write().await = Some(bus);
    }

    pub async fn add(&self, device: Device) {
        self.logger.info(
            &format!("registered device {} ({})", device.id, device.kind.as_str()),
            None,
        );
        self.devices.write().await.insert(device.id.clone(), device);
    }

    pub async fn get(&self, id: &str) -> Option<Device> {
        self.devices.read().await.get(id).cloned()
    }

    pub async fn get_all(&self) -> Vec<Device> {
        self.devices.read().await.values().cloned().collect()
    }

    /// The light device assigned to `room_id`, if any.
    pub async fn find_light_in_room(&self, room_id: &str) -> Option<Device> {
        self.devices
            .read()
            .await
            .values()
            .find(|d| d.kind == DeviceKind::Light && d.room_id.as_deref() == Some(room_id))
            .cloned()
    }

    /// Shallow-merge `changes` into the device's properties.
    pub async fn update(
        &self,
        id: &str,
        changes: HashMap<String, serde_json::Value>,
    ) -> HubResult<()> {
        let snapshot = {
            let mut devices = self.devices.write().await;
            let device = devices
                .get_mut(id)
                .ok_or_else(|| HubError::validation("unknown device").with_device(id))?;
            device.properties.extend(changes);
            device.last_updated_at = Utc::now();
            device.clone()
        };
        self.logger.info(&format!("updated properties of device {id}"), None);
        self.republish_state(&snapshot).await;
        Ok(())
    }

    /// Dispatch a command by device kind. Returns the readout value for
    /// query-style actions (`get_temperature`), `None` otherwise.
    pub async fn execute(
        &self,
        command: &DeviceCommand,
    ) -> HubResult<Option<serde_json::Value>> {
        let kind = {
            let devices = self.devices.read().await;
            devices
                .get(&command.device_id)
                .map(|d| d.kind)
                .ok_or_else(|| {
                    HubError::validation("unknown device").with_device(command.device_id.clone())
                })?
        };

        let result = match kind {
            DeviceKind::Light => self.execute_light(command).await,
            DeviceKind::Switch => self.execute_switch(command).await,
            DeviceKind::Climate => self.execute_climate(command).await,
            DeviceKind::Plug => Err(HubError::validation(
                "plug devices are driven by the plug monitor, not registry commands",
            )
            .with_device(command.device_id.clone())),
        };

        if let Err(ref e) = result {
            self.logger.log_tagged_error(e);
        }
        result
    }

    async fn execute_light(
        &self,
        command: &DeviceCommand,
    ) -> HubResult<Option<serde_json::Value>> {
        match command.action.as_str() {
            "turn_on" => {
                self.set_power(&command.device_id, true).await?;
                Ok(None)
            }
            "turn_off" => {
                self.set_power(&command.device_id, false).await?;
                Ok(None)
            }
            "set_brightness" => {
                let brightness = numeric_value(command)?;
                let snapshot = self
                    .mutate(&command.device_id, |device| {
                        device
                            .properties
                            .insert("brightness".into(), serde_json::json!(brightness));
                    })
                    .await?;
                self.logger.info(
                    &format!("set brightness of {} to {brightness}", command.device_id),
                    None,
                );
                self.republish_state(&snapshot).await;
                Ok(None)
            }
            other => {
                self.logger
                    .warn(&format!("unknown light action {other} for {}", command.device_id), None);
                Ok(None)
            }
        }
    }

    async fn execute_switch(
        &self,
        command: &DeviceCommand,
    ) -> HubResult<Option<serde_json::Value>> {
        match command.action.as_str() {
            "turn_on" => {
                self.set_power(&command.device_id, true).await?;
                Ok(None)
            }
            "turn_off" => {
                self.set_power(&command.device_id, false).await?;
                Ok(None)
            }
            other => {
                self.logger.warn(
                    &format!("unknown switch action {other} for {}", command.device_id),
                    None,
                );
                Ok(None)
            }
        }
    }

    async fn execute_climate(
        &self,
        command: &DeviceCommand,
    ) -> HubResult<Option<serde_json::Value>> {
        match command.action.as_str() {
            "set_temperature" => {
                let target = numeric_value(command)?;
                let snapshot = self
                    .mutate(&command.device_id, |device| {
                        device
                            .properties
                            .insert("temperature".into(), serde_json::json!(target));
                    })
                    .await?;
                self.logger.info(
                    &format!("set temperature of {} to {target}", command.device_id),
                    None,
                );
                self.republish_state(&snapshot).await;

                // Mirror onto the thermostat control stream, best effort.
                if let Some(bus) = self.bus.read().await.clone() {
                    let payload = serde_json::json!({
                        "action": "set_target",
                        "target": target,
                        "timestamp": crate::logger::iso8601_now(),
                    });
                    if let Err(e) =
                        bus.publish_thermostat_control(&command.device_id, &payload).await
                    {
                        self.logger
                            .log_tagged_error(&HubError::wrap(e, "thermostat control publish failed"));
                    }
                }
                Ok(None)
            }
            "get_temperature" => {
                let device = self.get(&command.device_id).await.ok_or_else(|| {
                    HubError::validation("unknown device").with_device(command.device_id.clone())
                })?;
                let value = device.properties.get("temperature").cloned();
                if let Some(current) = value.clone() {
                    if let Some(bus) = self.bus.read().await.clone() {
                        let message = BusMessage::new(
                            topics::TEMP_READOUT,
                            current.to_string().into_bytes(),
                            Qos::AtLeastOnce,
                            false,
                        );
                        if let Err(e) = bus.publish(message).await {
                            self.logger.log_tagged_error(&HubError::wrap(
                                e,
                                "temperature readout publish failed",
                            ));
                        }
                    }
                }
                Ok(value)
            }
            other => {
                self.logger.warn(
                    &format!("unknown climate action {other} for {}", command.device_id),
                    None,
                );
                Ok(None)
            }
        }
    }

    async fn set_power(&self, device_id: &str, on: bool) -> HubResult<()> {
        let snapshot = self
            .mutate(device_id, |device| {
                device.status = if on { "on".into() } else { "off".into() };
                device.properties.insert("power".into(), serde_json::json!(on));
            })
            .await?;
        self.logger.info(
            &format!("turned {} device {device_id}", if on { "on" } else { "off" }),
            None,
        );
        self.republish_state(&snapshot).await;
        Ok(())
    }

    async fn mutate<F: FnOnce(&mut Device)>(&self, id: &str, apply: F) -> HubResult<Device> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(id)
            .ok_or_else(|| HubError::validation("unknown device").with_device(id))?;
        apply(device);
        device.last_updated_at = Utc::now();
        Ok(device.clone())
    }

    async fn republish_state(&self, device: &Device) {
        let Some(bus) = self.bus.read().await.clone() else {
            return;
        };
        let mut state = device.properties.clone();
        state.insert("status".into(), serde_json::json!(device.status));
        if let Err(e) = bus.publish_device_state(&device.id, &state).await {
            self.logger.log_tagged_error(&HubError::wrap(e, "device state publish failed"));
        }
    }
}

fn numeric_value(command: &DeviceCommand) -> HubResult<f64> {
    command
        .value
        .as_ref()
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| {
            HubError::validation(format!("{} requires a numeric value", command.action))
                .with_device(command.device_id.clone())
        })
}

#[cfg(test)]
#[path = "devices_tests.rs"]
mod tests;
