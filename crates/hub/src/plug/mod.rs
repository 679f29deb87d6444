// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Smart-plug driver: per-device monitor tasks, two authenticated handshake
//! variants, periodic polling, and energy fan-out.

pub mod http;
pub mod klap;
pub mod legacy;
pub mod monitor;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::bus::client::MqttClient;
use crate::error::{HubError, HubResult};
use crate::logger::ServiceLogger;
use crate::plug::http::PlugHttp;
use crate::timeseries::TimeSeriesSink;

/// Device authentication flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeVariant {
    Legacy,
    Klap,
}

impl Default for HandshakeVariant {
    fn default() -> Self {
        Self::Legacy
    }
}

fn default_poll_interval_secs() -> u64 {
    30
}

/// One configured plug, from the devices JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct PlugConfig {
    pub device_id: String,
    pub name: String,
    pub room_id: String,
    pub ip: String,
    pub username: String,
    pub secret: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub handshake_variant: HandshakeVariant,
}

impl PlugConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Authenticated session state, one of the two variants.
#[derive(Debug)]
pub enum PlugSession {
    Legacy(legacy::LegacySession),
    Klap(klap::KlapSession),
}

/// Monitor-task lifecycle for one plug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlugState {
    New,
    Connecting,
    Connected,
    Polling,
    Reconnecting,
    Stopped,
}

/// Mutable per-plug record, owned exclusively by the device's monitor task.
#[derive(Debug)]
pub struct PlugDeviceRecord {
    pub config: PlugConfig,
    pub session: Option<PlugSession>,
    pub is_connected: bool,
    pub last_reading_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl PlugDeviceRecord {
    pub fn new(config: PlugConfig) -> Self {
        Self {
            config,
            session: None,
            is_connected: false,
            last_reading_at: None,
            consecutive_failures: 0,
        }
    }
}

/// The reading both handshake variants produce. Power is converted from
/// device-reported milliwatts to watts at this boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedReading {
    pub device_on: bool,
    pub signal_level: i64,
    pub current_power_w: f64,
    pub today_energy_wh: f64,
    pub voltage_v: f64,
    pub current_a: f64,
}

impl UnifiedReading {
    /// Combine `get_device_info` and `get_energy_usage` results.
    pub fn from_parts(
        info: &serde_json::Value,
        energy: &serde_json::Value,
    ) -> HubResult<Self> {
        let device_on = info
            .get("device_on")
            .and_then(serde_json::Value::as_bool)
            .ok_or_else(|| HubError::device("malformed device info, missing device_on"))?;
        let current_power_mw = energy
            .get("current_power")
            .and_then(serde_json::Value::as_f64)
            .ok_or_else(|| HubError::device("malformed energy usage, missing current_power"))?;
        Ok(Self {
            device_on,
            signal_level: info.get("signal_level").and_then(serde_json::Value::as_i64).unwrap_or(0),
            current_power_w: (current_power_mw / 1000.0).max(0.0),
            today_energy_wh: energy
                .get("today_energy")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0)
                .max(0.0),
            voltage_v: energy
                .get("voltage_mv")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0)
                / 1000.0,
            current_a: energy
                .get("current_ma")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0)
                / 1000.0,
        })
    }
}

/// Payload published on `tapo/{device_id}/energy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnergyRecord {
    pub device_id: String,
    pub device_name: String,
    pub room_id: String,
    pub power_w: f64,
    pub energy_wh: f64,
    pub is_on: bool,
    pub signal_strength: i64,
    pub timestamp: String,
}

/// Unwrap the device's `{"error_code": n, "result": {...}}` envelope.
///
/// Code 1003 covers bad requests, unknown methods, and bad credentials
/// alike; it is always surfaced as a non-retryable auth error requiring
/// operator action. Code 9999 signals a rejected session.
pub(crate) fn unwrap_envelope(value: serde_json::Value) -> HubResult<serde_json::Value> {
    let code = value
        .get("error_code")
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| HubError::device("plug response missing error_code"))?;
    match code {
        0 => Ok(value.get("result").cloned().unwrap_or(serde_json::Value::Null)),
        1003 => Err(HubError::auth("plug rejected the request (code 1003)")
            .with_context("error_code", "1003")),
        9999 => Err(HubError::device("plug session rejected (code 9999)")
            .with_context("error_code", "9999")),
        other => Err(HubError::device("plug returned an error")
            .with_context("error_code", other.to_string())),
    }
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

pub(crate) fn hex_decode(hex: &str) -> HubResult<Vec<u8>> {
    if !hex.is_ascii() || hex.len() % 2 != 0 {
        return Err(HubError::validation("malformed hex string"));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| HubError::validation("malformed hex string"))
        })
        .collect()
}

/// Control and lifecycle commands delivered to a plug's monitor task.
pub(crate) enum PlugCommand {
    SetState { on: bool, reply: oneshot::Sender<HubResult<()>> },
    RefreshSession,
}

struct PlugHandle {
    cancel: CancellationToken,
    commands: mpsc::Sender<PlugCommand>,
    state_rx: watch::Receiver<PlugState>,
}

/// Factory producing a transport for a configured plug. Swapped for an
/// in-process double in tests.
pub type PlugHttpFactory = Arc<dyn Fn(&PlugConfig) -> Arc<dyn PlugHttp> + Send + Sync>;

pub struct PlugManager {
    plugs: RwLock<HashMap<String, PlugHandle>>,
    http_factory: PlugHttpFactory,
    bus: Arc<RwLock<Option<Arc<MqttClient>>>>,
    sink: Arc<dyn TimeSeriesSink>,
    logger: ServiceLogger,
    cancel: CancellationToken,
}

impl PlugManager {
    pub fn new(
        sink: Arc<dyn TimeSeriesSink>,
        logger: ServiceLogger,
        http_factory: PlugHttpFactory,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            plugs: RwLock::new(HashMap::new()),
            http_factory,
            bus: Arc::new(RwLock::new(None)),
            sink,
            logger,
            cancel,
        })
    }

    /// Default factory speaking HTTP to the configured plug address.
    pub fn reqwest_factory() -> PlugHttpFactory {
        Arc::new(|config: &PlugConfig| {
            Arc::new(http::ReqwestPlugHttp::new(&config.ip)) as Arc<dyn PlugHttp>
        })
    }

    /// Attach the bus client used for energy fan-out.
    pub async fn attach_bus(&self, bus: Arc<MqttClient>) {
        *self.bus.write().await = Some(bus);
    }

    /// Register a plug and spawn its monitor task. Adding an id that is
    /// already registered only refreshes that device's session.
    pub async fn add_device(&self, config: PlugConfig) {
        let refresh = {
            let plugs = self.plugs.read().await;
            plugs.get(&config.device_id).map(|existing| existing.commands.clone())
        };
        if let Some(commands) = refresh {
            self.logger.info(
                &format!("plug {} already registered, refreshing session", config.device_id),
                None,
            );
            let _ = commands.send(PlugCommand::RefreshSession).await;
            return;
        }

        let mut plugs = self.plugs.write().await;

        let http = (self.http_factory)(&config);
        let cancel = self.cancel.child_token();
        let (command_tx, command_rx) = mpsc::channel(8);
        let state_rx = monitor::spawn_monitor(
            config.clone(),
            http,
            Arc::clone(&self.bus),
            Arc::clone(&self.sink),
            self.logger.clone(),
            cancel.clone(),
            command_rx,
        );
        self.logger.info(
            &format!("monitoring plug {} at {}", config.device_id, config.ip),
            None,
        );
        plugs.insert(config.device_id.clone(), PlugHandle { cancel, commands: command_tx, state_rx });
    }

    /// Stop and forget one plug.
    pub async fn remove_device(&self, device_id: &str) -> HubResult<()> {
        let handle = self
            .plugs
            .write()
            .await
            .remove(device_id)
            .ok_or_else(|| HubError::validation("unknown plug").with_device(device_id))?;
        handle.cancel.cancel();
        self.logger.info(&format!("stopped monitoring plug {device_id}"), None);
        Ok(())
    }

    /// Turn a plug on or off. Supported only for the legacy handshake.
    pub async fn set_device_state(&self, device_id: &str, on: bool) -> HubResult<()> {
        let commands = {
            let plugs = self.plugs.read().await;
            let handle = plugs
                .get(device_id)
                .ok_or_else(|| HubError::validation("unknown plug").with_device(device_id))?;
            handle.commands.clone()
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(PlugCommand::SetState { on, reply: reply_tx })
            .await
            .map_err(|_| HubError::device("plug monitor is gone").with_device(device_id))?;
        reply_rx
            .await
            .map_err(|_| HubError::device("plug monitor dropped the request").with_device(device_id))?
    }

    /// Current monitor state for a plug.
    pub async fn device_state(&self, device_id: &str) -> Option<PlugState> {
        let plugs = self.plugs.read().await;
        plugs.get(device_id).map(|h| *h.state_rx.borrow())
    }

    pub async fn device_ids(&self) -> Vec<String> {
        self.plugs.read().await.keys().cloned().collect()
    }

    /// Stop every monitor task. Idempotent.
    pub async fn stop(&self) {
        let mut plugs = self.plugs.write().await;
        for (device_id, handle) in plugs.drain() {
            handle.cancel.cancel();
            tracing::debug!(device_id, "plug monitor cancelled");
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
