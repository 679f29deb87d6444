// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Startup configuration: flags with env fallbacks, plus the smart-plug
//! devices JSON file.

use std::path::PathBuf;

use serde::Deserialize;

use crate::bus::client::MqttSettings;
use crate::error::{HubError, HubResult};
use crate::plug::PlugConfig;

/// Configuration for the homehub coordinator.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "homehub", about = "Room-level home-automation coordinator")]
pub struct HubConfig {
    /// MQTT broker host.
    #[arg(long, default_value = "127.0.0.1", env = "HOMEHUB_MQTT_HOST")]
    pub mqtt_host: String,

    /// MQTT broker port.
    #[arg(long, default_value_t = 1883, env = "HOMEHUB_MQTT_PORT")]
    pub mqtt_port: u16,

    /// MQTT username. If unset, the connection is unauthenticated.
    #[arg(long, env = "HOMEHUB_MQTT_USERNAME")]
    pub mqtt_username: Option<String>,

    /// MQTT password.
    #[arg(long, env = "HOMEHUB_MQTT_PASSWORD")]
    pub mqtt_password: Option<String>,

    /// MQTT client identifier.
    #[arg(long, default_value = "homehub", env = "HOMEHUB_MQTT_CLIENT_ID")]
    pub mqtt_client_id: String,

    /// Temperature calibration offset applied to every reading (degrees F).
    #[arg(long, env = "HOMEHUB_CALIBRATION_OFFSET", allow_hyphen_values = true)]
    pub calibration_offset: Option<f64>,

    /// Rooms that get a motion-lighting rule.
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "living-room,kitchen,bedroom,bathroom,office,hallway",
        env = "HOMEHUB_ROOMS"
    )]
    pub rooms: Vec<String>,

    /// Light percentage below which a room counts as dark.
    #[arg(long, default_value_t = 20.0, env = "HOMEHUB_DARK_THRESHOLD")]
    pub dark_threshold_pct: f64,

    /// Path to the smart-plug devices JSON file.
    #[arg(long, env = "HOMEHUB_DEVICES_CONFIG")]
    pub devices_config: Option<PathBuf>,

    /// Write energy readings to the time-series stream.
    #[arg(long, env = "HOMEHUB_TIMESERIES")]
    pub timeseries: bool,

    /// Participate in UDP multicast asset discovery.
    #[arg(long, env = "HOMEHUB_DISCOVERY")]
    pub discovery: bool,

    /// Log-shipping queue capacity.
    #[arg(long, default_value_t = 1000, env = "HOMEHUB_LOG_QUEUE_CAPACITY")]
    pub log_queue_capacity: usize,
}

impl HubConfig {
    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            client_id: self.mqtt_client_id.clone(),
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
        }
    }

    /// Load the configured plug list. No file configured means no plugs.
    pub fn load_devices(&self) -> HubResult<Vec<PlugConfig>> {
        let Some(ref path) = self.devices_config else {
            return Ok(Vec::new());
        };
        let contents = std::fs::read_to_string(path).map_err(|e| {
            HubError::io("failed to read devices config")
                .with_context("path", path.display().to_string())
                .with_cause(e)
        })?;
        let file: DevicesFile = serde_json::from_str(&contents).map_err(|e| {
            HubError::validation("devices config is not valid JSON")
                .with_context("path", path.display().to_string())
                .with_cause(e)
        })?;
        Ok(file.devices)
    }
}

/// On-disk shape of the devices file.
#[derive(Debug, Clone, Deserialize)]
pub struct DevicesFile {
    pub devices: Vec<PlugConfig>,
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
