// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-room sensor state, topic parsing, and the day-phase rule.
//! The fusion hub itself lives in [`hub`].

pub mod hub;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HubError, HubResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LightState {
    Unknown,
    Dark,
    Dim,
    Moderate,
    Bright,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayPhase {
    Night,
    Dawn,
    Day,
    Dusk,
    Transitional,
    Unknown,
}

/// The fused view of one room. Created lazily on the first message for the
/// room and kept for the process lifetime.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSensorState {
    pub room_id: String,
    /// Device that last reported for this room.
    pub device_id: String,
    pub temperature_f: f64,
    pub humidity_pct: f64,
    pub is_occupied: bool,
    pub last_motion_at: Option<DateTime<Utc>>,
    pub last_motion_clear_at: Option<DateTime<Utc>>,
    pub light_pct: f64,
    pub light_state: LightState,
    pub day_phase: DayPhase,
    pub last_seen_at: DateTime<Utc>,
    pub is_online: bool,
}

impl RoomSensorState {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            device_id: String::new(),
            temperature_f: 0.0,
            humidity_pct: 0.0,
            is_occupied: false,
            last_motion_at: None,
            last_motion_clear_at: None,
            light_pct: 0.0,
            light_state: LightState::Unknown,
            day_phase: DayPhase::Unknown,
            last_seen_at: Utc::now(),
            is_online: true,
        }
    }
}

/// Partial sensor payload; absent fields leave the room state untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SensorMessage {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub motion: Option<bool>,
    #[serde(default)]
    pub light_level: Option<f64>,
    #[serde(default)]
    pub light_percent: Option<f64>,
    #[serde(default)]
    pub light_state: Option<LightState>,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub sensor: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Temperature,
    Humidity,
    Motion,
    Light,
}

/// The four wildcard patterns the hub subscribes to.
pub const SENSOR_PATTERNS: [&str; 4] =
    ["room-temp/+", "room-hum/+", "room-motion/+", "room-light/+"];

/// Parse a `kind/room_id` sensor topic. Anything else is a validation error.
pub fn parse_sensor_topic(topic: &str) -> HubResult<(SensorKind, &str)> {
    let Some((prefix, room_id)) = topic.split_once('/') else {
        return Err(HubError::validation("sensor topic has no room segment")
            .with_context("topic", topic));
    };
    if room_id.is_empty() || room_id.contains('/') {
        return Err(HubError::validation("sensor topic must be kind/room_id")
            .with_context("topic", topic));
    }
    let kind = match prefix {
        "room-temp" => SensorKind::Temperature,
        "room-hum" => SensorKind::Humidity,
        "room-motion" => SensorKind::Motion,
        "room-light" => SensorKind::Light,
        _ => {
            return Err(HubError::validation("unknown sensor topic prefix")
                .with_context("topic", topic));
        }
    };
    Ok((kind, room_id))
}

/// Day phase from light percentage and local hour (0..23).
pub fn day_phase(light_pct: f64, hour: u32) -> DayPhase {
    if light_pct < 5.0 && (hour < 6 || hour > 22) {
        DayPhase::Night
    } else if light_pct > 70.0 && (10..=16).contains(&hour) {
        DayPhase::Day
    } else if light_pct > 30.0 && (6..10).contains(&hour) {
        DayPhase::Dawn
    } else if light_pct > 20.0 && (17..=22).contains(&hour) {
        DayPhase::Dusk
    } else {
        DayPhase::Transitional
    }
}

/// Temperature update fan-out payload.
#[derive(Debug, Clone)]
pub struct TemperatureEvent {
    pub room_id: String,
    pub device_id: String,
    pub temperature_f: f64,
    pub at: DateTime<Utc>,
}

/// Occupancy edge fan-out payload. Emitted only on state change.
#[derive(Debug, Clone)]
pub struct MotionEvent {
    pub room_id: String,
    pub device_id: String,
    pub occupied: bool,
    pub at: DateTime<Utc>,
}

/// Light-state change fan-out payload.
#[derive(Debug, Clone)]
pub struct LightEvent {
    pub room_id: String,
    pub device_id: String,
    pub light_pct: f64,
    pub light_state: LightState,
    pub day_phase: DayPhase,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
#[path = "phase_tests.rs"]
mod tests;
