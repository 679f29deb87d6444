// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Motion-activated lighting rules.
//!
//! One rule per configured room. A rule fires when the room is occupied,
//! darker than the threshold, enabled, and out of cooldown; firing turns the
//! room's light on through the device registry and publishes a rule event.
//! Turning lights off is intentionally not automated.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use crate::bus::client::MqttClient;
use crate::bus::{topics, BusMessage, Qos};
use crate::devices::{DeviceCommand, DeviceRegistry};
use crate::error::{HubError, HubResult};
use crate::fusion::hub::SensorHub;
use crate::fusion::MotionEvent;
use crate::logger::{iso8601_now, ServiceLogger};

pub const DEFAULT_ROOMS: [&str; 6] =
    ["living-room", "kitchen", "bedroom", "bathroom", "office", "hallway"];
pub const DEFAULT_DARK_THRESHOLD_PCT: f64 = 20.0;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct AutomationRule {
    pub rule_id: String,
    pub room_id: String,
    pub enabled: bool,
    pub dark_threshold_pct: f64,
    pub cooldown: Duration,
    pub last_fired_at: Option<DateTime<Utc>>,
}

impl AutomationRule {
    fn for_room(room_id: &str, dark_threshold_pct: f64) -> Self {
        Self {
            rule_id: format!("motion-light-{room_id}"),
            room_id: room_id.to_owned(),
            enabled: true,
            dark_threshold_pct,
            cooldown: DEFAULT_COOLDOWN,
            last_fired_at: None,
        }
    }

    fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.last_fired_at.is_some_and(|last| {
            let elapsed = now.signed_duration_since(last);
            elapsed.num_milliseconds() < self.cooldown.as_millis() as i64
        })
    }
}

/// Record published on `automation/{room_id}` when a rule fires.
#[derive(Debug, Clone, Serialize)]
pub struct RuleFiring {
    pub room_id: String,
    pub action: String,
    pub reason: String,
    pub timestamp: String,
    pub service: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub service: String,
    pub status: String,
    pub total_rules: usize,
    pub enabled_rules: usize,
    pub dark_threshold: f64,
}

pub struct RuleEngine {
    rules: RwLock<HashMap<String, AutomationRule>>,
    dark_threshold: RwLock<f64>,
    hub: Arc<SensorHub>,
    devices: Arc<DeviceRegistry>,
    bus: RwLock<Option<Arc<MqttClient>>>,
    logger: ServiceLogger,
}

impl RuleEngine {
    /// Install one rule per configured room.
    pub fn new(
        rooms: &[String],
        hub: Arc<SensorHub>,
        devices: Arc<DeviceRegistry>,
        logger: ServiceLogger,
    ) -> Arc<Self> {
        let rules = rooms
            .iter()
            .map(|room| {
                (room.clone(), AutomationRule::for_room(room, DEFAULT_DARK_THRESHOLD_PCT))
            })
            .collect();
        Arc::new(Self {
            rules: RwLock::new(rules),
            dark_threshold: RwLock::new(DEFAULT_DARK_THRESHOLD_PCT),
            hub,
            devices,
            bus: RwLock::new(None),
            logger,
        })
    }

    /// Attach the bus client used to publish rule firings.
    pub async fn attach_bus(&self, bus: Arc<MqttClient>) {
        *self.bus.write().await = Some(bus);
    }

    /// Register with the fusion hub as a motion and light consumer.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let engine = Arc::clone(self);
        let mut motion_rx = self.hub.subscribe_motion();
        let motion_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = motion_cancel.cancelled() => break,
                    recv = motion_rx.recv() => match recv {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            engine.hub.note_lag(n);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                if event.occupied {
                    engine.on_motion(&event).await;
                }
            }
        });

        let engine = Arc::clone(self);
        let mut light_rx = self.hub.subscribe_light();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    recv = light_rx.recv() => match recv {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            engine.hub.note_lag(n);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                tracing::debug!(
                    room = %event.room_id,
                    light_pct = event.light_pct,
                    "light state changed"
                );
            }
        });
    }

    /// Evaluate the room's rule for an occupancy event.
    pub async fn on_motion(&self, event: &MotionEvent) {
        let room_id = &event.room_id;
        let now = Utc::now();

        let threshold = {
            let rules = self.rules.read().await;
            let Some(rule) = rules.get(room_id) else {
                tracing::debug!(room = %room_id, "no rule installed for room");
                return;
            };
            if !rule.enabled {
                tracing::debug!(room = %room_id, "rule disabled");
                return;
            }
            if rule.in_cooldown(now) {
                tracing::debug!(room = %room_id, "rule in cooldown");
                return;
            }
            rule.dark_threshold_pct
        };

        let Some(room) = self.hub.room_snapshot(room_id).await else {
            return;
        };
        if !room.is_occupied {
            return;
        }
        if room.light_pct >= threshold {
            tracing::debug!(
                room = %room_id,
                light_pct = room.light_pct,
                threshold,
                "room bright enough, not firing"
            );
            return;
        }

        let Some(light) = self.devices.find_light_in_room(room_id).await else {
            self.logger
                .warn(&format!("no light device configured for room {room_id}"), None);
            return;
        };

        if let Err(e) = self.devices.execute(&DeviceCommand::new(&light.id, "turn_on")).await {
            self.logger.log_tagged_error(&HubError::wrap(
                e,
                format!("failed to turn on {} for {room_id}", light.id),
            ));
            return;
        }

        self.publish_firing(room_id).await;

        {
            let mut rules = self.rules.write().await;
            if let Some(rule) = rules.get_mut(room_id) {
                rule.last_fired_at = Some(now);
            }
        }
        self.logger.info(
            &format!("motion in dark room {room_id}, turned on {}", light.id),
            None,
        );
    }

    /// Process-wide dark threshold; also rewrites every installed rule.
    pub async fn set_dark_threshold(&self, pct: f64) {
        *self.dark_threshold.write().await = pct;
        let mut rules = self.rules.write().await;
        for rule in rules.values_mut() {
            rule.dark_threshold_pct = pct;
        }
    }

    pub async fn set_cooldown(&self, rule_id: &str, cooldown: Duration) -> HubResult<()> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .values_mut()
            .find(|r| r.rule_id == rule_id)
            .ok_or_else(|| HubError::validation("unknown rule").with_context("rule_id", rule_id))?;
        rule.cooldown = cooldown;
        Ok(())
    }

    pub async fn enable_rule(&self, rule_id: &str, enabled: bool) -> HubResult<()> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .values_mut()
            .find(|r| r.rule_id == rule_id)
            .ok_or_else(|| HubError::validation("unknown rule").with_context("rule_id", rule_id))?;
        rule.enabled = enabled;
        Ok(())
    }

    pub async fn get_rule(&self, rule_id: &str) -> Option<AutomationRule> {
        self.rules.read().await.values().find(|r| r.rule_id == rule_id).cloned()
    }

    pub async fn get_all_rules(&self) -> Vec<AutomationRule> {
        self.rules.read().await.values().cloned().collect()
    }

    pub async fn get_status(&self) -> EngineStatus {
        let rules = self.rules.read().await;
        EngineStatus {
            service: "automation".into(),
            status: "running".into(),
            total_rules: rules.len(),
            enabled_rules: rules.values().filter(|r| r.enabled).count(),
            dark_threshold: *self.dark_threshold.read().await,
        }
    }

    async fn publish_firing(&self, room_id: &str) {
        let Some(bus) = self.bus.read().await.clone() else {
            return;
        };
        let firing = RuleFiring {
            room_id: room_id.to_owned(),
            action: "lights_on".into(),
            reason: "motion_detected_dark".into(),
            timestamp: iso8601_now(),
            service: "automation".into(),
        };
        let message = match BusMessage::json(
            topics::automation(room_id),
            &firing,
            Qos::AtLeastOnce,
            false,
        ) {
            Ok(message) => message,
            Err(e) => {
                self.logger.log_tagged_error(&e);
                return;
            }
        };
        if let Err(e) = bus.publish(message).await {
            self.logger
                .log_tagged_error(&HubError::wrap(e, format!("rule event publish for {room_id} failed")));
        }
    }
}

#[cfg(test)]
#[path = "rules_tests.rs"]
mod tests;
