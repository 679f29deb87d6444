// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The sensor-fusion hub: single writer to per-room state.
//!
//! Inbound messages mutate the room map under one lock; consumers observe
//! through cloned snapshots and three typed broadcast channels. Lagging
//! subscribers drop the oldest events, never the ingest path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use crate::bus::client::{MessageHandler, MqttClient};
use crate::error::{HubError, HubResult};
use crate::fusion::{
    day_phase, parse_sensor_topic, LightEvent, MotionEvent, RoomSensorState, SensorKind,
    SensorMessage, TemperatureEvent, SENSOR_PATTERNS,
};
use crate::logger::ServiceLogger;

const EVENT_CAPACITY: usize = 256;
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const OFFLINE_AFTER_SECS: i64 = 10 * 60;
const LIGHT_NOTE_DELTA_PCT: f64 = 10.0;

pub struct SensorHub {
    rooms: RwLock<HashMap<String, RoomSensorState>>,
    temperature_tx: broadcast::Sender<TemperatureEvent>,
    motion_tx: broadcast::Sender<MotionEvent>,
    light_tx: broadcast::Sender<LightEvent>,
    calibration_offset: Option<f64>,
    logger: ServiceLogger,
    lagged_events: AtomicU64,
}

impl SensorHub {
    pub fn new(calibration_offset: Option<f64>, logger: ServiceLogger) -> Arc<Self> {
        let (temperature_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (motion_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (light_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            temperature_tx,
            motion_tx,
            light_tx,
            calibration_offset,
            logger,
            lagged_events: AtomicU64::new(0),
        })
    }

    /// Register the hub's four wildcard subscriptions on the bus client.
    pub async fn attach(self: &Arc<Self>, client: &Arc<MqttClient>) -> HubResult<()> {
        for pattern in SENSOR_PATTERNS {
            let hub = Arc::clone(self);
            let handler: MessageHandler = Arc::new(move |msg| {
                let hub = Arc::clone(&hub);
                Box::pin(async move {
                    // Malformed traffic is warned about and dropped inside
                    // handle_message; it must not tear down the subscription.
                    let _ = hub.handle_message(&msg.topic, &msg.payload).await;
                    Ok(())
                })
            });
            client.subscribe(pattern, handler).await?;
        }
        Ok(())
    }

    pub fn subscribe_temperature(&self) -> broadcast::Receiver<TemperatureEvent> {
        self.temperature_tx.subscribe()
    }

    pub fn subscribe_motion(&self) -> broadcast::Receiver<MotionEvent> {
        self.motion_tx.subscribe()
    }

    pub fn subscribe_light(&self) -> broadcast::Receiver<LightEvent> {
        self.light_tx.subscribe()
    }

    /// Ingest one sensor message. Malformed topics and payloads are dropped
    /// with a warn log and surface as validation errors.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> HubResult<()> {
        let (kind, room_id) = match parse_sensor_topic(topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.logger.warn(&format!("dropping message on malformed topic {topic}"), None);
                return Err(e);
            }
        };

        let message: SensorMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                self.logger
                    .warn(&format!("dropping undecodable payload on {topic}: {e}"), None);
                return Err(HubError::validation("sensor payload is not valid JSON")
                    .with_room(room_id)
                    .with_cause(e));
            }
        };

        match kind {
            SensorKind::Temperature => self.apply_temperature(room_id, &message).await,
            SensorKind::Humidity => self.apply_humidity(room_id, &message).await,
            SensorKind::Motion => self.apply_motion(room_id, &message).await,
            SensorKind::Light => self.apply_light(room_id, &message).await,
        }
        Ok(())
    }

    /// Clone of the current state for one room.
    pub async fn room_snapshot(&self, room_id: &str) -> Option<RoomSensorState> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Clones of all room states.
    pub async fn all_rooms(&self) -> Vec<RoomSensorState> {
        self.rooms.read().await.values().cloned().collect()
    }

    /// Events dropped because a subscriber lagged behind.
    pub fn lagged_events(&self) -> u64 {
        self.lagged_events.load(Ordering::Relaxed)
    }

    /// Record that a subscriber observed a lag of `n` events.
    pub fn note_lag(&self, n: u64) {
        self.lagged_events.fetch_add(n, Ordering::Relaxed);
    }

    /// One liveness pass: rooms silent for over ten minutes are flagged
    /// offline. Occupancy is never touched. Returns the rooms flagged.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut flagged = Vec::new();
        let mut rooms = self.rooms.write().await;
        for room in rooms.values_mut() {
            let idle = now.signed_duration_since(room.last_seen_at).num_seconds();
            if room.is_online && idle > OFFLINE_AFTER_SECS {
                room.is_online = false;
                flagged.push(room.room_id.clone());
            }
        }
        drop(rooms);
        for room_id in &flagged {
            self.logger.warn(
                &format!("room {room_id} marked offline, no sensor data for over 10 minutes"),
                None,
            );
        }
        flagged
    }

    /// Spawn the periodic liveness sweep.
    pub fn spawn_liveness_sweep(self: &Arc<Self>, cancel: CancellationToken) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(SWEEP_INTERVAL);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh start
            // does not sweep before any data arrives.
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {}
                }
                hub.sweep_once(Utc::now()).await;
            }
        });
    }

    async fn apply_temperature(&self, room_id: &str, message: &SensorMessage) {
        let now = Utc::now();
        let event = {
            let mut rooms = self.rooms.write().await;
            let room = rooms
                .entry(room_id.to_owned())
                .or_insert_with(|| RoomSensorState::new(room_id));
            if let Some(raw) = message.temperature {
                room.temperature_f = raw + self.calibration_offset.unwrap_or(0.0);
            }
            Self::touch(room, message, now);
            TemperatureEvent {
                room_id: room.room_id.clone(),
                device_id: room.device_id.clone(),
                temperature_f: room.temperature_f,
                at: now,
            }
        };
        let _ = self.temperature_tx.send(event);
    }

    async fn apply_humidity(&self, room_id: &str, message: &SensorMessage) {
        let now = Utc::now();
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(room_id.to_owned())
            .or_insert_with(|| RoomSensorState::new(room_id));
        if let Some(humidity) = message.humidity {
            room.humidity_pct = humidity;
        }
        Self::touch(room, message, now);
    }

    async fn apply_motion(&self, room_id: &str, message: &SensorMessage) {
        let now = Utc::now();
        let event = {
            let mut rooms = self.rooms.write().await;
            let room = rooms
                .entry(room_id.to_owned())
                .or_insert_with(|| RoomSensorState::new(room_id));
            let mut event = None;
            if let Some(motion) = message.motion {
                let changed = room.is_occupied != motion;
                room.is_occupied = motion;
                if motion {
                    room.last_motion_at = Some(now);
                } else {
                    room.last_motion_clear_at = Some(now);
                }
                if changed {
                    event = Some(MotionEvent {
                        room_id: room.room_id.clone(),
                        device_id: message.device_id.clone().unwrap_or_default(),
                        occupied: motion,
                        at: now,
                    });
                }
            }
            Self::touch(room, message, now);
            event
        };
        if let Some(event) = event {
            let _ = self.motion_tx.send(event);
        }
    }

    async fn apply_light(&self, room_id: &str, message: &SensorMessage) {
        let now = Utc::now();
        let hour = chrono::Local::now().hour();
        let (event, level_note) = {
            let mut rooms = self.rooms.write().await;
            let room = rooms
                .entry(room_id.to_owned())
                .or_insert_with(|| RoomSensorState::new(room_id));

            let previous_state = room.light_state;
            let previous_pct = room.light_pct;

            if let Some(pct) = message.light_percent.or(message.light_level) {
                room.light_pct = pct;
            }
            if let Some(state) = message.light_state {
                room.light_state = state;
            }
            room.day_phase = day_phase(room.light_pct, hour);
            Self::touch(room, message, now);

            let state_changed = room.light_state != previous_state;
            let moved = (room.light_pct - previous_pct).abs() > LIGHT_NOTE_DELTA_PCT;
            let event = state_changed.then(|| LightEvent {
                room_id: room.room_id.clone(),
                device_id: room.device_id.clone(),
                light_pct: room.light_pct,
                light_state: room.light_state,
                day_phase: room.day_phase,
                at: now,
            });
            let level_note = (!state_changed && moved)
                .then(|| (room.room_id.clone(), previous_pct, room.light_pct));
            (event, level_note)
        };

        if let Some((room, from, to)) = level_note {
            self.logger.info(
                &format!("light level in {room} moved {from:.0}% -> {to:.0}% without a state change"),
                None,
            );
        }
        if let Some(event) = event {
            let _ = self.light_tx.send(event);
        }
    }

    fn touch(room: &mut RoomSensorState, message: &SensorMessage, now: DateTime<Utc>) {
        if let Some(ref device_id) = message.device_id {
            room.device_id = device_id.clone();
        }
        room.last_seen_at = now;
        room.is_online = true;
    }
}

#[cfg(test)]
#[path = "hub_tests.rs"]
mod tests;
