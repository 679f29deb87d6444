// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-plug monitor task.
//!
//! One task per device owns that device's record outright; the manager only
//! holds a command channel and a state watch. Handshakes run under the
//! device's circuit breaker with retry; any poll failure invalidates the
//! session and drops the device back to Reconnecting.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::breaker::CircuitBreaker;
use crate::bus::client::MqttClient;
use crate::bus::{topics, BusMessage, Qos};
use crate::error::{ErrorKind, HubError, HubResult};
use crate::logger::{iso8601_now, ServiceLogger};
use crate::plug::http::PlugHttp;
use crate::plug::{
    klap, legacy, EnergyRecord, HandshakeVariant, PlugCommand, PlugConfig, PlugDeviceRecord,
    PlugSession, PlugState, UnifiedReading,
};
use crate::retry::{retry, RetryConfig};
use crate::timeseries::TimeSeriesSink;

const HANDSHAKE_BREAKER_THRESHOLD: u32 = 3;
const HANDSHAKE_BREAKER_RESET: Duration = Duration::from_secs(60);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn spawn_monitor(
    config: PlugConfig,
    http: Arc<dyn PlugHttp>,
    bus: Arc<RwLock<Option<Arc<MqttClient>>>>,
    sink: Arc<dyn TimeSeriesSink>,
    logger: ServiceLogger,
    cancel: CancellationToken,
    commands: mpsc::Receiver<PlugCommand>,
) -> watch::Receiver<PlugState> {
    let (state_tx, state_rx) = watch::channel(PlugState::New);
    tokio::spawn(async move {
        let breaker = CircuitBreaker::new(
            format!("plug-{}", config.device_id),
            HANDSHAKE_BREAKER_THRESHOLD,
            HANDSHAKE_BREAKER_RESET,
        );
        let monitor = Monitor { http, bus, sink, logger, cancel, state_tx, breaker };
        monitor.run(PlugDeviceRecord::new(config), commands).await;
    });
    state_rx
}

struct Monitor {
    http: Arc<dyn PlugHttp>,
    bus: Arc<RwLock<Option<Arc<MqttClient>>>>,
    sink: Arc<dyn TimeSeriesSink>,
    logger: ServiceLogger,
    cancel: CancellationToken,
    state_tx: watch::Sender<PlugState>,
    breaker: CircuitBreaker,
}

impl Monitor {
    async fn run(self, mut record: PlugDeviceRecord, mut commands: mpsc::Receiver<PlugCommand>) {
        let mut ticker = tokio::time::interval(record.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(&mut record, command).await,
                    None => break,
                },
                _ = ticker.tick() => self.poll_cycle(&mut record).await,
            }
        }
        self.set_state(PlugState::Stopped);
        tracing::debug!(device_id = %record.config.device_id, "plug monitor stopped");
    }

    async fn poll_cycle(&self, record: &mut PlugDeviceRecord) {
        if !record.is_connected {
            self.set_state(PlugState::Connecting);
            match self.connect(record).await {
                Ok(session) => {
                    record.session = Some(session);
                    record.is_connected = true;
                    record.consecutive_failures = 0;
                    self.set_state(PlugState::Connected);
                    self.logger
                        .info(&format!("plug {} connected", record.config.device_id), None);
                }
                Err(e) if e.kind() == ErrorKind::Service => {
                    // Breaker is open: skip the whole cycle.
                    self.logger.warn(
                        &format!(
                            "plug {} breaker open, skipping poll cycle",
                            record.config.device_id
                        ),
                        None,
                    );
                    self.set_state(PlugState::Reconnecting);
                    return;
                }
                Err(e) => {
                    record.consecutive_failures += 1;
                    self.logger.log_tagged_error(
                        &HubError::wrap(e, "plug handshake failed")
                            .with_device(record.config.device_id.clone()),
                    );
                    self.set_state(PlugState::Reconnecting);
                    return;
                }
            }
        }

        self.set_state(PlugState::Polling);
        let info = match self.query(record, "get_device_info").await {
            Ok(value) => value,
            Err(e) => return self.demote(record, e),
        };
        let energy = match self.query(record, "get_energy_usage").await {
            Ok(value) => value,
            Err(e) => return self.demote(record, e),
        };
        let reading = match UnifiedReading::from_parts(&info, &energy) {
            Ok(reading) => reading,
            Err(e) => return self.demote(record, e),
        };
        record.last_reading_at = Some(Utc::now());
        self.set_state(PlugState::Connected);

        if let Err(e) = self
            .sink
            .write_energy_reading(
                &record.config.device_id,
                &record.config.room_id,
                reading.current_power_w,
                reading.today_energy_wh,
                reading.voltage_v,
                reading.current_a,
                reading.device_on,
                Utc::now(),
            )
            .await
        {
            self.logger
                .log_tagged_error(&HubError::wrap(e, "time-series energy write failed"));
        }

        self.publish_energy(record, &reading).await;
    }

    async fn connect(&self, record: &PlugDeviceRecord) -> HubResult<PlugSession> {
        let config = &record.config;
        let retry_config = RetryConfig::default();
        self.breaker
            .execute(|| retry(&self.cancel, &retry_config, || self.handshake(config)))
            .await
    }

    async fn handshake(&self, config: &PlugConfig) -> HubResult<PlugSession> {
        let attempt = async {
            match config.handshake_variant {
                HandshakeVariant::Legacy => {
                    legacy::handshake(self.http.as_ref(), &config.username, &config.secret)
                        .await
                        .map(PlugSession::Legacy)
                }
                HandshakeVariant::Klap => {
                    klap::handshake(self.http.as_ref(), &config.username, &config.secret)
                        .await
                        .map(PlugSession::Klap)
                }
            }
        };
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, attempt).await {
            Ok(result) => result,
            Err(_) => Err(HubError::timeout("plug handshake timed out")),
        }
    }

    async fn query(
        &self,
        record: &mut PlugDeviceRecord,
        method: &str,
    ) -> HubResult<serde_json::Value> {
        match record.session.as_mut() {
            Some(PlugSession::Legacy(session)) => {
                legacy::request(self.http.as_ref(), session, method).await
            }
            Some(PlugSession::Klap(session)) => {
                klap::request(self.http.as_ref(), session, method).await
            }
            None => Err(HubError::device("no active session")),
        }
    }

    /// Invalidate the session after a poll failure and fall back to
    /// Reconnecting; the next tick re-establishes.
    fn demote(&self, record: &mut PlugDeviceRecord, error: HubError) {
        record.session = None;
        record.is_connected = false;
        record.consecutive_failures += 1;
        self.logger.log_tagged_error(
            &HubError::wrap(error, "plug poll failed")
                .with_device(record.config.device_id.clone())
                .with_room(record.config.room_id.clone()),
        );
        self.set_state(PlugState::Reconnecting);
    }

    async fn publish_energy(&self, record: &PlugDeviceRecord, reading: &UnifiedReading) {
        if !record.is_connected {
            return;
        }
        let Some(bus) = self.bus.read().await.clone() else {
            return;
        };
        let payload = EnergyRecord {
            device_id: record.config.device_id.clone(),
            device_name: record.config.name.clone(),
            room_id: record.config.room_id.clone(),
            power_w: reading.current_power_w,
            energy_wh: reading.today_energy_wh,
            is_on: reading.device_on,
            signal_strength: reading.signal_level,
            timestamp: iso8601_now(),
        };
        let message = match BusMessage::json(
            topics::plug_energy(&record.config.device_id),
            &payload,
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
            self.logger.log_tagged_error(&HubError::wrap(
                e,
                format!("energy publish for {} failed", record.config.device_id),
            ));
        }
    }

    async fn handle_command(&self, record: &mut PlugDeviceRecord, command: PlugCommand) {
        match command {
            PlugCommand::RefreshSession => {
                record.session = None;
                record.is_connected = false;
                self.set_state(PlugState::Connecting);
            }
            PlugCommand::SetState { on, reply } => {
                let _ = reply.send(self.apply_device_state(record, on).await);
            }
        }
    }

    async fn apply_device_state(&self, record: &mut PlugDeviceRecord, on: bool) -> HubResult<()> {
        if record.config.handshake_variant == HandshakeVariant::Klap {
            return Err(HubError::business("set_device_state is not implemented for klap")
                .with_device(record.config.device_id.clone()));
        }
        let Some(PlugSession::Legacy(session)) = record.session.as_ref() else {
            return Err(HubError::connection("plug is not connected")
                .with_device(record.config.device_id.clone()));
        };
        match legacy::set_device_state(self.http.as_ref(), session, on).await {
            Ok(()) => Ok(()),
            Err(e) => {
                record.session = None;
                record.is_connected = false;
                record.consecutive_failures += 1;
                self.set_state(PlugState::Reconnecting);
                Err(e)
            }
        }
    }

    fn set_state(&self, state: PlugState) {
        let _ = self.state_tx.send(state);
    }
}
