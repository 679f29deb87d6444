// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! homehub: room-level home-automation coordinator.
//!
//! Sensor telemetry comes in over MQTT, fuses into per-room state, drives
//! motion-activated lighting rules, and smart plugs are polled over an
//! authenticated HTTP RPC with their energy readings fanned back out.

pub mod breaker;
pub mod bus;
pub mod config;
pub mod devices;
pub mod discovery;
pub mod error;
pub mod fusion;
pub mod health;
pub mod logger;
pub mod logship;
pub mod plug;
pub mod retry;
pub mod rules;
pub mod timeseries;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::client::MqttClient;
use crate::bus::mqtt::MqttTransport;
use crate::bus::BusTransport;
use crate::config::HubConfig;
use crate::devices::{Device, DeviceKind, DeviceRegistry};
use crate::discovery::DiscoveryService;
use crate::error::HubError;
use crate::fusion::hub::SensorHub;
use crate::health::HealthRegistry;
use crate::logger::ServiceLogger;
use crate::logship::{spawn_shipper, BusLogSink, LogSink};
use crate::plug::PlugManager;
use crate::rules::RuleEngine;
use crate::timeseries::{DisabledSink, TimeSeriesSink, TracingSink};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);
const TRANSPORT_EVENT_CAPACITY: usize = 256;

/// Run the coordinator until SIGINT/SIGTERM.
pub async fn run(config: HubConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    // Bus client over the rumqttc transport.
    let settings = config.mqtt_settings();
    let (event_tx, event_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
    let transport =
        Arc::new(MqttTransport::new(settings.clone(), event_tx)) as Arc<dyn BusTransport>;
    // The bus's own logger never ships, so a broken broker cannot feed
    // itself error records.
    let bus = MqttClient::new(settings, transport, event_rx, ServiceLogger::new("mqtt"));
    bus.connect().await?;

    // Warn-and-above records ship back over the bus.
    let sink = Arc::new(BusLogSink::new(Arc::clone(&bus))) as Arc<dyn LogSink>;
    let shipper = spawn_shipper(sink, config.log_queue_capacity, shutdown.child_token());

    // Sensor fusion and its four subscriptions.
    let hub = SensorHub::new(
        config.calibration_offset,
        ServiceLogger::with_shipper("sensor-hub", shipper.clone()),
    );
    hub.attach(&bus).await?;
    hub.spawn_liveness_sweep(shutdown.child_token());

    // Device registry, seeded with one light per automation room.
    let devices =
        DeviceRegistry::new(ServiceLogger::with_shipper("devices", shipper.clone()));
    devices.attach_bus(Arc::clone(&bus)).await;
    for room in &config.rooms {
        devices
            .add(Device::new(
                format!("light-{room}"),
                format!("{room} light"),
                DeviceKind::Light,
                Some(room.clone()),
            ))
            .await;
    }

    // Automation rules.
    let engine = RuleEngine::new(
        &config.rooms,
        Arc::clone(&hub),
        Arc::clone(&devices),
        ServiceLogger::with_shipper("automation", shipper.clone()),
    );
    engine.set_dark_threshold(config.dark_threshold_pct).await;
    engine.attach_bus(Arc::clone(&bus)).await;
    engine.start(shutdown.child_token());
    let status = engine.get_status().await;
    tracing::info!(
        rules = status.total_rules,
        dark_threshold = status.dark_threshold,
        "automation engine started"
    );

    // Smart plugs.
    let ts_sink: Arc<dyn TimeSeriesSink> = if config.timeseries {
        Arc::new(TracingSink)
    } else {
        Arc::new(DisabledSink)
    };
    let plugs = PlugManager::new(
        ts_sink,
        ServiceLogger::with_shipper("tapo", shipper.clone()),
        PlugManager::reqwest_factory(),
        shutdown.child_token(),
    );
    plugs.attach_bus(Arc::clone(&bus)).await;
    for plug in config.load_devices()? {
        plugs.add_device(plug).await;
    }

    // Health probes, reported periodically.
    let health = Arc::new(HealthRegistry::new());
    {
        let bus = Arc::clone(&bus);
        health
            .register(
                "mqtt_connection",
                Box::new(move || {
                    let bus = Arc::clone(&bus);
                    Box::pin(async move {
                        if bus.is_connected().await {
                            Ok(())
                        } else {
                            Err(HubError::connection("mqtt is not connected"))
                        }
                    })
                }),
            )
            .await;
    }
    spawn_health_reporter(Arc::clone(&health), shutdown.child_token());

    // Optional multicast discovery; standalone by design.
    if config.discovery {
        let discovery = DiscoveryService::new(
            "homehub",
            config.mqtt_client_id.clone(),
            ServiceLogger::with_shipper("discovery", shipper.clone()),
        );
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            if let Err(e) = discovery.run(cancel).await {
                tracing::error!(err = %e, "discovery service failed");
            }
        });
    }

    tracing::info!("homehub coordinator running");

    // Wait for a shutdown signal (irrigation-hub style).
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let exit_reason = tokio::select! {
        _ = &mut ctrl_c => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };
    tracing::warn!(signal = exit_reason, "shutting down");

    shutdown.cancel();
    plugs.stop().await;
    bus.disconnect().await?;
    tracing::info!("shutdown complete");
    Ok(())
}

fn spawn_health_reporter(health: Arc<HealthRegistry>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(HEALTH_LOG_INTERVAL);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        timer.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {}
            }
            for (name, outcome) in health.snapshot().await {
                if let Some(err) = outcome {
                    tracing::warn!(probe = %name, err = %err, "health probe failing");
                }
            }
        }
    });
}
