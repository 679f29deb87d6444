// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios over an in-process bus transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use homehub::bus::client::MqttClient;
use homehub::devices::{Device, DeviceCommand, DeviceKind, DeviceRegistry};
use homehub::error::{HubError, HubResult};
use homehub::fusion::hub::SensorHub;
use homehub::logger::ServiceLogger;
use homehub::plug::http::PlugHttp;
use homehub::plug::{EnergyRecord, HandshakeVariant, PlugConfig, PlugHttpFactory, PlugManager};
use homehub::rules::RuleEngine;
use homehub::timeseries::DisabledSink;

use homehub_specs::{connected_client, eventually, MockBus};

struct World {
    transport: Arc<MockBus>,
    hub: Arc<SensorHub>,
    devices: Arc<DeviceRegistry>,
    engine: Arc<RuleEngine>,
    cancel: CancellationToken,
}

async fn world() -> anyhow::Result<(World, Arc<MqttClient>)> {
    let (bus, transport) = connected_client().await?;

    let hub = SensorHub::new(None, ServiceLogger::new("sensor-hub"));
    hub.attach(&bus).await.map_err(|e| anyhow::anyhow!("attach failed: {e}"))?;

    let devices = DeviceRegistry::new(ServiceLogger::new("devices"));
    devices.attach_bus(Arc::clone(&bus)).await;
    devices
        .add(Device::new(
            "light-living-room",
            "Living Room Light",
            DeviceKind::Light,
            Some("living-room".into()),
        ))
        .await;

    let rooms = vec!["living-room".to_owned()];
    let engine = RuleEngine::new(
        &rooms,
        Arc::clone(&hub),
        Arc::clone(&devices),
        ServiceLogger::new("automation"),
    );
    engine.attach_bus(Arc::clone(&bus)).await;
    let cancel = CancellationToken::new();
    engine.start(cancel.clone());

    Ok((World { transport, hub, devices, engine, cancel }, bus))
}

async fn light_is_on(devices: &DeviceRegistry) -> bool {
    match devices.get("light-living-room").await {
        Some(device) => {
            device.status == "on"
                && device.properties.get("power") == Some(&serde_json::json!(true))
        }
        None => false,
    }
}

#[tokio::test]
async fn motion_in_dark_room_fires_lights_on() -> anyhow::Result<()> {
    let (world, _bus) = world().await?;

    world
        .transport
        .inject(
            "room-light/living-room",
            serde_json::json!({"light_level": 5, "light_state": "dark"}),
        )
        .await;
    world
        .transport
        .inject("room-motion/living-room", serde_json::json!({"motion": true}))
        .await;

    let devices = Arc::clone(&world.devices);
    assert!(
        eventually(|| {
            let devices = Arc::clone(&devices);
            async move { light_is_on(&devices).await }
        })
        .await,
        "light should turn on"
    );

    let firings = world.transport.published_on("automation/living-room").await;
    assert_eq!(firings.len(), 1);
    let payload: serde_json::Value = serde_json::from_slice(&firings[0].payload)?;
    assert_eq!(payload["action"], "lights_on");
    assert_eq!(payload["reason"], "motion_detected_dark");
    assert_eq!(payload["service"], "automation");
    assert_eq!(payload["room_id"], "living-room");

    let rule = world
        .engine
        .get_rule("motion-light-living-room")
        .await
        .ok_or_else(|| anyhow::anyhow!("missing rule"))?;
    assert!(rule.last_fired_at.is_some());

    // The registry republishes retained device state on the mutation.
    let states = world
        .transport
        .published_on("homeautomation/devices/light-living-room/state")
        .await;
    assert!(!states.is_empty());
    assert!(states.iter().all(|m| m.retain));

    world.cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn motion_in_bright_room_does_not_fire() -> anyhow::Result<()> {
    let (world, _bus) = world().await?;

    world
        .transport
        .inject(
            "room-light/living-room",
            serde_json::json!({"light_level": 85, "light_state": "bright"}),
        )
        .await;
    world
        .transport
        .inject("room-motion/living-room", serde_json::json!({"motion": true}))
        .await;

    // Wait for the occupancy edge to land, then give the engine a moment.
    let hub = Arc::clone(&world.hub);
    assert!(
        eventually(|| {
            let hub = Arc::clone(&hub);
            async move {
                hub.room_snapshot("living-room").await.is_some_and(|r| r.is_occupied)
            }
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!light_is_on(&world.devices).await);
    assert!(world.transport.published_on("automation/living-room").await.is_empty());

    world.cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn cooldown_suppresses_a_second_firing() -> anyhow::Result<()> {
    let (world, _bus) = world().await?;

    world
        .transport
        .inject(
            "room-light/living-room",
            serde_json::json!({"light_level": 5, "light_state": "dark"}),
        )
        .await;
    world
        .transport
        .inject("room-motion/living-room", serde_json::json!({"motion": true}))
        .await;

    let devices = Arc::clone(&world.devices);
    assert!(
        eventually(|| {
            let devices = Arc::clone(&devices);
            async move { light_is_on(&devices).await }
        })
        .await
    );

    // Reset the light, clear occupancy, and trip motion again within the
    // cooldown window.
    world
        .devices
        .execute(&DeviceCommand::new("light-living-room", "turn_off"))
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    world
        .transport
        .inject("room-motion/living-room", serde_json::json!({"motion": false}))
        .await;
    let hub = Arc::clone(&world.hub);
    assert!(
        eventually(|| {
            let hub = Arc::clone(&hub);
            async move {
                hub.room_snapshot("living-room").await.is_some_and(|r| !r.is_occupied)
            }
        })
        .await
    );

    world
        .transport
        .inject("room-motion/living-room", serde_json::json!({"motion": true}))
        .await;
    let hub = Arc::clone(&world.hub);
    assert!(
        eventually(|| {
            let hub = Arc::clone(&hub);
            async move {
                hub.room_snapshot("living-room").await.is_some_and(|r| r.is_occupied)
            }
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!light_is_on(&world.devices).await, "cooldown must suppress the second firing");
    assert_eq!(world.transport.published_on("automation/living-room").await.len(), 1);

    world.cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn liveness_sweep_marks_quiet_room_offline() -> anyhow::Result<()> {
    let (world, _bus) = world().await?;

    world
        .transport
        .inject("room-motion/living-room", serde_json::json!({"motion": true}))
        .await;
    let hub = Arc::clone(&world.hub);
    assert!(
        eventually(|| {
            let hub = Arc::clone(&hub);
            async move { hub.room_snapshot("living-room").await.is_some() }
        })
        .await
    );

    let eleven_minutes_on = chrono::Utc::now() + chrono::Duration::minutes(11);
    let flagged = world.hub.sweep_once(eleven_minutes_on).await;
    assert_eq!(flagged, vec!["living-room".to_owned()]);

    let room = world
        .hub
        .room_snapshot("living-room")
        .await
        .ok_or_else(|| anyhow::anyhow!("missing room"))?;
    assert!(!room.is_online);
    assert!(room.is_occupied, "the sweep must never flip occupancy");

    world.cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn climate_commands_publish_control_and_readout() -> anyhow::Result<()> {
    let (bus, transport) = connected_client().await?;
    let devices = DeviceRegistry::new(ServiceLogger::new("devices"));
    devices.attach_bus(Arc::clone(&bus)).await;
    devices.add(Device::new("hvac-1", "Thermostat", DeviceKind::Climate, None)).await;

    devices
        .execute(
            &DeviceCommand::new("hvac-1", "set_temperature").with_value(serde_json::json!(68.0)),
        )
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let controls = transport.published_on("thermostat/hvac-1/control").await;
    assert_eq!(controls.len(), 1);
    let payload: serde_json::Value = serde_json::from_slice(&controls[0].payload)?;
    assert_eq!(payload["action"], "set_target");
    assert_eq!(payload["target"], 68.0);

    let readout = devices
        .execute(&DeviceCommand::new("hvac-1", "get_temperature"))
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(readout, Some(serde_json::json!(68.0)));

    let temps = transport.published_on("temp").await;
    assert!(temps.iter().any(|m| m.topic == "temp"));

    Ok(())
}

/// Legacy plug double for the energy fan-out path.
struct SpecLegacyPlug;

#[async_trait]
impl PlugHttp for SpecLegacyPlug {
    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> HubResult<serde_json::Value> {
        let method = body.get("method").and_then(serde_json::Value::as_str).unwrap_or_default();
        match (path, method) {
            ("/app", "handshake") => {
                Ok(serde_json::json!({"error_code": 0, "result": {"token": "tok-1"}}))
            }
            ("/app?token=tok-1", "get_device_info") => Ok(serde_json::json!({
                "error_code": 0,
                "result": {"device_on": true, "signal_level": 2}
            })),
            ("/app?token=tok-1", "get_energy_usage") => Ok(serde_json::json!({
                "error_code": 0,
                "result": {"current_power": 4200.0, "today_energy": 310.0}
            })),
            _ => Ok(serde_json::json!({"error_code": 1003})),
        }
    }

    async fn post_raw(&self, _path: &str, _body: Vec<u8>) -> HubResult<Vec<u8>> {
        Err(HubError::device("legacy plug has no raw endpoint"))
    }
}

#[tokio::test]
async fn plug_energy_readings_fan_out_over_the_bus() -> anyhow::Result<()> {
    let (bus, transport) = connected_client().await?;
    let cancel = CancellationToken::new();

    let factory: PlugHttpFactory =
        Arc::new(|_config| Arc::new(SpecLegacyPlug) as Arc<dyn PlugHttp>);
    let manager = PlugManager::new(
        Arc::new(DisabledSink),
        ServiceLogger::new("tapo"),
        factory,
        cancel.clone(),
    );
    manager.attach_bus(Arc::clone(&bus)).await;
    manager
        .add_device(PlugConfig {
            device_id: "plug-1".into(),
            name: "Desk Plug".into(),
            room_id: "office".into(),
            ip: "10.0.0.9".into(),
            username: "ops@example.com".into(),
            secret: "hunter2".into(),
            poll_interval_secs: 1,
            handshake_variant: HandshakeVariant::Legacy,
        })
        .await;

    let probe = Arc::clone(&transport);
    assert!(
        eventually(|| {
            let probe = Arc::clone(&probe);
            async move { !probe.published_on("tapo/plug-1/energy").await.is_empty() }
        })
        .await,
        "an energy record should be published"
    );

    let records = transport.published_on("tapo/plug-1/energy").await;
    let record: EnergyRecord = serde_json::from_slice(&records[0].payload)?;
    assert_eq!(record.device_id, "plug-1");
    assert_eq!(record.room_id, "office");
    assert_eq!(record.power_w, 4.2);
    assert!(record.power_w >= 0.0 && record.energy_wh >= 0.0);
    assert!(record.is_on);

    cancel.cancel();
    Ok(())
}
