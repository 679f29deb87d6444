// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use yare::parameterized;

use super::*;
use crate::error::ErrorKind;

#[parameterized(
    deep_night = { 2.0, 23, DayPhase::Night },
    early_night = { 4.9, 3, DayPhase::Night },
    night_boundary_level = { 5.0, 23, DayPhase::Transitional },
    night_boundary_hour = { 4.9, 22, DayPhase::Transitional },
    bright_midday = { 85.0, 12, DayPhase::Day },
    bright_early = { 85.0, 9, DayPhase::Dawn },
    day_lower_hour = { 71.0, 10, DayPhase::Day },
    day_upper_hour = { 71.0, 16, DayPhase::Day },
    dawn = { 35.0, 7, DayPhase::Dawn },
    dawn_hour_excluded = { 35.0, 10, DayPhase::Transitional },
    dusk = { 25.0, 19, DayPhase::Dusk },
    dusk_at_22 = { 25.0, 22, DayPhase::Dusk },
    dim_evening = { 5.0, 22, DayPhase::Transitional },
    overcast_noon = { 40.0, 12, DayPhase::Transitional },
)]
fn day_phase_rule(light_pct: f64, hour: u32, expected: DayPhase) {
    assert_eq!(day_phase(light_pct, hour), expected);
}

#[test]
fn parses_valid_sensor_topics() -> anyhow::Result<()> {
    let (kind, room) = parse_sensor_topic("room-temp/kitchen").map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(kind, SensorKind::Temperature);
    assert_eq!(room, "kitchen");

    let (kind, _) = parse_sensor_topic("room-hum/office").map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(kind, SensorKind::Humidity);

    let (kind, _) = parse_sensor_topic("room-motion/hallway").map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(kind, SensorKind::Motion);

    let (kind, room) =
        parse_sensor_topic("room-light/living-room").map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(kind, SensorKind::Light);
    assert_eq!(room, "living-room");
    Ok(())
}

#[parameterized(
    no_room = { "room-temp" },
    empty_room = { "room-temp/" },
    nested_room = { "room-temp/a/b" },
    unknown_prefix = { "room-co2/kitchen" },
)]
fn rejects_malformed_topics(topic: &str) {
    let result = parse_sensor_topic(topic);
    assert!(matches!(result, Err(e) if e.kind() == ErrorKind::Validation), "topic: {topic}");
}

#[test]
fn sensor_message_tolerates_partial_payloads() -> anyhow::Result<()> {
    let msg: SensorMessage = serde_json::from_str(r#"{"motion": true, "device_id": "pir-1"}"#)?;
    assert_eq!(msg.motion, Some(true));
    assert!(msg.temperature.is_none());
    assert!(msg.light_state.is_none());

    let msg: SensorMessage = serde_json::from_str(
        r#"{"light_level": 5, "light_state": "dark", "room": "office", "timestamp": 1754050000}"#,
    )?;
    assert_eq!(msg.light_level, Some(5.0));
    assert_eq!(msg.light_state, Some(LightState::Dark));
    Ok(())
}
