// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Time-series sink contract (collaborator). Write failures are non-fatal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::HubResult;

#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn write_energy_reading(
        &self,
        device_id: &str,
        room_id: &str,
        power_w: f64,
        energy_wh: f64,
        voltage_v: f64,
        current_a: f64,
        is_on: bool,
        at: DateTime<Utc>,
    ) -> HubResult<()>;
}

/// Emits readings into the diagnostic log stream. Stands in for a real
/// time-series backend, which is wired by the embedder.
pub struct TracingSink;

#[async_trait]
impl TimeSeriesSink for TracingSink {
    async fn write_energy_reading(
        &self,
        device_id: &str,
        room_id: &str,
        power_w: f64,
        energy_wh: f64,
        voltage_v: f64,
        current_a: f64,
        is_on: bool,
        at: DateTime<Utc>,
    ) -> HubResult<()> {
        tracing::info!(
            device_id,
            room_id,
            power_w,
            energy_wh,
            voltage_v,
            current_a,
            is_on,
            at = %at,
            "energy reading"
        );
        Ok(())
    }
}

/// Used when the time-series feature toggle is off.
pub struct DisabledSink;

#[async_trait]
impl TimeSeriesSink for DisabledSink {
    async fn write_energy_reading(
        &self,
        device_id: &str,
        _room_id: &str,
        power_w: f64,
        _energy_wh: f64,
        _voltage_v: f64,
        _current_a: f64,
        _is_on: bool,
        _at: DateTime<Utc>,
    ) -> HubResult<()> {
        tracing::trace!(device_id, power_w, "time-series sink disabled, reading discarded");
        Ok(())
    }
}
