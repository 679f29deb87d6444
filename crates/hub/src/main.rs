// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;

use homehub::config::HubConfig;

#[tokio::main]
async fn main() {
    let config = HubConfig::parse();

    // RUST_LOG wins; otherwise keep the coordinator chatty and its
    // dependencies quiet.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("homehub=info,warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(
        host = %config.mqtt_host,
        port = config.mqtt_port,
        rooms = config.rooms.len(),
        plugs_file = config.devices_config.is_some(),
        discovery = config.discovery,
        timeseries = config.timeseries,
        "starting homehub coordinator"
    );

    if let Err(e) = homehub::run(config).await {
        tracing::error!("coordinator exited: {e:#}");
        std::process::exit(2);
    }
}
