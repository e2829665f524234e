// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! BLE communicator daemon.

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ble_communicator::bluetooth::{platform_channel, BluetoothCommunicator, BluezAdapter};
use ble_communicator::config::Config;
use ble_communicator::events::EventProcessor;
use ble_communicator::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_communicator=info".parse()?),
        )
        .init();

    info!("Starting BLE communicator v{}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    // Open the adapter; it reports back on the platform channel
    let (platform_tx, platform_rx) = platform_channel();
    let adapter = BluezAdapter::new(platform_tx).await?;

    let (communicator, task) =
        BluetoothCommunicator::spawn(adapter, platform_rx, config.communicator_config());
    let mut events = communicator.subscribe().await?;

    let result = communicator.set_name(&config.bluetooth.device_name).await?;
    if !result.is_success() {
        warn!("Cannot use name '{}': {}", config.bluetooth.device_name, result.as_str());
    }
    if config.bluetooth.advertise {
        let result = communicator.start_advertising().await?;
        info!("Start advertising: {}", result.as_str());
    }
    if config.bluetooth.discover {
        let result = communicator.start_discovery().await?;
        info!("Start discovery: {}", result.as_str());
    }

    let state = AppState::new();
    let mut processor = EventProcessor::new(communicator.clone(), state.clone(), &config.bluetooth);

    info!("Ready.");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if let Err(e) = processor.process_event(event).await {
                        error!("Error processing event: {}", e);
                    }
                }
                None => {
                    warn!("Communicator stopped unexpectedly");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    communicator.destroy().await?;
    drop(processor);
    drop(communicator);
    if let Err(e) = task.await {
        error!("Communicator task failed: {}", e);
    }

    info!(
        "BLE communicator stopped ({} peers, last error: {})",
        state.peer_count(),
        state.get_error().unwrap_or_else(|| "none".to_string())
    );
    Ok(())
}
