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

//! Communicator events and their processing.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bluetooth::{
    BluetoothCommunicator, BluetoothResult, ConnectionError, ConnectionState, Message, Peer, Role,
};
use crate::config::BluetoothConfig;
use crate::state::AppState;

/// Everything the communicator reports to its observers.
#[derive(Debug, Clone)]
pub enum CommunicatorEvent {
    AdvertiseStarted,
    AdvertiseStopped,
    AdvertiseFailed(i32),
    DiscoveryStarted,
    DiscoveryStopped,
    DiscoveryFailed(i32),
    PeerFound(Peer),
    PeerLost(Peer),
    /// A known peer changed name or address.
    PeerUpdated { old: Peer, new: Peer },
    /// A remote client asks to connect; answer with accept or reject.
    ConnectionRequest(Peer),
    ConnectionSuccess { peer: Peer, source: Role },
    ConnectionFailed { peer: Peer, error: ConnectionError },
    ConnectionLost { peer: Peer, source: Role },
    ConnectionResumed { peer: Peer, source: Role },
    MessageReceived { message: Message, source: Role },
    DataReceived { message: Message, source: Role },
    Disconnected { peer: Peer, peers_left: usize },
    BluetoothLeNotSupported,
}

/// Observer list. Closed receivers are pruned on the next emit.
#[derive(Debug, Default)]
pub struct EventDispatcher {
    subscribers: Vec<mpsc::UnboundedSender<CommunicatorEvent>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<CommunicatorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn emit(&mut self, event: CommunicatorEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Daemon-side reaction to communicator events.
pub struct EventProcessor {
    communicator: BluetoothCommunicator,
    state: Arc<AppState>,
    auto_accept: bool,
    auto_connect: bool,
}

impl EventProcessor {
    pub fn new(communicator: BluetoothCommunicator, state: Arc<AppState>, config: &BluetoothConfig) -> Self {
        Self {
            communicator,
            state,
            auto_accept: config.auto_accept,
            auto_connect: config.auto_connect,
        }
    }

    /// Process a single event.
    pub async fn process_event(&mut self, event: CommunicatorEvent) -> Result<()> {
        match event {
            CommunicatorEvent::AdvertiseStarted => {
                info!("Advertising started");
                self.state.set_advertising(true);
            }
            CommunicatorEvent::AdvertiseStopped => {
                info!("Advertising stopped");
                self.state.set_advertising(false);
            }
            CommunicatorEvent::AdvertiseFailed(code) => {
                error!("Advertising failed: {}", code);
                self.state.set_advertising(false);
                self.state.set_error(format!("advertising failed ({})", code));
            }
            CommunicatorEvent::DiscoveryStarted => {
                info!("Discovery started");
                self.state.set_discovering(true);
            }
            CommunicatorEvent::DiscoveryStopped => {
                info!("Discovery stopped");
                self.state.set_discovering(false);
            }
            CommunicatorEvent::DiscoveryFailed(code) => {
                error!("Discovery failed: {}", code);
                self.state.set_discovering(false);
                self.state.set_error(format!("discovery failed ({})", code));
            }
            CommunicatorEvent::PeerFound(peer) => {
                info!("Found {} ({})", peer.unique_name(), peer.device());
                self.state.add_found(peer.unique_name());
                if self.auto_connect {
                    self.connect(&peer).await?;
                }
            }
            CommunicatorEvent::PeerLost(peer) => {
                info!("Lost sight of {}", peer.unique_name());
                self.state.remove_found(peer.unique_name());
            }
            CommunicatorEvent::PeerUpdated { old, new } => {
                info!("{} is now {} ({})", old.unique_name(), new.unique_name(), new.device());
                self.state.rename(old.unique_name(), new.unique_name());
            }
            CommunicatorEvent::ConnectionRequest(peer) => {
                self.answer_request(&peer).await?;
            }
            CommunicatorEvent::ConnectionSuccess { peer, source } => {
                info!("Connected to {} as {}", peer.unique_name(), source);
                self.state
                    .set_peer(peer.unique_name(), ConnectionState::Connected);
            }
            CommunicatorEvent::ConnectionFailed { peer, error } => {
                warn!("Connection to {} failed: {}", peer.unique_name(), error);
                self.state.remove_peer(peer.unique_name());
            }
            CommunicatorEvent::ConnectionLost { peer, source } => {
                warn!("Connection to {} lost ({}), reconnecting", peer.unique_name(), source);
                self.state
                    .set_peer(peer.unique_name(), ConnectionState::Reconnecting);
            }
            CommunicatorEvent::ConnectionResumed { peer, source } => {
                info!("Connection to {} resumed ({})", peer.unique_name(), source);
                self.state
                    .set_peer(peer.unique_name(), ConnectionState::Connected);
            }
            CommunicatorEvent::MessageReceived { message, source } => {
                let sender = message
                    .sender()
                    .map(|peer| peer.unique_name().to_string())
                    .unwrap_or_default();
                match message.as_text() {
                    Some(text) => info!("Message from {} ({}): {}", sender, source, text),
                    None => info!("Message from {} ({}): {} bytes", sender, source, message.data().len()),
                }
                self.state.set_last_message(sender, message.as_text().unwrap_or_default().to_string());
            }
            CommunicatorEvent::DataReceived { message, source } => {
                debug!("Data from {:?} ({}): {} bytes", message.sender().map(Peer::unique_name), source, message.data().len());
            }
            CommunicatorEvent::Disconnected { peer, peers_left } => {
                info!("Disconnected from {} ({} peers left)", peer.unique_name(), peers_left);
                self.state.remove_peer(peer.unique_name());
            }
            CommunicatorEvent::BluetoothLeNotSupported => {
                error!("Bluetooth LE is not supported on this adapter");
                self.state.set_error("bluetooth le not supported".to_string());
            }
        }
        Ok(())
    }

    async fn connect(&self, peer: &Peer) -> Result<()> {
        self.state
            .set_peer(peer.unique_name(), ConnectionState::Connecting);
        let result = self.communicator.connect(peer.clone()).await?;
        if result != BluetoothResult::Success {
            warn!("Cannot connect to {}: {}", peer.unique_name(), result.as_str());
            self.state.remove_peer(peer.unique_name());
        }
        Ok(())
    }

    async fn answer_request(&self, peer: &Peer) -> Result<()> {
        let result = if self.auto_accept {
            info!("Accepting connection from {}", peer.unique_name());
            self.communicator.accept_connection(peer.clone()).await?
        } else {
            info!("Rejecting connection from {}", peer.unique_name());
            self.communicator.reject_connection(peer.clone()).await?
        };
        if result != BluetoothResult::Success {
            warn!("Cannot answer {}: {}", peer.unique_name(), result.as_str());
        }
        Ok(())
    }
}
