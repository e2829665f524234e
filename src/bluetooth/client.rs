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

//! Client (central) side of the connection handshake.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::adapter::{BluetoothAdapter, DeviceAddress, LinkKind, Role};
use super::ble_constants::{config::DEFAULT_MTU, response};
use super::communicator::CommunicatorConfig;
use super::connection::{Connection, ConnectionError, ConnectionEvent};
use super::peer::Peer;

struct PendingConnect {
    peer: Peer,
    deadline: Instant,
    mtu: usize,
    /// Address of the reconnecting peer this attempt would resume.
    resumes: Option<DeviceAddress>,
}

/// Connections this device initiated.
pub struct ConnectionClient {
    connection: Connection,
    pending: HashMap<DeviceAddress, PendingConnect>,
    preferred_mtu: usize,
    connection_timeout: Duration,
}

impl ConnectionClient {
    pub fn new(config: &CommunicatorConfig) -> Self {
        Self {
            connection: Connection::new(
                Role::Client,
                config.reconnection_timeout,
                config.disconnection_timeout,
            ),
            pending: HashMap::new(),
            preferred_mtu: config.preferred_mtu,
            connection_timeout: config.connection_timeout,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// Whether a fresh (non reconnection) attempt is in progress.
    pub fn is_connecting(&self) -> bool {
        self.pending.values().any(|p| p.resumes.is_none())
    }

    /// Whether any attempt, fresh or resuming, is still in flight.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn is_tracking(&self, device: DeviceAddress) -> bool {
        self.pending.contains_key(&device) || self.connection.contains(device)
    }

    /// Start connecting to a discovered peer.
    pub fn connect(&mut self, peer: &Peer, adapter: &mut dyn BluetoothAdapter, now: Instant) -> bool {
        if self.is_tracking(peer.device()) {
            warn!("Already connected or connecting to {}", peer.unique_name());
            return false;
        }

        info!("Connecting to {} ({})", peer.unique_name(), peer.device());
        self.pending.insert(
            peer.device(),
            PendingConnect {
                peer: Peer::new(peer.unique_name(), peer.device()),
                deadline: now + self.connection_timeout,
                mtu: DEFAULT_MTU,
                resumes: None,
            },
        );
        adapter.connect(peer.device());
        true
    }

    /// A scan found `unique_name` at `device`; reconnect if we lost it.
    ///
    /// Returns `true` when the result belongs to a reconnecting peer.
    pub fn on_scan_match(
        &mut self,
        unique_name: &str,
        device: DeviceAddress,
        adapter: &mut dyn BluetoothAdapter,
        now: Instant,
    ) -> bool {
        let Some(old) = self.connection.find_reconnecting(unique_name) else {
            return false;
        };
        let Some(peer) = self.connection.peer_mut(old) else {
            return false;
        };
        if peer.requesting_reconnection || self.pending.contains_key(&device) {
            return true;
        }
        peer.requesting_reconnection = true;

        info!("Found {} again at {}, reconnecting", unique_name, device);
        self.pending.insert(
            device,
            PendingConnect {
                peer: Peer::new(unique_name, device),
                deadline: now + self.connection_timeout,
                mtu: DEFAULT_MTU,
                resumes: Some(old),
            },
        );
        adapter.connect(device);
        true
    }

    /// The physical link is up: negotiate and send our connection request.
    pub fn on_link_up(
        &mut self,
        device: DeviceAddress,
        local_unique_name: &str,
        adapter: &mut dyn BluetoothAdapter,
    ) {
        let Some(pending) = self.pending.get_mut(&device) else {
            warn!("Unexpected client link to {}, closing it", device);
            adapter.disconnect(Role::Client, device);
            return;
        };
        pending.peer.hardware_connected = true;

        debug!("Link to {} up, sending connection request", device);
        adapter.request_mtu(device, self.preferred_mtu);
        adapter.read_phy(Role::Client, device);
        adapter.write(
            Role::Client,
            device,
            LinkKind::ConnectionRequest,
            local_unique_name.as_bytes().to_vec(),
        );
    }

    pub fn on_mtu_changed(&mut self, device: DeviceAddress, mtu: usize) {
        match self.pending.get_mut(&device) {
            Some(pending) => pending.mtu = mtu,
            None => {
                self.connection.set_mtu(device, mtu);
            }
        }
    }

    pub fn on_frame(
        &mut self,
        device: DeviceAddress,
        kind: LinkKind,
        data: &[u8],
        adapter: &mut dyn BluetoothAdapter,
        now: Instant,
    ) -> Vec<ConnectionEvent> {
        if kind == LinkKind::ConnectionResponse {
            return self.on_connection_response(device, data, adapter);
        }
        self.connection.on_frame(device, kind, data, adapter, now)
    }

    fn on_connection_response(
        &mut self,
        device: DeviceAddress,
        data: &[u8],
        adapter: &mut dyn BluetoothAdapter,
    ) -> Vec<ConnectionEvent> {
        let Some(pending) = self.pending.remove(&device) else {
            debug!("Connection response from {} without a request", device);
            return Vec::new();
        };
        let accepted = data.first() == Some(&response::ACCEPT);

        match (accepted, pending.resumes) {
            (true, Some(old)) => {
                if !self.connection.contains(old) {
                    debug!("Reconnection of {} no longer wanted", pending.peer.unique_name());
                    adapter.disconnect(Role::Client, device);
                    return Vec::new();
                }
                self.connection.resume(old, device, pending.mtu)
            }
            (true, None) => {
                let mut peer = pending.peer;
                peer.hardware_connected = true;
                peer.connected = true;
                info!("Connection to {} accepted", peer.unique_name());
                let peer = self.connection.add_channel(peer, pending.mtu);
                vec![ConnectionEvent::ConnectionSuccess(peer)]
            }
            (false, Some(old)) => {
                warn!("{} refused the reconnection", pending.peer.unique_name());
                adapter.disconnect(Role::Client, device);
                self.connection
                    .disconnect(old, adapter)
                    .unwrap_or_default()
            }
            (false, None) => {
                info!("Connection to {} rejected", pending.peer.unique_name());
                adapter.disconnect(Role::Client, device);
                vec![ConnectionEvent::ConnectionFailed(
                    pending.peer,
                    ConnectionError::Rejected,
                )]
            }
        }
    }

    fn fail_pending(&mut self, pending: PendingConnect, error: ConnectionError) -> Vec<ConnectionEvent> {
        match pending.resumes {
            Some(old) => {
                debug!(
                    "Reconnection attempt to {} failed ({}), still waiting",
                    pending.peer.unique_name(),
                    error
                );
                match self.connection.peer_mut(old) {
                    Some(peer) => {
                        peer.requesting_reconnection = false;
                        vec![ConnectionEvent::ReconnectionAttemptFailed(peer.clone())]
                    }
                    None => Vec::new(),
                }
            }
            None => {
                warn!("Connection to {} failed: {}", pending.peer.unique_name(), error);
                vec![ConnectionEvent::ConnectionFailed(pending.peer, error)]
            }
        }
    }

    pub fn on_connect_failed(&mut self, device: DeviceAddress, code: i32) -> Vec<ConnectionEvent> {
        match self.pending.remove(&device) {
            Some(pending) => self.fail_pending(pending, ConnectionError::Platform(code)),
            None => Vec::new(),
        }
    }

    pub fn on_write_completed(
        &mut self,
        device: DeviceAddress,
        kind: LinkKind,
        success: bool,
        adapter: &mut dyn BluetoothAdapter,
        now: Instant,
    ) -> Vec<ConnectionEvent> {
        if kind == LinkKind::ConnectionRequest {
            if !success {
                warn!("Connection request to {} could not be written", device);
            }
            return Vec::new();
        }
        self.connection
            .on_write_completed(device, kind, success, adapter, now)
    }

    pub fn on_link_down(&mut self, device: DeviceAddress, now: Instant) -> Vec<ConnectionEvent> {
        if let Some(pending) = self.pending.remove(&device) {
            return self.fail_pending(pending, ConnectionError::LinkLost);
        }
        self.connection.on_link_down(device, now)
    }

    /// `None` when the device is neither connected nor being connected.
    pub fn disconnect(
        &mut self,
        device: DeviceAddress,
        adapter: &mut dyn BluetoothAdapter,
    ) -> Option<Vec<ConnectionEvent>> {
        if let Some(pending) = self.pending.remove(&device) {
            info!("Cancelling connection to {}", pending.peer.unique_name());
            adapter.disconnect(Role::Client, device);
            if let Some(old) = pending.resumes {
                return self.connection.disconnect(old, adapter);
            }
            return Some(Vec::new());
        }
        self.connection.disconnect(device, adapter)
    }

    /// Expire connection attempts, then reconnection and disconnection deadlines.
    pub fn tick(&mut self, now: Instant, adapter: &mut dyn BluetoothAdapter) -> Vec<ConnectionEvent> {
        let expired: Vec<DeviceAddress> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(device, _)| *device)
            .collect();

        let mut events = Vec::new();
        for device in expired {
            if let Some(pending) = self.pending.remove(&device) {
                adapter.disconnect(Role::Client, device);
                events.extend(self.fail_pending(pending, ConnectionError::Timeout));
            }
        }

        events.extend(self.connection.tick(now));

        // Attempts resuming a peer whose reconnection just expired are moot
        let orphaned: Vec<DeviceAddress> = self
            .pending
            .iter()
            .filter(|(_, p)| p.resumes.map_or(false, |old| !self.connection.contains(old)))
            .map(|(device, _)| *device)
            .collect();
        for device in orphaned {
            self.pending.remove(&device);
            adapter.disconnect(Role::Client, device);
        }

        events
    }

    pub fn on_adapter_off(&mut self, now: Instant) -> Vec<ConnectionEvent> {
        let pending: Vec<PendingConnect> = self.pending.drain().map(|(_, p)| p).collect();
        let mut events: Vec<ConnectionEvent> = pending
            .into_iter()
            .flat_map(|p| self.fail_pending(p, ConnectionError::LinkLost))
            .collect();
        events.extend(self.connection.on_adapter_off(now));
        events
    }

    pub fn destroy(&mut self, adapter: &mut dyn BluetoothAdapter) {
        for (device, _) in self.pending.drain() {
            adapter.disconnect(Role::Client, device);
        }
        self.connection.destroy(adapter);
    }
}
