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

//! Server (peripheral) side of the connection handshake.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, info, warn};

use super::adapter::{BluetoothAdapter, DeviceAddress, LinkKind, Role};
use super::ble_constants::{config::DEFAULT_MTU, response};
use super::communicator::CommunicatorConfig;
use super::connection::{Connection, ConnectionError, ConnectionEvent};
use super::peer::Peer;

/// Connections other devices initiated towards us.
pub struct ConnectionServer {
    connection: Connection,
    /// Links that have not been accepted yet, with their MTU.
    links: HashMap<DeviceAddress, usize>,
    /// Connection requests waiting for the application's answer.
    requests: HashMap<DeviceAddress, Peer>,
    rejecting: HashSet<DeviceAddress>,
    /// Most centrals served at once, counting unanswered requests.
    max_links: Option<usize>,
}

impl ConnectionServer {
    pub fn new(config: &CommunicatorConfig, max_links: Option<usize>) -> Self {
        Self {
            connection: Connection::new(
                Role::Server,
                config.reconnection_timeout,
                config.disconnection_timeout,
            ),
            links: HashMap::new(),
            requests: HashMap::new(),
            rejecting: HashSet::new(),
            max_links,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// Requests not answered yet.
    pub fn pending_requests(&self) -> Vec<Peer> {
        self.requests.values().cloned().collect()
    }

    pub fn has_requests(&self) -> bool {
        !self.requests.is_empty()
    }

    fn is_full(&self) -> bool {
        self.max_links
            .is_some_and(|max| self.connection.peer_count() + self.requests.len() >= max)
    }

    pub fn on_link_up(&mut self, device: DeviceAddress, adapter: &mut dyn BluetoothAdapter) {
        if self.connection.contains(device) {
            return;
        }
        debug!("Central {} attached", device);
        self.links.entry(device).or_insert(DEFAULT_MTU);
        adapter.read_phy(Role::Server, device);
    }

    pub fn on_mtu_changed(&mut self, device: DeviceAddress, mtu: usize) {
        match self.links.get_mut(&device) {
            Some(link_mtu) => *link_mtu = mtu,
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
        if kind == LinkKind::ConnectionRequest {
            return self.on_connection_request(device, data, adapter);
        }
        self.connection.on_frame(device, kind, data, adapter, now)
    }

    fn on_connection_request(
        &mut self,
        device: DeviceAddress,
        data: &[u8],
        adapter: &mut dyn BluetoothAdapter,
    ) -> Vec<ConnectionEvent> {
        let unique_name = String::from_utf8_lossy(data).into_owned();
        if unique_name.is_empty() {
            warn!("Empty connection request from {}", device);
            return Vec::new();
        }
        let reconnecting = self.connection.find_reconnecting(&unique_name);
        if self.connection.contains(device) && reconnecting != Some(device) {
            debug!("Duplicate connection request from {}", unique_name);
            return Vec::new();
        }

        let mtu = self.links.get(&device).copied().unwrap_or(DEFAULT_MTU);

        if let Some(old) = reconnecting {
            info!("{} is back, resuming its connection", unique_name);
            self.links.remove(&device);
            adapter.write(
                Role::Server,
                device,
                LinkKind::ConnectionResponse,
                vec![response::ACCEPT],
            );
            return self.connection.resume(old, device, mtu);
        }

        if self.requests.contains_key(&device) {
            debug!("Duplicate connection request from {}", unique_name);
            return Vec::new();
        }

        if self.is_full() {
            warn!("Refusing {}: no room for another central", unique_name);
            self.links.remove(&device);
            self.rejecting.insert(device);
            adapter.write(
                Role::Server,
                device,
                LinkKind::ConnectionResponse,
                vec![response::REJECT],
            );
            return Vec::new();
        }

        info!("Connection request from {} ({})", unique_name, device);
        self.links.entry(device).or_insert(mtu);
        let mut peer = Peer::new(unique_name, device);
        peer.hardware_connected = true;
        self.requests.insert(device, peer.clone());
        vec![ConnectionEvent::ConnectionRequest(peer)]
    }

    /// Accept a pending request. `None` if there is no such request.
    pub fn accept(
        &mut self,
        peer: &Peer,
        adapter: &mut dyn BluetoothAdapter,
    ) -> Option<Vec<ConnectionEvent>> {
        let device = peer.device();
        let mut peer = self.requests.remove(&device)?;
        let mtu = self.links.remove(&device).unwrap_or(DEFAULT_MTU);

        adapter.write(
            Role::Server,
            device,
            LinkKind::ConnectionResponse,
            vec![response::ACCEPT],
        );
        peer.connected = true;
        info!("Accepted connection from {}", peer.unique_name());
        let peer = self.connection.add_channel(peer, mtu);
        Some(vec![ConnectionEvent::ConnectionSuccess(peer)])
    }

    /// Reject a pending request; the link is closed once the answer is written.
    pub fn reject(&mut self, peer: &Peer, adapter: &mut dyn BluetoothAdapter) -> bool {
        let device = peer.device();
        let Some(peer) = self.requests.remove(&device) else {
            return false;
        };

        info!("Rejected connection from {}", peer.unique_name());
        self.rejecting.insert(device);
        adapter.write(
            Role::Server,
            device,
            LinkKind::ConnectionResponse,
            vec![response::REJECT],
        );
        true
    }

    pub fn on_write_completed(
        &mut self,
        device: DeviceAddress,
        kind: LinkKind,
        success: bool,
        adapter: &mut dyn BluetoothAdapter,
        now: Instant,
    ) -> Vec<ConnectionEvent> {
        if kind == LinkKind::ConnectionResponse {
            if self.rejecting.remove(&device) {
                adapter.disconnect(Role::Server, device);
            }
            return Vec::new();
        }
        self.connection
            .on_write_completed(device, kind, success, adapter, now)
    }

    pub fn on_link_down(&mut self, device: DeviceAddress, now: Instant) -> Vec<ConnectionEvent> {
        self.links.remove(&device);
        self.rejecting.remove(&device);
        if let Some(peer) = self.requests.remove(&device) {
            info!("{} left before its request was answered", peer.unique_name());
            return vec![ConnectionEvent::ConnectionFailed(
                peer,
                ConnectionError::LinkLost,
            )];
        }
        self.connection.on_link_down(device, now)
    }

    /// `None` when the device is neither connected nor requesting.
    pub fn disconnect(
        &mut self,
        device: DeviceAddress,
        adapter: &mut dyn BluetoothAdapter,
    ) -> Option<Vec<ConnectionEvent>> {
        if self.requests.remove(&device).is_some() {
            self.links.remove(&device);
            adapter.disconnect(Role::Server, device);
            return Some(Vec::new());
        }
        self.connection.disconnect(device, adapter)
    }

    pub fn tick(&mut self, now: Instant) -> Vec<ConnectionEvent> {
        self.connection.tick(now)
    }

    pub fn on_adapter_off(&mut self, now: Instant) -> Vec<ConnectionEvent> {
        self.links.clear();
        self.rejecting.clear();
        let mut events: Vec<ConnectionEvent> = self
            .requests
            .drain()
            .map(|(_, peer)| ConnectionEvent::ConnectionFailed(peer, ConnectionError::LinkLost))
            .collect();
        events.extend(self.connection.on_adapter_off(now));
        events
    }

    pub fn destroy(&mut self, adapter: &mut dyn BluetoothAdapter) {
        let attached: HashSet<DeviceAddress> = self
            .links
            .keys()
            .chain(self.requests.keys())
            .chain(self.rejecting.iter())
            .copied()
            .collect();
        for device in attached {
            adapter.disconnect(Role::Server, device);
        }
        self.links.clear();
        self.requests.clear();
        self.rejecting.clear();
        self.connection.destroy(adapter);
    }
}
