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

//! Channel bookkeeping shared by the client and server roles.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::adapter::{BluetoothAdapter, DeviceAddress, LinkKind, Role};
use super::channel::Channel;
use super::peer::Peer;
use super::protocol::Message;

/// Events emitted by a role manager.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A central asked to connect (server role only).
    ConnectionRequest(Peer),
    ConnectionSuccess(Peer),
    ConnectionFailed(Peer, ConnectionError),
    /// Link dropped unexpectedly; reconnection is in progress.
    ConnectionLost(Peer),
    ConnectionResumed(Peer),
    /// One attempt to reach a reconnecting peer failed; it is still awaited.
    ReconnectionAttemptFailed(Peer),
    MessageReceived(Message),
    DataReceived(Message),
    /// Every channel targeted by the current send of this kind is done.
    SendCompleted(LinkKind),
    Disconnected(Peer),
    /// The platform never confirmed a requested disconnection.
    DisconnectionFailed(Peer),
    PeerUpdated { old: Peer, new: Peer },
}

/// Why a connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection rejected by peer")]
    Rejected,
    #[error("connection timed out")]
    Timeout,
    #[error("link lost")]
    LinkLost,
    #[error("platform error {0}")]
    Platform(i32),
}

/// State of a connection as seen from one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn of(peer: &Peer) -> Self {
        if peer.reconnecting {
            ConnectionState::Reconnecting
        } else if peer.connected {
            ConnectionState::Connected
        } else if peer.hardware_connected {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting...",
        }
    }
}

/// Channels of one role, plus reconnection and disconnection deadlines.
pub struct Connection {
    role: Role,
    channels: HashMap<DeviceAddress, Channel>,
    reconnection_deadlines: HashMap<DeviceAddress, Instant>,
    disconnection_deadlines: HashMap<DeviceAddress, Instant>,
    sending: HashMap<LinkKind, HashSet<DeviceAddress>>,
    reconnection_timeout: Duration,
    disconnection_timeout: Duration,
}

impl Connection {
    pub fn new(role: Role, reconnection_timeout: Duration, disconnection_timeout: Duration) -> Self {
        Self {
            role,
            channels: HashMap::new(),
            reconnection_deadlines: HashMap::new(),
            disconnection_deadlines: HashMap::new(),
            sending: HashMap::new(),
            reconnection_timeout,
            disconnection_timeout,
        }
    }

    /// Connected and reconnecting peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.channels.values().map(|c| c.peer().clone()).collect()
    }

    pub fn peer_count(&self) -> usize {
        self.channels.len()
    }

    pub fn contains(&self, device: DeviceAddress) -> bool {
        self.channels.contains_key(&device)
    }

    pub fn peer(&self, device: DeviceAddress) -> Option<&Peer> {
        self.channels.get(&device).map(Channel::peer)
    }

    pub fn peer_mut(&mut self, device: DeviceAddress) -> Option<&mut Peer> {
        self.channels.get_mut(&device).map(Channel::peer_mut)
    }

    pub fn find_by_name(&self, unique_name: &str) -> Option<DeviceAddress> {
        self.channels
            .values()
            .find(|c| c.peer().unique_name() == unique_name)
            .map(|c| c.peer().device())
    }

    /// Device of the reconnecting peer with this unique name.
    pub fn find_reconnecting(&self, unique_name: &str) -> Option<DeviceAddress> {
        self.channels
            .values()
            .find(|c| c.peer().reconnecting && c.peer().unique_name() == unique_name)
            .map(|c| c.peer().device())
    }

    pub fn has_reconnecting(&self) -> bool {
        !self.reconnection_deadlines.is_empty()
    }

    /// Start tracking a freshly connected peer; returns the tracked copy.
    pub fn add_channel(&mut self, peer: Peer, mtu: usize) -> Peer {
        info!(
            "{} channel open with {} ({})",
            self.role,
            peer.unique_name(),
            peer.device()
        );
        let device = peer.device();
        let tracked = peer.clone();
        self.channels.insert(device, Channel::new(peer, self.role, mtu));
        tracked
    }

    pub fn set_mtu(&mut self, device: DeviceAddress, mtu: usize) -> bool {
        match self.channels.get_mut(&device) {
            Some(channel) => {
                channel.set_mtu(mtu);
                true
            }
            None => false,
        }
    }

    /// Start sending `message` on every matching fully connected channel.
    ///
    /// Returns `false` when no channel was targeted, in which case no
    /// `SendCompleted` will follow.
    pub fn send(
        &mut self,
        kind: LinkKind,
        message: &Message,
        adapter: &mut dyn BluetoothAdapter,
    ) -> bool {
        let targets: Vec<DeviceAddress> = self
            .channels
            .values()
            .filter(|c| c.peer().is_fully_connected() && !c.peer().disconnecting)
            .filter(|c| message.receiver().map_or(true, |r| r == c.peer()))
            .map(|c| c.peer().device())
            .collect();

        let mut in_flight = HashSet::new();
        for device in targets {
            if let Some(channel) = self.channels.get_mut(&device) {
                match channel.send(kind, message, adapter) {
                    Ok(()) => {
                        in_flight.insert(device);
                    }
                    Err(e) => warn!("Cannot send to {}: {}", channel.peer().unique_name(), e),
                }
            }
        }

        if in_flight.is_empty() {
            self.sending.remove(&kind);
            false
        } else {
            self.sending.insert(kind, in_flight);
            true
        }
    }

    fn finish_send(&mut self, device: DeviceAddress, kind: LinkKind) -> Option<ConnectionEvent> {
        let remaining = self.sending.get_mut(&kind)?;
        if remaining.remove(&device) && remaining.is_empty() {
            self.sending.remove(&kind);
            return Some(ConnectionEvent::SendCompleted(kind));
        }
        None
    }

    fn abort_sends(&mut self, device: DeviceAddress) -> Vec<ConnectionEvent> {
        if let Some(channel) = self.channels.get_mut(&device) {
            channel.cancel_all();
        }
        [LinkKind::Message, LinkKind::Data]
            .into_iter()
            .filter_map(|kind| self.finish_send(device, kind))
            .collect()
    }

    /// Discard every outbound send without reporting completion.
    pub fn cancel_sends(&mut self) {
        for channel in self.channels.values_mut() {
            channel.cancel_all();
        }
        self.sending.clear();
    }

    fn remove_channel(&mut self, device: DeviceAddress) -> Vec<ConnectionEvent> {
        let mut events = self.abort_sends(device);
        self.reconnection_deadlines.remove(&device);
        self.disconnection_deadlines.remove(&device);

        if let Some(channel) = self.channels.remove(&device) {
            let mut peer = channel.peer().clone();
            peer.hardware_connected = false;
            peer.connected = false;
            peer.reconnecting = false;
            peer.requesting_reconnection = false;
            peer.disconnecting = false;
            info!(
                "{} channel closed with {} ({})",
                self.role,
                peer.unique_name(),
                peer.device()
            );
            events.push(ConnectionEvent::Disconnected(peer));
        }
        events
    }

    pub fn on_write_completed(
        &mut self,
        device: DeviceAddress,
        kind: LinkKind,
        success: bool,
        adapter: &mut dyn BluetoothAdapter,
        now: Instant,
    ) -> Vec<ConnectionEvent> {
        match kind {
            LinkKind::Message | LinkKind::Data => {
                let done = self
                    .channels
                    .get_mut(&device)
                    .map(|c| c.on_write_completed(kind, success, adapter))
                    .unwrap_or(false);
                if done {
                    return self.finish_send(device, kind).into_iter().collect();
                }
            }
            LinkKind::Disconnection => {
                let disconnecting = self.peer(device).map_or(false, |p| p.disconnecting);
                if disconnecting {
                    debug!("Disconnection notice delivered to {}, closing link", device);
                    adapter.disconnect(self.role, device);
                    self.disconnection_deadlines
                        .insert(device, now + self.disconnection_timeout);
                }
            }
            _ => {}
        }
        Vec::new()
    }

    pub fn on_frame(
        &mut self,
        device: DeviceAddress,
        kind: LinkKind,
        data: &[u8],
        adapter: &mut dyn BluetoothAdapter,
        now: Instant,
    ) -> Vec<ConnectionEvent> {
        let role = self.role;
        let Some(channel) = self.channels.get_mut(&device) else {
            debug!("{:?} frame from untracked device {}", kind, device);
            return Vec::new();
        };

        match kind {
            LinkKind::Message => channel
                .on_frame(kind, data)
                .map(ConnectionEvent::MessageReceived)
                .into_iter()
                .collect(),
            LinkKind::Data => channel
                .on_frame(kind, data)
                .map(ConnectionEvent::DataReceived)
                .into_iter()
                .collect(),
            LinkKind::NameUpdate => {
                let unique_name = String::from_utf8_lossy(data).into_owned();
                if unique_name.is_empty() || unique_name == channel.peer().unique_name() {
                    return Vec::new();
                }
                let old = channel.peer().clone();
                channel.peer_mut().set_unique_name(unique_name);
                let new = channel.peer().clone();
                info!("{} renamed to {}", old.unique_name(), new.unique_name());
                vec![ConnectionEvent::PeerUpdated { old, new }]
            }
            LinkKind::Disconnection => {
                info!("{} is disconnecting", channel.peer().unique_name());
                channel.peer_mut().disconnecting = true;
                let events = self.abort_sends(device);
                adapter.disconnect(role, device);
                self.disconnection_deadlines
                    .insert(device, now + self.disconnection_timeout);
                events
            }
            _ => Vec::new(),
        }
    }

    /// Handle the end of a physical link.
    pub fn on_link_down(&mut self, device: DeviceAddress, now: Instant) -> Vec<ConnectionEvent> {
        let Some(channel) = self.channels.get_mut(&device) else {
            return Vec::new();
        };
        self.disconnection_deadlines.remove(&device);

        let peer = channel.peer();
        if peer.disconnecting || !peer.connected {
            return self.remove_channel(device);
        }
        if peer.reconnecting {
            return Vec::new();
        }

        channel.reset_reassembly();
        let peer = channel.peer_mut();
        peer.reconnecting = true;
        peer.hardware_connected = false;
        let lost = peer.clone();

        warn!(
            "{} connection with {} lost, waiting for reconnection",
            self.role,
            lost.unique_name()
        );
        let mut events = self.abort_sends(device);
        self.reconnection_deadlines
            .insert(device, now + self.reconnection_timeout);
        events.push(ConnectionEvent::ConnectionLost(lost));
        events
    }

    /// Start a graceful disconnection. `None` when the device is not tracked.
    pub fn disconnect(
        &mut self,
        device: DeviceAddress,
        adapter: &mut dyn BluetoothAdapter,
    ) -> Option<Vec<ConnectionEvent>> {
        let peer = self.peer(device)?;
        if peer.disconnecting {
            return Some(Vec::new());
        }
        if !peer.hardware_connected {
            // No link to notify: a reconnecting peer is dropped right away.
            return Some(self.remove_channel(device));
        }

        info!("Disconnecting from {} ({})", peer.unique_name(), self.role);
        if let Some(peer) = self.peer_mut(device) {
            peer.disconnecting = true;
        }
        let events = self.abort_sends(device);
        adapter.write(self.role, device, LinkKind::Disconnection, Vec::new());
        Some(events)
    }

    /// Bring a reconnecting peer back, possibly under a new address.
    pub fn resume(
        &mut self,
        old_device: DeviceAddress,
        new_device: DeviceAddress,
        mtu: usize,
    ) -> Vec<ConnectionEvent> {
        let Some(mut channel) = self.channels.remove(&old_device) else {
            return Vec::new();
        };
        self.reconnection_deadlines.remove(&old_device);

        let old = channel.peer().clone();
        {
            let peer = channel.peer_mut();
            peer.set_device(new_device);
            peer.reconnecting = false;
            peer.requesting_reconnection = false;
            peer.hardware_connected = true;
            peer.connected = true;
        }
        channel.set_mtu(mtu);
        let new = channel.peer().clone();
        self.channels.insert(new_device, channel);

        info!("{} connection with {} resumed", self.role, new.unique_name());
        let mut events = Vec::new();
        if old.device() != new_device {
            events.push(ConnectionEvent::PeerUpdated {
                old,
                new: new.clone(),
            });
        }
        events.push(ConnectionEvent::ConnectionResumed(new));
        events
    }

    /// Expire reconnection and disconnection deadlines.
    pub fn tick(&mut self, now: Instant) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();

        let expired: Vec<DeviceAddress> = self
            .reconnection_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(device, _)| *device)
            .collect();
        for device in expired {
            warn!("Reconnection with {} timed out", device);
            events.extend(self.remove_channel(device));
        }

        let stuck: Vec<DeviceAddress> = self
            .disconnection_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(device, _)| *device)
            .collect();
        for device in stuck {
            self.disconnection_deadlines.remove(&device);
            if let Some(peer) = self.peer(device) {
                warn!("Disconnection from {} was never confirmed", peer.unique_name());
                events.push(ConnectionEvent::DisconnectionFailed(peer.clone()));
            }
        }

        events
    }

    /// Every physical link is gone with the adapter.
    pub fn on_adapter_off(&mut self, now: Instant) -> Vec<ConnectionEvent> {
        let linked: Vec<DeviceAddress> = self
            .channels
            .values()
            .filter(|c| c.peer().hardware_connected)
            .map(|c| c.peer().device())
            .collect();

        linked
            .into_iter()
            .flat_map(|device| self.on_link_down(device, now))
            .collect()
    }

    /// Tell every connected peer about our new unique name.
    pub fn update_name(&mut self, unique_name: &str, adapter: &mut dyn BluetoothAdapter) {
        for channel in self.channels.values() {
            let peer = channel.peer();
            if peer.hardware_connected && peer.connected && !peer.disconnecting {
                adapter.write(
                    self.role,
                    peer.device(),
                    LinkKind::NameUpdate,
                    unique_name.as_bytes().to_vec(),
                );
            }
        }
    }

    /// Close every link without emitting events.
    pub fn destroy(&mut self, adapter: &mut dyn BluetoothAdapter) {
        for channel in self.channels.values() {
            if channel.peer().hardware_connected {
                adapter.disconnect(self.role, channel.peer().device());
            }
        }
        self.channels.clear();
        self.reconnection_deadlines.clear();
        self.disconnection_deadlines.clear();
        self.sending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::testing::{AdapterCall, FakeAdapter};

    const PEER_A: DeviceAddress = DeviceAddress::new([0, 0, 0, 0, 0, 0xA]);
    const PEER_B: DeviceAddress = DeviceAddress::new([0, 0, 0, 0, 0, 0xB]);

    fn connection() -> Connection {
        Connection::new(Role::Server, Duration::from_secs(20), Duration::from_secs(5))
    }

    fn connected(name: &str, device: DeviceAddress) -> Peer {
        let mut peer = Peer::new(name, device);
        peer.hardware_connected = true;
        peer.connected = true;
        peer
    }

    #[test]
    fn test_link_loss_starts_reconnection() {
        let mut conn = connection();
        conn.add_channel(connected("Phone07", PEER_A), 23);

        let now = Instant::now();
        let events = conn.on_link_down(PEER_A, now);
        assert!(matches!(events.as_slice(), [ConnectionEvent::ConnectionLost(p)] if p.device() == PEER_A));
        assert!(conn.has_reconnecting());

        let peer = conn.peer(PEER_A).unwrap();
        assert!(peer.is_reconnecting());
        assert!(!peer.is_fully_connected());
        assert_eq!(ConnectionState::of(peer), ConnectionState::Reconnecting);
        assert_eq!(conn.find_reconnecting("Phone07"), Some(PEER_A));

        // Still waiting before the deadline
        assert!(conn.tick(now + Duration::from_secs(19)).is_empty());

        let events = conn.tick(now + Duration::from_secs(20));
        assert!(matches!(events.as_slice(), [ConnectionEvent::Disconnected(p)] if !p.is_connected()));
        assert_eq!(conn.peer_count(), 0);
        assert!(!conn.has_reconnecting());
    }

    #[test]
    fn test_resume_with_new_address() {
        let mut conn = connection();
        conn.add_channel(connected("Phone07", PEER_A), 23);
        conn.on_link_down(PEER_A, Instant::now());

        let events = conn.resume(PEER_A, PEER_B, 185);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            ConnectionEvent::PeerUpdated { old, new } if old.device() == PEER_A && new.device() == PEER_B
        ));
        assert!(matches!(&events[1], ConnectionEvent::ConnectionResumed(p) if p.is_fully_connected()));
        assert!(!conn.has_reconnecting());
        assert!(conn.contains(PEER_B));
        assert!(!conn.contains(PEER_A));
    }

    #[test]
    fn test_graceful_disconnect() {
        let mut adapter = FakeAdapter::new();
        let mut conn = connection();
        conn.add_channel(connected("Phone07", PEER_A), 23);

        let events = conn.disconnect(PEER_A, &mut adapter).unwrap();
        assert!(events.is_empty());
        assert_eq!(adapter.writes(LinkKind::Disconnection).len(), 1);

        let now = Instant::now();
        conn.on_write_completed(PEER_A, LinkKind::Disconnection, true, &mut adapter, now);
        assert_eq!(
            adapter.count(&AdapterCall::Disconnect {
                role: Role::Server,
                device: PEER_A
            }),
            1
        );

        let events = conn.on_link_down(PEER_A, now);
        assert!(matches!(events.as_slice(), [ConnectionEvent::Disconnected(_)]));
        assert!(conn.tick(now + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_unconfirmed_disconnection_fails() {
        let mut adapter = FakeAdapter::new();
        let mut conn = connection();
        conn.add_channel(connected("Phone07", PEER_A), 23);

        let now = Instant::now();
        conn.disconnect(PEER_A, &mut adapter).unwrap();
        conn.on_write_completed(PEER_A, LinkKind::Disconnection, true, &mut adapter, now);

        let events = conn.tick(now + Duration::from_secs(5));
        assert!(matches!(events.as_slice(), [ConnectionEvent::DisconnectionFailed(_)]));
    }

    #[test]
    fn test_remote_disconnection_notice() {
        let mut adapter = FakeAdapter::new();
        let mut conn = connection();
        conn.add_channel(connected("Phone07", PEER_A), 23);

        let now = Instant::now();
        conn.on_frame(PEER_A, LinkKind::Disconnection, &[], &mut adapter, now);
        assert!(conn.peer(PEER_A).unwrap().is_disconnecting());

        // The link going down afterwards is not a loss
        let events = conn.on_link_down(PEER_A, now);
        assert!(matches!(events.as_slice(), [ConnectionEvent::Disconnected(_)]));
    }

    #[test]
    fn test_send_completes_after_all_channels() {
        let mut adapter = FakeAdapter::new();
        let mut conn = connection();
        conn.add_channel(connected("Phone07", PEER_A), 23);
        conn.add_channel(connected("Tablet11", PEER_B), 23);

        let now = Instant::now();
        let message = Message::new(b'm', b"short".to_vec());
        assert!(conn.send(LinkKind::Message, &message, &mut adapter));

        let events = conn.on_write_completed(PEER_A, LinkKind::Message, true, &mut adapter, now);
        assert!(events.is_empty());
        let events = conn.on_write_completed(PEER_B, LinkKind::Message, true, &mut adapter, now);
        assert!(matches!(events.as_slice(), [ConnectionEvent::SendCompleted(LinkKind::Message)]));
    }

    #[test]
    fn test_send_to_receiver_only() {
        let mut adapter = FakeAdapter::new();
        let mut conn = connection();
        conn.add_channel(connected("Phone07", PEER_A), 23);
        let tablet = conn.add_channel(connected("Tablet11", PEER_B), 23);

        let message = Message::new(b'm', b"hi".to_vec()).to(tablet);
        assert!(conn.send(LinkKind::Message, &message, &mut adapter));

        let writes = adapter.writes(LinkKind::Message);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].1, PEER_B);
    }

    #[test]
    fn test_link_loss_completes_pending_send() {
        let mut adapter = FakeAdapter::new();
        let mut conn = connection();
        conn.add_channel(connected("Phone07", PEER_A), 23);

        let message = Message::new(b'm', vec![0; 100]);
        assert!(conn.send(LinkKind::Message, &message, &mut adapter));

        let events = conn.on_link_down(PEER_A, Instant::now());
        assert!(matches!(events[0], ConnectionEvent::SendCompleted(LinkKind::Message)));
        assert!(matches!(events[1], ConnectionEvent::ConnectionLost(_)));

        // Reconnecting peers are not targeted
        assert!(!conn.send(LinkKind::Message, &message, &mut adapter));
    }

    #[test]
    fn test_name_update_emits_peer_updated() {
        let mut adapter = FakeAdapter::new();
        let mut conn = connection();
        conn.add_channel(connected("Phone07", PEER_A), 23);

        let events = conn.on_frame(PEER_A, LinkKind::NameUpdate, b"Handset07", &mut adapter, Instant::now());
        assert!(matches!(
            events.as_slice(),
            [ConnectionEvent::PeerUpdated { old, new }]
                if old.unique_name() == "Phone07" && new.unique_name() == "Handset07"
        ));
        assert_eq!(conn.find_by_name("Handset07"), Some(PEER_A));
    }

    #[test]
    fn test_adapter_off_drops_every_link() {
        let mut adapter = FakeAdapter::new();
        let mut conn = connection();
        conn.add_channel(connected("Phone07", PEER_A), 23);
        conn.add_channel(connected("Tablet11", PEER_B), 23);
        conn.disconnect(PEER_B, &mut adapter);

        let events = conn.on_adapter_off(Instant::now());
        let lost = events
            .iter()
            .filter(|e| matches!(e, ConnectionEvent::ConnectionLost(_)))
            .count();
        let gone = events
            .iter()
            .filter(|e| matches!(e, ConnectionEvent::Disconnected(_)))
            .count();
        assert_eq!((lost, gone), (1, 1));
        assert_eq!(conn.peer_count(), 1);
    }
}
