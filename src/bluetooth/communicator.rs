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

//! Top-level orchestrator.
//!
//! [`Communicator`] owns the adapter, both role managers and the outbound
//! queues. It is a plain state machine: it never blocks and never spawns,
//! so it must be driven by a single owner (see [`super::handle`]) that feeds
//! it commands, [`PlatformEvent`]s and periodic [`Communicator::tick`] calls.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::adapter::{
    AdapterState, BluetoothAdapter, DeviceAddress, LinkKind, PlatformEvent, Role, ScanMatch,
};
use super::ble_constants::config::PREFERRED_MTU;
use super::client::ConnectionClient;
use super::connection::{ConnectionEvent, ConnectionState};
use super::peer::{generate_id, is_valid_name, Peer};
use super::protocol::Message;
use super::server::ConnectionServer;
use crate::events::{CommunicatorEvent, EventDispatcher};

/// Logical name used when the configured one cannot be advertised.
pub const DEFAULT_NAME: &str = "Communicator";

/// Synchronous outcome of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BluetoothResult {
    Success,
    Error,
    AlreadyStarted,
    AlreadyStopped,
    Destroying,
    BluetoothLeNotSupported,
}

impl BluetoothResult {
    pub fn is_success(&self) -> bool {
        *self == BluetoothResult::Success
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BluetoothResult::Success => "success",
            BluetoothResult::Error => "error",
            BluetoothResult::AlreadyStarted => "already started",
            BluetoothResult::AlreadyStopped => "already stopped",
            BluetoothResult::Destroying => "destroying",
            BluetoothResult::BluetoothLeNotSupported => "bluetooth le not supported",
        }
    }
}

/// Settings the orchestrator needs.
#[derive(Debug, Clone)]
pub struct CommunicatorConfig {
    /// Logical name; a two digit id is appended to make it unique.
    pub name: String,
    pub preferred_mtu: usize,
    pub connection_timeout: Duration,
    pub reconnection_timeout: Duration,
    pub disconnection_timeout: Duration,
    pub tick_interval: Duration,
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            preferred_mtu: PREFERRED_MTU,
            connection_timeout: Duration::from_secs(10),
            reconnection_timeout: Duration::from_secs(20),
            disconnection_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_millis(250),
        }
    }
}

/// Point-in-time view of the orchestrator.
#[derive(Debug, Clone)]
pub struct CommunicatorSnapshot {
    pub unique_name: String,
    pub bluetooth_state: AdapterState,
    pub advertising: bool,
    pub discovering: bool,
    pub peers: Vec<(Peer, Role, ConnectionState)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Client,
    Server,
}

/// FIFO of outbound items with at most one in flight.
struct SendQueue {
    kind: LinkKind,
    pending: VecDeque<Message>,
    in_flight: Option<Stage>,
}

impl SendQueue {
    fn new(kind: LinkKind) -> Self {
        Self {
            kind,
            pending: VecDeque::new(),
            in_flight: None,
        }
    }

    fn clear(&mut self) {
        if !self.pending.is_empty() {
            debug!("Discarding {} queued {:?} items", self.pending.len(), self.kind);
        }
        self.pending.clear();
        self.in_flight = None;
    }
}

pub struct Communicator<A: BluetoothAdapter> {
    adapter: A,
    client: ConnectionClient,
    server: ConnectionServer,
    dispatcher: EventDispatcher,

    name: String,
    unique_id: String,

    // Requested by the application
    advertising: bool,
    discovering: bool,

    // Adapter power sequencing
    bluetooth_state: AdapterState,
    original_bluetooth_state: Option<AdapterState>,
    turning_on_bluetooth: bool,
    turning_off_bluetooth: bool,
    restarting_bluetooth: bool,
    initializing_connection: bool,
    destroying: bool,
    destroyed: bool,

    // What the platform is actually doing
    advertise_active: bool,
    advertise_confirmed: bool,
    advertise_blocked: bool,
    scan_active: bool,
    scan_blocked: bool,
    advertise_announced: bool,
    discovery_announced: bool,
    original_name: Option<String>,

    message_queue: SendQueue,
    data_queue: SendQueue,
    found_peers: HashMap<DeviceAddress, Peer>,
    destroy_waiters: Vec<oneshot::Sender<()>>,
}

impl<A: BluetoothAdapter> Communicator<A> {
    pub fn new(adapter: A, config: &CommunicatorConfig) -> Self {
        let name = if is_valid_name(&config.name) {
            config.name.clone()
        } else {
            warn!("Invalid name '{}', using '{}'", config.name, DEFAULT_NAME);
            DEFAULT_NAME.to_string()
        };
        let unique_id = generate_id();
        let bluetooth_state = adapter.state();
        let max_server_links = adapter.max_server_links();
        info!("Communicator ready as {}{}", name, unique_id);

        Self {
            adapter,
            client: ConnectionClient::new(config),
            server: ConnectionServer::new(config, max_server_links),
            dispatcher: EventDispatcher::new(),
            name,
            unique_id,
            advertising: false,
            discovering: false,
            bluetooth_state,
            original_bluetooth_state: None,
            turning_on_bluetooth: false,
            turning_off_bluetooth: false,
            restarting_bluetooth: false,
            initializing_connection: false,
            destroying: false,
            destroyed: false,
            advertise_active: false,
            advertise_confirmed: false,
            advertise_blocked: false,
            scan_active: false,
            scan_blocked: false,
            advertise_announced: false,
            discovery_announced: false,
            original_name: None,
            message_queue: SendQueue::new(LinkKind::Message),
            data_queue: SendQueue::new(LinkKind::Data),
            found_peers: HashMap::new(),
            destroy_waiters: Vec::new(),
        }
    }

    /// Register a listener for every [`CommunicatorEvent`].
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<CommunicatorEvent> {
        self.dispatcher.subscribe()
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut A {
        &mut self.adapter
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unique_name(&self) -> String {
        format!("{}{}", self.name, self.unique_id)
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering
    }

    pub fn bluetooth_state(&self) -> AdapterState {
        self.bluetooth_state
    }

    pub fn original_bluetooth_state(&self) -> Option<AdapterState> {
        self.original_bluetooth_state
    }

    pub fn is_turning_on_bluetooth(&self) -> bool {
        self.turning_on_bluetooth
    }

    pub fn is_turning_off_bluetooth(&self) -> bool {
        self.turning_off_bluetooth
    }

    pub fn is_restarting_bluetooth(&self) -> bool {
        self.restarting_bluetooth
    }

    pub fn is_initializing_connection(&self) -> bool {
        self.initializing_connection
    }

    pub fn is_destroying(&self) -> bool {
        self.destroying
    }

    /// Destroy completed; nothing more will happen.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Peers tracked by either role, including reconnecting ones.
    pub fn connected_peers(&self) -> Vec<Peer> {
        let mut peers = self.client.connection().peers();
        peers.extend(self.server.connection().peers());
        peers
    }

    pub fn peer_count(&self) -> usize {
        self.client.connection().peer_count() + self.server.connection().peer_count()
    }

    pub fn queued_messages(&self) -> usize {
        self.message_queue.pending.len()
    }

    pub fn queued_data(&self) -> usize {
        self.data_queue.pending.len()
    }

    pub fn snapshot(&self) -> CommunicatorSnapshot {
        let mut peers: Vec<(Peer, Role, ConnectionState)> = Vec::new();
        for (role, connection) in [
            (Role::Client, self.client.connection()),
            (Role::Server, self.server.connection()),
        ] {
            peers.extend(connection.peers().into_iter().map(|peer| {
                let state = ConnectionState::of(&peer);
                (peer, role, state)
            }));
        }

        CommunicatorSnapshot {
            unique_name: self.unique_name(),
            bluetooth_state: self.bluetooth_state,
            advertising: self.advertising,
            discovering: self.discovering,
            peers,
        }
    }

    fn emit(&mut self, event: CommunicatorEvent) {
        self.dispatcher.emit(event);
    }

    fn record_original_state(&mut self) {
        if self.original_bluetooth_state.is_none() {
            let original = match self.bluetooth_state {
                AdapterState::On | AdapterState::TurningOn => AdapterState::On,
                AdapterState::Off | AdapterState::TurningOff => AdapterState::Off,
            };
            debug!("Original Bluetooth state: {:?}", original);
            self.original_bluetooth_state = Some(original);
        }
    }

    /// Connect attempts and connection requests not yet settled.
    fn has_pending_connections(&self) -> bool {
        self.client.has_pending() || self.server.has_requests()
    }

    /// Whether anything still needs the adapter powered.
    fn wants_bluetooth(&self) -> bool {
        !self.destroying
            && (self.advertising
                || self.discovering
                || self.restarting_bluetooth
                || self.has_pending_connections()
                || self.client.connection().has_reconnecting()
                || self.server.connection().has_reconnecting())
    }

    fn enable_bluetooth(&mut self) {
        if self.bluetooth_state != AdapterState::Off || self.turning_on_bluetooth {
            return;
        }
        info!("Turning Bluetooth on");
        if self.adapter.enable() {
            self.turning_on_bluetooth = true;
        } else {
            error!("Bluetooth could not be turned on");
        }
    }

    fn disable_bluetooth(&mut self) {
        if self.turning_off_bluetooth {
            return;
        }
        self.turning_off_bluetooth = true;
        self.sync_radio();
        if !self.adapter.disable() {
            error!("Bluetooth could not be turned off");
            self.turning_off_bluetooth = false;
        }
    }

    /// Turn the adapter back off if we turned it on and nothing uses it.
    fn restore_bluetooth_status(&mut self) {
        let restore = self.original_bluetooth_state == Some(AdapterState::Off)
            && !self.advertising
            && !self.discovering
            && self.peer_count() == 0
            && !self.has_pending_connections()
            && self.bluetooth_state == AdapterState::On
            && !self.turning_off_bluetooth
            && !self.restarting_bluetooth
            && !self.destroying;

        if restore {
            info!("Nothing uses Bluetooth anymore, restoring it to off");
            self.disable_bluetooth();
        }
    }

    fn restart_bluetooth(&mut self) {
        if self.restarting_bluetooth || self.destroying {
            return;
        }
        warn!("Restarting Bluetooth to clear a stuck link");
        self.restarting_bluetooth = true;
        match self.bluetooth_state {
            AdapterState::Off => self.enable_bluetooth(),
            _ => {
                self.turning_off_bluetooth = false;
                self.disable_bluetooth();
            }
        }
    }

    /// Reconcile platform advertising and scanning with what is wanted.
    fn sync_radio(&mut self) {
        self.initializing_connection = self.client.is_connecting();

        let ready = self.bluetooth_state == AdapterState::On
            && !self.restarting_bluetooth
            && !self.turning_off_bluetooth
            && !self.destroying;

        let want_advertise = ready
            && !self.advertise_blocked
            && (self.advertising || self.server.connection().has_reconnecting());
        if want_advertise && !self.advertise_active {
            let unique_name = self.unique_name();
            if self.original_name.is_none() {
                self.original_name = Some(self.adapter.name());
            }
            self.adapter.set_name(&unique_name);
            debug!("Starting advertising as {}", unique_name);
            self.adapter.start_advertising(&unique_name);
            self.advertise_active = true;
        } else if !want_advertise && self.advertise_active {
            debug!("Stopping advertising");
            self.adapter.stop_advertising();
            self.advertise_active = false;
            self.advertise_confirmed = false;
        }
        if !self.advertise_active && self.bluetooth_state == AdapterState::On {
            if let Some(name) = self.original_name.take() {
                self.adapter.set_name(&name);
            }
        }

        let want_scan = ready
            && !self.scan_blocked
            && !self.initializing_connection
            && (self.discovering || self.client.connection().has_reconnecting());
        if want_scan && !self.scan_active {
            debug!("Starting scan");
            self.adapter.start_scan();
            self.scan_active = true;
        } else if !want_scan && self.scan_active {
            debug!("Stopping scan");
            self.adapter.stop_scan();
            self.scan_active = false;
        }

        self.announce();
    }

    /// Report radio changes the application can observe.
    fn announce(&mut self) {
        if self.advertising && self.advertise_confirmed && !self.advertise_announced {
            self.advertise_announced = true;
            info!("Advertising as {}", self.unique_name());
            self.emit(CommunicatorEvent::AdvertiseStarted);
        } else if !self.advertising && self.advertise_announced {
            self.advertise_announced = false;
            info!("Advertising stopped");
            self.emit(CommunicatorEvent::AdvertiseStopped);
        }

        if self.discovering && self.scan_active && !self.discovery_announced {
            self.discovery_announced = true;
            info!("Discovery started");
            self.emit(CommunicatorEvent::DiscoveryStarted);
        } else if !self.discovering && self.discovery_announced {
            self.discovery_announced = false;
            info!("Discovery stopped");
            self.emit(CommunicatorEvent::DiscoveryStopped);
        }
    }

    fn check_le_support(&mut self) -> bool {
        if self.adapter.is_le_supported() {
            return true;
        }
        error!("Bluetooth Low Energy is not supported");
        self.emit(CommunicatorEvent::BluetoothLeNotSupported);
        false
    }

    pub fn start_advertising(&mut self) -> BluetoothResult {
        if self.destroying {
            return BluetoothResult::Destroying;
        }
        if !self.check_le_support() {
            return BluetoothResult::BluetoothLeNotSupported;
        }
        if self.advertising {
            return BluetoothResult::AlreadyStarted;
        }

        self.record_original_state();
        self.advertising = true;
        self.advertise_blocked = false;
        self.enable_bluetooth();
        self.sync_radio();
        BluetoothResult::Success
    }

    pub fn stop_advertising(&mut self, restore_bluetooth_status: bool) -> BluetoothResult {
        if self.destroying {
            return BluetoothResult::Destroying;
        }
        if !self.advertising {
            return BluetoothResult::AlreadyStopped;
        }

        self.advertising = false;
        self.sync_radio();
        if restore_bluetooth_status {
            self.restore_bluetooth_status();
        }
        BluetoothResult::Success
    }

    pub fn start_discovery(&mut self) -> BluetoothResult {
        if self.destroying {
            return BluetoothResult::Destroying;
        }
        if !self.check_le_support() {
            return BluetoothResult::BluetoothLeNotSupported;
        }
        if self.discovering {
            return BluetoothResult::AlreadyStarted;
        }

        self.record_original_state();
        self.discovering = true;
        self.scan_blocked = false;
        self.enable_bluetooth();
        self.sync_radio();
        BluetoothResult::Success
    }

    pub fn stop_discovery(&mut self, restore_bluetooth_status: bool) -> BluetoothResult {
        if self.destroying {
            return BluetoothResult::Destroying;
        }
        if !self.discovering {
            return BluetoothResult::AlreadyStopped;
        }

        self.discovering = false;
        self.found_peers.clear();
        self.sync_radio();
        if restore_bluetooth_status {
            self.restore_bluetooth_status();
        }
        BluetoothResult::Success
    }

    pub fn connect(&mut self, peer: &Peer) -> BluetoothResult {
        if self.destroying {
            return BluetoothResult::Destroying;
        }
        self.record_original_state();
        if self.bluetooth_state != AdapterState::On {
            warn!("Cannot connect to {} while Bluetooth is off", peer.unique_name());
            return BluetoothResult::Error;
        }
        if self.server.connection().contains(peer.device()) {
            warn!("{} is already connected to us", peer.unique_name());
            return BluetoothResult::Error;
        }

        let started = self
            .client
            .connect(peer, &mut self.adapter, Instant::now());
        self.sync_radio();
        if started {
            BluetoothResult::Success
        } else {
            BluetoothResult::Error
        }
    }

    pub fn accept_connection(&mut self, peer: &Peer) -> BluetoothResult {
        if self.destroying {
            return BluetoothResult::Destroying;
        }
        match self.server.accept(peer, &mut self.adapter) {
            Some(events) => {
                self.handle_connection_events(Role::Server, events);
                BluetoothResult::Success
            }
            None => {
                warn!("No connection request from {}", peer.unique_name());
                BluetoothResult::Error
            }
        }
    }

    pub fn reject_connection(&mut self, peer: &Peer) -> BluetoothResult {
        if self.destroying {
            return BluetoothResult::Destroying;
        }
        if self.server.reject(peer, &mut self.adapter) {
            BluetoothResult::Success
        } else {
            warn!("No connection request from {}", peer.unique_name());
            BluetoothResult::Error
        }
    }

    fn disconnect_device(&mut self, device: DeviceAddress) -> bool {
        if let Some(events) = self.client.disconnect(device, &mut self.adapter) {
            self.handle_connection_events(Role::Client, events);
            return true;
        }
        if let Some(events) = self.server.disconnect(device, &mut self.adapter) {
            self.handle_connection_events(Role::Server, events);
            return true;
        }
        false
    }

    pub fn disconnect(&mut self, peer: &Peer) -> BluetoothResult {
        if self.destroying {
            return BluetoothResult::Destroying;
        }
        let found = self.disconnect_device(peer.device());
        if !found {
            debug!("{} is not connected", peer.unique_name());
        }
        self.sync_radio();
        self.restore_bluetooth_status();
        if found {
            BluetoothResult::Success
        } else {
            BluetoothResult::Error
        }
    }

    pub fn disconnect_from_all(&mut self) -> BluetoothResult {
        if self.destroying {
            return BluetoothResult::Destroying;
        }
        let devices: Vec<DeviceAddress> = self
            .connected_peers()
            .iter()
            .map(Peer::device)
            .chain(self.server.pending_requests().iter().map(Peer::device))
            .collect();
        info!("Disconnecting from {} peers", devices.len());
        for device in devices {
            self.disconnect_device(device);
        }
        self.sync_radio();
        self.restore_bluetooth_status();
        BluetoothResult::Success
    }

    /// Queue a message; messages are delivered one at a time in order.
    pub fn send_message(&mut self, message: Message) -> BluetoothResult {
        self.enqueue(LinkKind::Message, message)
    }

    /// Queue out-of-band data, independent of the message queue.
    pub fn send_data(&mut self, data: Message) -> BluetoothResult {
        self.enqueue(LinkKind::Data, data)
    }

    fn enqueue(&mut self, kind: LinkKind, message: Message) -> BluetoothResult {
        if self.destroying {
            return BluetoothResult::Destroying;
        }
        self.queue_mut(kind).pending.push_back(message);
        self.pump(kind);
        BluetoothResult::Success
    }

    fn queue_mut(&mut self, kind: LinkKind) -> &mut SendQueue {
        match kind {
            LinkKind::Data => &mut self.data_queue,
            _ => &mut self.message_queue,
        }
    }

    fn send_stage(&mut self, stage: Stage, kind: LinkKind, message: &Message) -> bool {
        match stage {
            Stage::Client => self
                .client
                .connection_mut()
                .send(kind, message, &mut self.adapter),
            Stage::Server => self
                .server
                .connection_mut()
                .send(kind, message, &mut self.adapter),
        }
    }

    /// Start the next queued item unless one is in flight.
    fn pump(&mut self, kind: LinkKind) {
        loop {
            let queue = self.queue_mut(kind);
            if queue.in_flight.is_some() {
                return;
            }
            let Some(message) = queue.pending.front().cloned() else {
                return;
            };

            for stage in [Stage::Client, Stage::Server] {
                if self.send_stage(stage, kind, &message) {
                    self.queue_mut(kind).in_flight = Some(stage);
                    return;
                }
            }

            debug!("{:?} item reached no channel", kind);
            self.queue_mut(kind).pending.pop_front();
        }
    }

    fn on_send_completed(&mut self, role: Role, kind: LinkKind) {
        let queue = self.queue_mut(kind);
        let stage = match (queue.in_flight, role) {
            (Some(Stage::Client), Role::Client) => Stage::Client,
            (Some(Stage::Server), Role::Server) => Stage::Server,
            _ => {
                debug!("Stale {:?} completion from {} side", kind, role);
                return;
            }
        };
        queue.in_flight = None;

        if stage == Stage::Client {
            if let Some(message) = self.queue_mut(kind).pending.front().cloned() {
                if self.send_stage(Stage::Server, kind, &message) {
                    self.queue_mut(kind).in_flight = Some(Stage::Server);
                    return;
                }
            }
        }

        self.queue_mut(kind).pending.pop_front();
        self.pump(kind);
    }

    fn reset_queues(&mut self) {
        self.message_queue.clear();
        self.data_queue.clear();
        self.client.connection_mut().cancel_sends();
        self.server.connection_mut().cancel_sends();
    }

    /// Change the logical name; connected peers are told about it.
    pub fn set_name(&mut self, name: &str) -> BluetoothResult {
        if self.destroying {
            return BluetoothResult::Destroying;
        }
        if !is_valid_name(name) {
            warn!("Invalid name '{}'", name);
            return BluetoothResult::Error;
        }
        if name == self.name {
            return BluetoothResult::Success;
        }

        self.name = name.to_string();
        let unique_name = self.unique_name();
        info!("Name changed, now {}", unique_name);

        if self.advertise_active {
            self.adapter.stop_advertising();
            self.adapter.set_name(&unique_name);
            self.adapter.start_advertising(&unique_name);
            self.advertise_confirmed = false;
        }
        self.client
            .connection_mut()
            .update_name(&unique_name, &mut self.adapter);
        self.server
            .connection_mut()
            .update_name(&unique_name, &mut self.adapter);
        BluetoothResult::Success
    }

    /// Tear everything down; `done` fires once the adapter reports off.
    pub fn destroy(&mut self, done: oneshot::Sender<()>) -> BluetoothResult {
        if self.destroyed {
            let _ = done.send(());
            return BluetoothResult::Destroying;
        }
        self.destroy_waiters.push(done);
        if self.destroying {
            return BluetoothResult::Destroying;
        }

        info!("Destroying communicator");
        self.record_original_state();
        self.destroying = true;
        self.advertising = false;
        self.discovering = false;
        self.sync_radio();

        self.client.destroy(&mut self.adapter);
        self.server.destroy(&mut self.adapter);
        self.message_queue.clear();
        self.data_queue.clear();
        self.found_peers.clear();

        if self.bluetooth_state == AdapterState::Off {
            self.finish_destroy();
        } else if !self.turning_off_bluetooth {
            self.turning_off_bluetooth = true;
            if !self.adapter.disable() {
                error!("Bluetooth could not be turned off, completing destroy now");
                self.finish_destroy();
            }
        }
        BluetoothResult::Success
    }

    fn finish_destroy(&mut self) {
        info!("Communicator destroyed");
        self.destroyed = true;
        self.turning_off_bluetooth = false;
        for waiter in self.destroy_waiters.drain(..) {
            let _ = waiter.send(());
        }
        if self.original_bluetooth_state == Some(AdapterState::On) {
            info!("Turning Bluetooth back on");
            self.adapter.enable();
        }
    }

    /// Feed one platform notification.
    pub fn handle_platform_event(&mut self, event: PlatformEvent) {
        if self.destroyed {
            return;
        }
        let now = Instant::now();

        match event {
            PlatformEvent::AdapterStateChanged(state) => self.on_adapter_state(state, now),
            event if self.destroying => debug!("Ignoring {:?} while destroying", event),
            PlatformEvent::AdvertiseStarted => {
                if self.advertise_active {
                    debug!("Platform advertising started");
                    self.advertise_confirmed = true;
                    self.announce();
                }
            }
            PlatformEvent::AdvertiseFailed(code) => {
                error!("Advertising failed with code {}", code);
                self.advertise_active = false;
                self.advertise_confirmed = false;
                self.advertise_blocked = true;
                if self.advertising {
                    self.advertising = false;
                    self.advertise_announced = false;
                    self.emit(CommunicatorEvent::AdvertiseFailed(code));
                }
                self.sync_radio();
            }
            PlatformEvent::ScanFailed(code) => {
                error!("Scan failed with code {}", code);
                self.scan_active = false;
                self.scan_blocked = true;
                if self.discovering {
                    self.discovering = false;
                    self.discovery_announced = false;
                    self.emit(CommunicatorEvent::DiscoveryFailed(code));
                }
                self.sync_radio();
            }
            PlatformEvent::ScanResult { kind, device, name } => {
                self.on_scan_result(kind, device, name, now)
            }
            PlatformEvent::LinkUp { role, device } => {
                match role {
                    Role::Client => {
                        let unique_name = self.unique_name();
                        self.client
                            .on_link_up(device, &unique_name, &mut self.adapter)
                    }
                    Role::Server => self.server.on_link_up(device, &mut self.adapter),
                }
            }
            PlatformEvent::LinkDown { role, device } => {
                debug!("{} link to {} down", role, device);
                let events = match role {
                    Role::Client => self.client.on_link_down(device, now),
                    Role::Server => self.server.on_link_down(device, now),
                };
                self.handle_connection_events(role, events);
            }
            PlatformEvent::ConnectFailed { device, code } => {
                let events = self.client.on_connect_failed(device, code);
                self.handle_connection_events(Role::Client, events);
            }
            PlatformEvent::FrameReceived {
                role,
                device,
                kind,
                data,
            } => {
                let events = match role {
                    Role::Client => {
                        self.client
                            .on_frame(device, kind, &data, &mut self.adapter, now)
                    }
                    Role::Server => {
                        self.server
                            .on_frame(device, kind, &data, &mut self.adapter, now)
                    }
                };
                self.handle_connection_events(role, events);
            }
            PlatformEvent::WriteCompleted {
                role,
                device,
                kind,
                success,
            } => {
                let events = match role {
                    Role::Client => self.client.on_write_completed(
                        device,
                        kind,
                        success,
                        &mut self.adapter,
                        now,
                    ),
                    Role::Server => self.server.on_write_completed(
                        device,
                        kind,
                        success,
                        &mut self.adapter,
                        now,
                    ),
                };
                self.handle_connection_events(role, events);
            }
            PlatformEvent::MtuChanged { role, device, mtu } => match role {
                Role::Client => self.client.on_mtu_changed(device, mtu),
                Role::Server => self.server.on_mtu_changed(device, mtu),
            },
            PlatformEvent::PhyRead {
                role,
                device,
                tx_phy,
                rx_phy,
            } => {
                debug!("{} link to {}: tx phy {}, rx phy {}", role, device, tx_phy, rx_phy);
            }
        }
    }

    /// Expire connection, reconnection and disconnection deadlines.
    pub fn tick(&mut self, now: Instant) {
        if self.destroying {
            return;
        }
        let events = self.client.tick(now, &mut self.adapter);
        self.handle_connection_events(Role::Client, events);
        let events = self.server.tick(now);
        self.handle_connection_events(Role::Server, events);
    }

    fn on_adapter_state(&mut self, state: AdapterState, now: Instant) {
        if state == self.bluetooth_state {
            return;
        }
        debug!("Bluetooth state {:?} -> {:?}", self.bluetooth_state, state);
        self.bluetooth_state = state;

        match state {
            AdapterState::On => {
                info!("Bluetooth is on");
                self.turning_on_bluetooth = false;
                self.restarting_bluetooth = false;
                self.advertise_blocked = false;
                self.scan_blocked = false;
                if self.destroying {
                    return;
                }
                self.sync_radio();
            }
            AdapterState::Off => {
                info!("Bluetooth is off");
                self.turning_off_bluetooth = false;
                self.turning_on_bluetooth = false;
                self.advertise_active = false;
                self.advertise_confirmed = false;
                self.scan_active = false;

                if self.destroying {
                    self.finish_destroy();
                    return;
                }

                let events = self.client.on_adapter_off(now);
                self.handle_connection_events(Role::Client, events);
                let events = self.server.on_adapter_off(now);
                self.handle_connection_events(Role::Server, events);

                if self.wants_bluetooth() {
                    self.enable_bluetooth();
                }
            }
            AdapterState::TurningOn | AdapterState::TurningOff => {}
        }
    }

    fn on_scan_result(&mut self, kind: ScanMatch, device: DeviceAddress, name: String, now: Instant) {
        if name == self.unique_name() {
            return;
        }

        match kind {
            ScanMatch::FirstMatch => {
                if self
                    .client
                    .on_scan_match(&name, device, &mut self.adapter, now)
                {
                    self.sync_radio();
                    return;
                }
                if !self.discovering {
                    return;
                }

                let found = Peer::new(name, device);
                match self.found_peers.insert(device, found.clone()) {
                    Some(old) if old.unique_name() != found.unique_name() => {
                        info!("{} is now {}", old.unique_name(), found.unique_name());
                        self.emit(CommunicatorEvent::PeerUpdated { old, new: found });
                    }
                    Some(_) => {}
                    None => {
                        info!("Found {} ({})", found.unique_name(), device);
                        self.emit(CommunicatorEvent::PeerFound(found));
                    }
                }
            }
            ScanMatch::MatchLost => {
                if let Some(lost) = self.found_peers.remove(&device) {
                    info!("Lost sight of {}", lost.unique_name());
                    self.emit(CommunicatorEvent::PeerLost(lost));
                }
            }
        }
    }

    fn handle_connection_events(&mut self, role: Role, events: Vec<ConnectionEvent>) {
        for event in events {
            match event {
                ConnectionEvent::ConnectionRequest(peer) => {
                    self.emit(CommunicatorEvent::ConnectionRequest(peer))
                }
                ConnectionEvent::ConnectionSuccess(peer) => {
                    self.emit(CommunicatorEvent::ConnectionSuccess { peer, source: role })
                }
                ConnectionEvent::ConnectionFailed(peer, error) => {
                    self.emit(CommunicatorEvent::ConnectionFailed { peer, error });
                    if self.peer_count() == 0 {
                        self.restore_bluetooth_status();
                    }
                }
                ConnectionEvent::ConnectionLost(peer) => {
                    self.emit(CommunicatorEvent::ConnectionLost { peer, source: role })
                }
                ConnectionEvent::ConnectionResumed(peer) => {
                    self.emit(CommunicatorEvent::ConnectionResumed { peer, source: role })
                }
                ConnectionEvent::ReconnectionAttemptFailed(peer) => {
                    debug!("Rescanning for {}", peer.unique_name());
                    if self.scan_active {
                        // A fresh scan session reports the peer again
                        self.adapter.stop_scan();
                        self.scan_active = false;
                    }
                }
                ConnectionEvent::MessageReceived(message) => {
                    self.emit(CommunicatorEvent::MessageReceived {
                        message,
                        source: role,
                    })
                }
                ConnectionEvent::DataReceived(message) => {
                    self.emit(CommunicatorEvent::DataReceived {
                        message,
                        source: role,
                    })
                }
                ConnectionEvent::SendCompleted(kind) => self.on_send_completed(role, kind),
                ConnectionEvent::Disconnected(peer) => {
                    let peers_left = self.peer_count();
                    self.emit(CommunicatorEvent::Disconnected { peer, peers_left });
                    if peers_left == 0 {
                        self.reset_queues();
                        self.restore_bluetooth_status();
                    }
                }
                ConnectionEvent::DisconnectionFailed(peer) => {
                    error!("Disconnection from {} failed", peer.unique_name());
                    self.restart_bluetooth();
                }
                ConnectionEvent::PeerUpdated { old, new } => {
                    self.emit(CommunicatorEvent::PeerUpdated { old, new })
                }
            }
        }
        self.sync_radio();
    }
}
