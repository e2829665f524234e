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

//! BlueZ implementation of [`BluetoothAdapter`].
//!
//! Each fire-and-forget call spawns a tokio task that talks to BlueZ and
//! reports back on the platform event channel. The local GATT application
//! is registered once, when the adapter is opened.
//!
//! BlueZ does not tell a notifier which central subscribed, so server-side
//! frames reach every listening central. The server role therefore serves
//! one central at a time and refuses further connection requests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bluer::adv::Advertisement;
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicWrite, CharacteristicWriteMethod,
    CharacteristicWriteRequest, ReqError, Service,
};
use bluer::gatt::remote;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, DeviceEvent, DeviceProperty,
    DiscoveryFilter, DiscoveryTransport,
};
use futures::stream::{SelectAll, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::adapter::{
    AdapterState, BluetoothAdapter, DeviceAddress, LinkKind, PlatformEvent, PlatformSender, Role,
    ScanMatch,
};
use super::ble_constants::SERVICE_UUID;

/// Error code reported when BlueZ gives no numeric one.
const PLATFORM_FAILURE: i32 = -1;

/// How long to wait for a remote device to resolve its services.
const SERVICE_RESOLVE_ATTEMPTS: usize = 50;
const SERVICE_RESOLVE_INTERVAL: Duration = Duration::from_millis(100);

type ServerQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<(DeviceAddress, Vec<u8>)>>>;

fn to_address(device: DeviceAddress) -> Address {
    Address::new(device.0)
}

fn from_address(address: Address) -> DeviceAddress {
    DeviceAddress::new(address.0)
}

/// Streams a central writes to on our GATT server.
fn central_writes(kind: LinkKind) -> bool {
    kind != LinkKind::ConnectionResponse
}

/// Streams a peripheral notifies to its central.
fn peripheral_notifies(kind: LinkKind) -> bool {
    kind != LinkKind::ConnectionRequest
}

/// Shared by the GATT callbacks of the local server.
#[derive(Clone)]
struct ServerContext {
    adapter: Adapter,
    events: PlatformSender,
    /// Attached centrals and the last MTU seen from each.
    centrals: Arc<Mutex<HashMap<DeviceAddress, usize>>>,
}

struct ClientLink {
    writes: mpsc::UnboundedSender<(LinkKind, Vec<u8>)>,
    task: JoinHandle<()>,
}

pub struct BluezAdapter {
    adapter: Adapter,
    events: PlatformSender,
    state: Arc<Mutex<AdapterState>>,
    alias: String,
    server: ServerContext,
    server_notify: HashMap<LinkKind, mpsc::UnboundedSender<(DeviceAddress, Vec<u8>)>>,
    clients: HashMap<DeviceAddress, ClientLink>,
    advertise_task: Option<JoinHandle<()>>,
    scan_task: Option<JoinHandle<()>>,
    watcher: JoinHandle<()>,
    _app: ApplicationHandle,
}

impl BluezAdapter {
    /// Open the default adapter and register the GATT application.
    pub async fn new(events: PlatformSender) -> Result<Self> {
        info!("Initializing BlueZ adapter...");

        let session = bluer::Session::new().await?;
        info!("BlueZ session created");

        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        let powered = adapter.is_powered().await?;
        let alias = adapter.alias().await?;
        let state = Arc::new(Mutex::new(if powered {
            AdapterState::On
        } else {
            AdapterState::Off
        }));

        let server = ServerContext {
            adapter: adapter.clone(),
            events: events.clone(),
            centrals: Arc::new(Mutex::new(HashMap::new())),
        };

        let mut server_notify = HashMap::new();
        let mut characteristics = Vec::new();
        for kind in LinkKind::ALL {
            let queue = if peripheral_notifies(kind) {
                let (tx, rx) = mpsc::unbounded_channel();
                server_notify.insert(kind, tx);
                Some(Arc::new(tokio::sync::Mutex::new(rx)))
            } else {
                None
            };
            characteristics.push(server_characteristic(kind, server.clone(), queue));
        }

        let app = Application {
            services: vec![Service {
                uuid: SERVICE_UUID,
                primary: true,
                characteristics,
                ..Default::default()
            }],
            ..Default::default()
        };
        let app_handle = adapter.serve_gatt_application(app).await?;
        info!("GATT service registered");

        let watcher = tokio::spawn(watch_adapter(adapter.clone(), events.clone(), state.clone()));

        Ok(Self {
            adapter,
            events,
            state,
            alias,
            server,
            server_notify,
            clients: HashMap::new(),
            advertise_task: None,
            scan_task: None,
            watcher,
            _app: app_handle,
        })
    }

    fn send(&self, event: PlatformEvent) {
        let _ = self.events.send(event);
    }
}

impl BluetoothAdapter for BluezAdapter {
    fn is_le_supported(&self) -> bool {
        true
    }

    fn state(&self) -> AdapterState {
        *self.state.lock()
    }

    fn enable(&mut self) -> bool {
        self.set_powered(true)
    }

    fn disable(&mut self) -> bool {
        self.set_powered(false)
    }

    fn name(&self) -> String {
        self.alias.clone()
    }

    fn set_name(&mut self, name: &str) -> bool {
        self.alias = name.to_string();
        let adapter = self.adapter.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            match adapter.set_alias(name.clone()).await {
                Ok(()) => info!("Bluetooth name set to: {}", name),
                Err(e) => error!("Failed to set Bluetooth name: {}", e),
            }
        });
        true
    }

    fn start_advertising(&mut self, local_name: &str) {
        self.stop_advertising();

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let advertisement = Advertisement {
            service_uuids: vec![SERVICE_UUID].into_iter().collect(),
            discoverable: Some(true),
            local_name: Some(local_name.to_string()),
            ..Default::default()
        };

        self.advertise_task = Some(tokio::spawn(async move {
            match adapter.advertise(advertisement).await {
                Ok(handle) => {
                    info!("BLE advertising started");
                    let _ = events.send(PlatformEvent::AdvertiseStarted);
                    // Advertising lasts as long as the handle does
                    let _handle = handle;
                    std::future::pending::<()>().await;
                }
                Err(e) => {
                    error!("Failed to start advertising: {}", e);
                    let _ = events.send(PlatformEvent::AdvertiseFailed(PLATFORM_FAILURE));
                }
            }
        }));
    }

    fn stop_advertising(&mut self) {
        if let Some(task) = self.advertise_task.take() {
            task.abort();
        }
    }

    fn start_scan(&mut self) {
        self.stop_scan();
        self.scan_task = Some(tokio::spawn(run_scan(
            self.adapter.clone(),
            self.events.clone(),
        )));
    }

    fn stop_scan(&mut self) {
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
    }

    fn connect(&mut self, device: DeviceAddress) {
        if let Some(link) = self.clients.remove(&device) {
            link.task.abort();
        }
        let (writes, requests) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_client_link(
            self.adapter.clone(),
            device,
            self.events.clone(),
            requests,
        ));
        self.clients.insert(device, ClientLink { writes, task });
    }

    fn disconnect(&mut self, role: Role, device: DeviceAddress) {
        match role {
            // Dropping the write sender makes the link task disconnect
            Role::Client => {
                self.clients.remove(&device);
            }
            Role::Server => {
                let adapter = self.adapter.clone();
                tokio::spawn(async move {
                    let result = match adapter.device(to_address(device)) {
                        Ok(remote) => remote.disconnect().await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        warn!("Failed to disconnect central {}: {}", device, e);
                    }
                });
            }
        }
    }

    fn write(&mut self, role: Role, device: DeviceAddress, kind: LinkKind, data: Vec<u8>) {
        let queued = match role {
            Role::Client => self
                .clients
                .get(&device)
                .map_or(false, |link| link.writes.send((kind, data)).is_ok()),
            Role::Server => self
                .server_notify
                .get(&kind)
                .map_or(false, |tx| tx.send((device, data)).is_ok()),
        };

        if !queued {
            debug!("No {} link to {} for {:?}", role, device, kind);
            self.send(PlatformEvent::WriteCompleted {
                role,
                device,
                kind,
                success: false,
            });
        }
    }

    fn max_server_links(&self) -> Option<usize> {
        Some(1)
    }
}

impl BluezAdapter {
    fn set_powered(&mut self, powered: bool) -> bool {
        {
            let mut state = self.state.lock();
            *state = if powered {
                AdapterState::TurningOn
            } else {
                AdapterState::TurningOff
            };
        }
        if !powered {
            self.stop_advertising();
            self.stop_scan();
            for (_, link) in self.clients.drain() {
                link.task.abort();
            }
            self.server.centrals.lock().clear();
        }

        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.set_powered(powered).await {
                error!("Failed to set adapter power to {}: {}", powered, e);
            }
        });
        true
    }
}

impl Drop for BluezAdapter {
    fn drop(&mut self) {
        self.stop_advertising();
        self.stop_scan();
        for (_, link) in self.clients.drain() {
            link.task.abort();
        }
        self.watcher.abort();
    }
}

/// Report adapter power changes.
async fn watch_adapter(adapter: Adapter, events: PlatformSender, state: Arc<Mutex<AdapterState>>) {
    let stream = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Cannot watch adapter events: {}", e);
            return;
        }
    };
    tokio::pin!(stream);

    while let Some(event) = stream.next().await {
        if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
            let new_state = if powered {
                AdapterState::On
            } else {
                AdapterState::Off
            };
            *state.lock() = new_state;
            debug!("Adapter powered: {}", powered);
            let _ = events.send(PlatformEvent::AdapterStateChanged(new_state));
        }
    }
}

async fn run_scan(adapter: Adapter, events: PlatformSender) {
    let filter = DiscoveryFilter {
        uuids: HashSet::from([SERVICE_UUID]),
        transport: DiscoveryTransport::Le,
        ..Default::default()
    };

    let stream = match adapter.set_discovery_filter(filter).await {
        Ok(()) => adapter.discover_devices().await,
        Err(e) => Err(e),
    };
    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to start BLE scan: {}", e);
            let _ = events.send(PlatformEvent::ScanFailed(PLATFORM_FAILURE));
            return;
        }
    };
    tokio::pin!(stream);
    info!("BLE scan running");

    let mut names: HashMap<DeviceAddress, String> = HashMap::new();
    while let Some(event) = stream.next().await {
        match event {
            AdapterEvent::DeviceAdded(address) => {
                let device = from_address(address);
                let Ok(remote) = adapter.device(address) else {
                    continue;
                };
                let uuids = remote.uuids().await.ok().flatten().unwrap_or_default();
                if !uuids.contains(&SERVICE_UUID) {
                    continue;
                }
                let Some(name) = remote.name().await.ok().flatten() else {
                    debug!("Ignoring unnamed device {}", device);
                    continue;
                };
                names.insert(device, name.clone());
                let _ = events.send(PlatformEvent::ScanResult {
                    kind: ScanMatch::FirstMatch,
                    device,
                    name,
                });
            }
            AdapterEvent::DeviceRemoved(address) => {
                let device = from_address(address);
                if let Some(name) = names.remove(&device) {
                    let _ = events.send(PlatformEvent::ScanResult {
                        kind: ScanMatch::MatchLost,
                        device,
                        name,
                    });
                }
            }
            _ => {}
        }
    }
}

/// Connect and map our service's characteristics by stream.
async fn open_client_link(
    adapter: &Adapter,
    device: DeviceAddress,
) -> Result<(bluer::Device, HashMap<LinkKind, remote::Characteristic>)> {
    let remote = adapter.device(to_address(device))?;
    if !remote.is_connected().await? {
        remote.connect().await?;
    }

    for _ in 0..SERVICE_RESOLVE_ATTEMPTS {
        if remote.is_services_resolved().await? {
            break;
        }
        tokio::time::sleep(SERVICE_RESOLVE_INTERVAL).await;
    }

    let mut characteristics = HashMap::new();
    for service in remote.services().await? {
        if service.uuid().await? != SERVICE_UUID {
            continue;
        }
        for characteristic in service.characteristics().await? {
            if let Some(kind) = LinkKind::from_uuid(characteristic.uuid().await?) {
                characteristics.insert(kind, characteristic);
            }
        }
    }

    if characteristics.is_empty() {
        let _ = remote.disconnect().await;
        return Err(anyhow!("Service {} not found on {}", SERVICE_UUID, device));
    }
    Ok((remote, characteristics))
}

async fn run_client_link(
    adapter: Adapter,
    device: DeviceAddress,
    events: PlatformSender,
    mut requests: mpsc::UnboundedReceiver<(LinkKind, Vec<u8>)>,
) {
    let (remote, characteristics) = match open_client_link(&adapter, device).await {
        Ok(link) => link,
        Err(e) => {
            warn!("Failed to connect to {}: {}", device, e);
            let _ = events.send(PlatformEvent::ConnectFailed {
                device,
                code: PLATFORM_FAILURE,
            });
            return;
        }
    };

    let mut notifications = SelectAll::new();
    for (kind, characteristic) in &characteristics {
        if !peripheral_notifies(*kind) {
            continue;
        }
        let kind = *kind;
        match characteristic.notify().await {
            Ok(stream) => notifications.push(stream.map(move |data| (kind, data)).boxed()),
            Err(e) => warn!("Cannot subscribe to {:?} on {}: {}", kind, device, e),
        }
    }

    let device_events = match remote.events().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Cannot watch {}: {}", device, e);
            let _ = remote.disconnect().await;
            let _ = events.send(PlatformEvent::ConnectFailed {
                device,
                code: PLATFORM_FAILURE,
            });
            return;
        }
    };
    tokio::pin!(device_events);

    info!("Client link to {} open", device);
    let _ = events.send(PlatformEvent::LinkUp {
        role: Role::Client,
        device,
    });

    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some((kind, data)) => {
                    let success = match characteristics.get(&kind) {
                        Some(characteristic) => match characteristic.write(&data).await {
                            Ok(()) => true,
                            Err(e) => {
                                warn!("Write of {:?} to {} failed: {}", kind, device, e);
                                false
                            }
                        },
                        None => false,
                    };
                    let _ = events.send(PlatformEvent::WriteCompleted {
                        role: Role::Client,
                        device,
                        kind,
                        success,
                    });
                }
                None => {
                    debug!("Closing client link to {}", device);
                    if let Err(e) = remote.disconnect().await {
                        warn!("Failed to disconnect from {}: {}", device, e);
                    }
                    break;
                }
            },
            Some((kind, data)) = notifications.next() => {
                let _ = events.send(PlatformEvent::FrameReceived {
                    role: Role::Client,
                    device,
                    kind,
                    data,
                });
            }
            Some(event) = device_events.next() => {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    break;
                }
            }
        }
    }

    info!("Client link to {} closed", device);
    let _ = events.send(PlatformEvent::LinkDown {
        role: Role::Client,
        device,
    });
}

/// Report a central's disconnection.
async fn watch_central(server: ServerContext, device: DeviceAddress) {
    let stream = match server.adapter.device(to_address(device)) {
        Ok(remote) => remote.events().await,
        Err(e) => Err(e),
    };
    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Cannot watch central {}: {}", device, e);
            return;
        }
    };
    tokio::pin!(stream);

    while let Some(event) = stream.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            break;
        }
    }

    if server.centrals.lock().remove(&device).is_some() {
        info!("Central {} detached", device);
        let _ = server.events.send(PlatformEvent::LinkDown {
            role: Role::Server,
            device,
        });
    }
}

fn on_central_write(
    server: &ServerContext,
    kind: LinkKind,
    data: Vec<u8>,
    req: CharacteristicWriteRequest,
) -> Result<(), ReqError> {
    let device = from_address(req.device_address);
    let mtu = req.mtu as usize;

    let (attached, mtu_changed) = {
        let mut centrals = server.centrals.lock();
        match centrals.get_mut(&device) {
            Some(known) if *known != mtu => {
                *known = mtu;
                (false, true)
            }
            Some(_) => (false, false),
            None => {
                centrals.insert(device, mtu);
                (true, true)
            }
        }
    };

    if attached {
        info!("Central {} attached", device);
        let _ = server.events.send(PlatformEvent::LinkUp {
            role: Role::Server,
            device,
        });
        tokio::spawn(watch_central(server.clone(), device));
    }
    if mtu_changed {
        let _ = server.events.send(PlatformEvent::MtuChanged {
            role: Role::Server,
            device,
            mtu,
        });
    }

    let _ = server.events.send(PlatformEvent::FrameReceived {
        role: Role::Server,
        device,
        kind,
        data,
    });
    Ok(())
}

fn server_characteristic(kind: LinkKind, server: ServerContext, queue: Option<ServerQueue>) -> Characteristic {
    let write = central_writes(kind).then(|| {
        let server = server.clone();
        CharacteristicWrite {
            write: true,
            write_without_response: false,
            method: CharacteristicWriteMethod::Fun(Box::new(
                move |data: Vec<u8>, req: CharacteristicWriteRequest| {
                    let server = server.clone();
                    Box::pin(async move { on_central_write(&server, kind, data, req) })
                },
            )),
            ..Default::default()
        }
    });

    let notify = queue.map(|queue| {
        let events = server.events.clone();
        CharacteristicNotify {
            notify: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |mut notifier| {
                let queue = queue.clone();
                let events = events.clone();
                Box::pin(async move {
                    debug!("{:?} notification loop started", kind);
                    loop {
                        let next = {
                            let mut rx = queue.lock().await;
                            rx.recv().await
                        };
                        let Some((device, data)) = next else {
                            break;
                        };
                        let success = match notifier.notify(data).await {
                            Ok(()) => true,
                            Err(e) => {
                                error!("Failed to notify {:?} to {}: {}", kind, device, e);
                                false
                            }
                        };
                        let _ = events.send(PlatformEvent::WriteCompleted {
                            role: Role::Server,
                            device,
                            kind,
                            success,
                        });
                        if !success {
                            break;
                        }
                    }
                    debug!("{:?} notification loop exited", kind);
                })
            })),
            ..Default::default()
        }
    });

    Characteristic {
        uuid: kind.uuid(),
        write,
        notify,
        ..Default::default()
    }
}
