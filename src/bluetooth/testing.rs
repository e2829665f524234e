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

//! Recording adapter for state machine tests.

use tokio::task::JoinHandle;

use super::adapter::{
    AdapterState, BluetoothAdapter, DeviceAddress, LinkKind, PlatformEvent, PlatformSender, Role,
};
use super::handle::BluetoothCommunicator;

#[derive(Debug, Clone, PartialEq)]
pub enum AdapterCall {
    Enable,
    Disable,
    SetName(String),
    StartAdvertising(String),
    StopAdvertising,
    StartScan,
    StopScan,
    Connect(DeviceAddress),
    Disconnect {
        role: Role,
        device: DeviceAddress,
    },
    Write {
        role: Role,
        device: DeviceAddress,
        kind: LinkKind,
        data: Vec<u8>,
    },
    RequestMtu {
        device: DeviceAddress,
        mtu: usize,
    },
    ReadPhy {
        role: Role,
        device: DeviceAddress,
    },
}

/// Records every call; power state only changes when a test says so.
pub struct FakeAdapter {
    pub calls: Vec<AdapterCall>,
    pub state: AdapterState,
    pub name: String,
    pub le_supported: bool,
    pub max_server_links: Option<usize>,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self {
            calls: Vec::new(),
            state: AdapterState::On,
            name: "host".to_string(),
            le_supported: true,
            max_server_links: None,
        }
    }

    pub fn off() -> Self {
        Self {
            state: AdapterState::Off,
            ..Self::new()
        }
    }

    pub fn count(&self, call: &AdapterCall) -> usize {
        self.calls.iter().filter(|c| *c == call).count()
    }

    pub fn writes(&self, kind: LinkKind) -> Vec<(Role, DeviceAddress, Vec<u8>)> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                AdapterCall::Write {
                    role,
                    device,
                    kind: k,
                    data,
                } if *k == kind => Some((*role, *device, data.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.calls.clear();
    }
}

impl BluetoothAdapter for FakeAdapter {
    fn is_le_supported(&self) -> bool {
        self.le_supported
    }

    fn state(&self) -> AdapterState {
        self.state
    }

    fn enable(&mut self) -> bool {
        self.calls.push(AdapterCall::Enable);
        true
    }

    fn disable(&mut self) -> bool {
        self.calls.push(AdapterCall::Disable);
        true
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn set_name(&mut self, name: &str) -> bool {
        self.name = name.to_string();
        self.calls.push(AdapterCall::SetName(name.to_string()));
        true
    }

    fn start_advertising(&mut self, local_name: &str) {
        self.calls
            .push(AdapterCall::StartAdvertising(local_name.to_string()));
    }

    fn stop_advertising(&mut self) {
        self.calls.push(AdapterCall::StopAdvertising);
    }

    fn start_scan(&mut self) {
        self.calls.push(AdapterCall::StartScan);
    }

    fn stop_scan(&mut self) {
        self.calls.push(AdapterCall::StopScan);
    }

    fn connect(&mut self, device: DeviceAddress) {
        self.calls.push(AdapterCall::Connect(device));
    }

    fn disconnect(&mut self, role: Role, device: DeviceAddress) {
        self.calls.push(AdapterCall::Disconnect { role, device });
    }

    fn write(&mut self, role: Role, device: DeviceAddress, kind: LinkKind, data: Vec<u8>) {
        self.calls.push(AdapterCall::Write {
            role,
            device,
            kind,
            data,
        });
    }

    fn request_mtu(&mut self, device: DeviceAddress, mtu: usize) {
        self.calls.push(AdapterCall::RequestMtu { device, mtu });
    }

    fn read_phy(&mut self, role: Role, device: DeviceAddress) {
        self.calls.push(AdapterCall::ReadPhy { role, device });
    }

    fn max_server_links(&self) -> Option<usize> {
        self.max_server_links
    }
}

/// Destroy a spawned communicator that runs on a [`FakeAdapter`].
///
/// The fake never powers off by itself, so the OFF report is injected.
pub async fn shutdown(communicator: BluetoothCommunicator, platform: PlatformSender, task: JoinHandle<()>) {
    let destroy = tokio::spawn(async move { communicator.destroy().await });
    let _ = platform.send(PlatformEvent::AdapterStateChanged(AdapterState::Off));
    destroy.await.unwrap().unwrap();
    task.await.unwrap();
}
