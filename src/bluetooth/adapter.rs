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

//! Platform Bluetooth adapter abstraction.
//!
//! Every operation on [`BluetoothAdapter`] is fire-and-forget: the call only
//! starts the work, and the outcome comes back later as a [`PlatformEvent`]
//! on the channel created by [`platform_channel`].

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::ble_constants::*;

/// Hardware address of a remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(pub [u8; 6]);

impl DeviceAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for DeviceAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| anyhow!("Address too short: {}", s))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|e| anyhow!("Invalid address byte '{}': {}", part, e))?;
        }
        if parts.next().is_some() {
            return Err(anyhow!("Address too long: {}", s));
        }
        Ok(Self(bytes))
    }
}

/// Which side of a link the local device plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Central: initiated the connection.
    Client,
    /// Peripheral: accepted the connection.
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Power state of the local adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Off,
    TurningOn,
    On,
    TurningOff,
}

/// Logical stream of a link; each one maps to its own characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    ConnectionRequest,
    ConnectionResponse,
    Message,
    Data,
    NameUpdate,
    Disconnection,
}

impl LinkKind {
    pub const ALL: [LinkKind; 6] = [
        LinkKind::ConnectionRequest,
        LinkKind::ConnectionResponse,
        LinkKind::Message,
        LinkKind::Data,
        LinkKind::NameUpdate,
        LinkKind::Disconnection,
    ];

    /// Characteristic carrying this stream.
    pub fn uuid(&self) -> Uuid {
        match self {
            LinkKind::ConnectionRequest => CONNECTION_REQUEST_UUID,
            LinkKind::ConnectionResponse => CONNECTION_RESPONSE_UUID,
            LinkKind::Message => MESSAGE_UUID,
            LinkKind::Data => DATA_UUID,
            LinkKind::NameUpdate => NAME_UPDATE_UUID,
            LinkKind::Disconnection => DISCONNECTION_UUID,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.uuid() == uuid)
    }
}

/// Scan callback type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMatch {
    FirstMatch,
    MatchLost,
}

/// Outcome of a platform operation, or an unsolicited platform notification.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    /// Adapter power state broadcast.
    AdapterStateChanged(AdapterState),
    AdvertiseStarted,
    AdvertiseFailed(i32),
    ScanFailed(i32),
    ScanResult {
        kind: ScanMatch,
        device: DeviceAddress,
        name: String,
    },
    /// A physical link is up (client: connect succeeded, server: central attached).
    LinkUp { role: Role, device: DeviceAddress },
    /// A physical link went down, requested or not.
    LinkDown { role: Role, device: DeviceAddress },
    ConnectFailed { device: DeviceAddress, code: i32 },
    FrameReceived {
        role: Role,
        device: DeviceAddress,
        kind: LinkKind,
        data: Vec<u8>,
    },
    WriteCompleted {
        role: Role,
        device: DeviceAddress,
        kind: LinkKind,
        success: bool,
    },
    MtuChanged {
        role: Role,
        device: DeviceAddress,
        mtu: usize,
    },
    PhyRead {
        role: Role,
        device: DeviceAddress,
        tx_phy: u8,
        rx_phy: u8,
    },
}

pub type PlatformSender = mpsc::UnboundedSender<PlatformEvent>;
pub type PlatformReceiver = mpsc::UnboundedReceiver<PlatformEvent>;

/// Create the channel platform events are delivered on.
pub fn platform_channel() -> (PlatformSender, PlatformReceiver) {
    mpsc::unbounded_channel()
}

/// The local Bluetooth adapter as seen by the communicator.
pub trait BluetoothAdapter: Send {
    /// Whether the hardware supports Bluetooth Low Energy advertising and scanning.
    fn is_le_supported(&self) -> bool;

    fn state(&self) -> AdapterState;

    /// Request power on. Completion arrives as `AdapterStateChanged(On)`.
    fn enable(&mut self) -> bool;

    /// Request power off. Completion arrives as `AdapterStateChanged(Off)`.
    fn disable(&mut self) -> bool;

    fn name(&self) -> String;

    fn set_name(&mut self, name: &str) -> bool;

    fn start_advertising(&mut self, local_name: &str);

    fn stop_advertising(&mut self);

    /// Start a scan filtered on [`SERVICE_UUID`].
    fn start_scan(&mut self);

    fn stop_scan(&mut self);

    /// Open a client link to `device`.
    fn connect(&mut self, device: DeviceAddress);

    fn disconnect(&mut self, role: Role, device: DeviceAddress);

    /// Write one frame on `kind`. Completion arrives as `WriteCompleted`.
    fn write(&mut self, role: Role, device: DeviceAddress, kind: LinkKind, data: Vec<u8>);

    fn request_mtu(&mut self, _device: DeviceAddress, _mtu: usize) {}

    /// Best-effort physical layer query; may never answer.
    fn read_phy(&mut self, _role: Role, _device: DeviceAddress) {}

    /// Centrals the server role can keep apart, `None` when unbounded.
    fn max_server_links(&self) -> Option<usize> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_roundtrip() {
        let addr: DeviceAddress = "AA:0B:cc:01:02:FF".parse().unwrap();
        assert_eq!(addr, DeviceAddress::new([0xAA, 0x0B, 0xCC, 0x01, 0x02, 0xFF]));
        assert_eq!(addr.to_string(), "AA:0B:CC:01:02:FF");

        assert!("AA:BB".parse::<DeviceAddress>().is_err());
        assert!("AA:BB:CC:DD:EE:FF:00".parse::<DeviceAddress>().is_err());
        assert!("ZZ:BB:CC:DD:EE:FF".parse::<DeviceAddress>().is_err());
    }

    #[test]
    fn test_link_kind_uuids_are_distinct() {
        for kind in LinkKind::ALL {
            assert_eq!(LinkKind::from_uuid(kind.uuid()), Some(kind));
        }
        assert_eq!(LinkKind::from_uuid(SERVICE_UUID), None);
    }
}
