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

//! Remote peer identity and connection flags.

use std::hash::{Hash, Hasher};

use rand::Rng;

use super::adapter::DeviceAddress;
use super::ble_constants::naming::{ID_LENGTH, MAX_NAME_LENGTH};

/// A remote device taking part in the session.
///
/// Two peers are equal when they share a device address; the name and the
/// connection flags are not part of the identity.
#[derive(Debug, Clone)]
pub struct Peer {
    unique_name: String,
    device: DeviceAddress,
    pub(crate) hardware_connected: bool,
    pub(crate) connected: bool,
    pub(crate) reconnecting: bool,
    pub(crate) requesting_reconnection: bool,
    pub(crate) disconnecting: bool,
}

impl Peer {
    /// Create a peer that is not connected yet.
    pub fn new(unique_name: impl Into<String>, device: DeviceAddress) -> Self {
        Self {
            unique_name: unique_name.into(),
            device,
            hardware_connected: false,
            connected: false,
            reconnecting: false,
            requesting_reconnection: false,
            disconnecting: false,
        }
    }

    /// Logical name plus the numeric id suffix.
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// Name to display: the unique name without its id suffix.
    pub fn name(&self) -> &str {
        strip_id(&self.unique_name)
    }

    pub fn device(&self) -> DeviceAddress {
        self.device
    }

    pub fn is_hardware_connected(&self) -> bool {
        self.hardware_connected
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting
    }

    pub fn is_requesting_reconnection(&self) -> bool {
        self.requesting_reconnection
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting
    }

    /// Connected and not in the middle of a reconnection.
    pub fn is_fully_connected(&self) -> bool {
        self.connected && !self.reconnecting
    }

    pub(crate) fn set_unique_name(&mut self, unique_name: impl Into<String>) {
        self.unique_name = unique_name.into();
    }

    pub(crate) fn set_device(&mut self, device: DeviceAddress) {
        self.device = device;
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.device == other.device
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.device.hash(state);
    }
}

fn strip_id(unique_name: &str) -> &str {
    if unique_name.len() <= ID_LENGTH {
        return unique_name;
    }
    let cut = unique_name.len() - ID_LENGTH;
    unique_name.get(..cut).unwrap_or(unique_name)
}

/// Generate the random numeric suffix that makes a name unique.
pub fn generate_id() -> String {
    let id: u32 = rand::thread_rng().gen_range(0..10u32.pow(ID_LENGTH as u32));
    format!("{:0width$}", id, width = ID_LENGTH)
}

/// Check that a logical name can be advertised.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_NAME_LENGTH
}
