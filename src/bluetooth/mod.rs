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

//! Bluetooth communication module.
//!
//! Dual-role BLE: peers are discovered and dialled as a client, and accepted
//! as a server, over one GATT service with a characteristic per stream.

mod adapter;
pub mod ble_constants;
mod bluez;
mod channel;
mod client;
mod communicator;
mod connection;
mod handle;
mod peer;
mod protocol;
mod reassembler;
mod server;

#[cfg(test)]
pub(crate) mod testing;

pub use adapter::{
    platform_channel, AdapterState, BluetoothAdapter, DeviceAddress, LinkKind, PlatformEvent,
    PlatformReceiver, PlatformSender, Role, ScanMatch,
};
pub use bluez::BluezAdapter;
pub use communicator::{
    BluetoothResult, Communicator, CommunicatorConfig, CommunicatorSnapshot, DEFAULT_NAME,
};
pub use connection::{ConnectionError, ConnectionState};
pub use handle::BluetoothCommunicator;
pub use peer::{is_valid_name, Peer};
pub use protocol::{Fragment, FragmentType, Message, ProtocolError, DEFAULT_HEADER};
