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

//! BLE service and characteristic UUIDs for the communicator.

use uuid::Uuid;

/// Communicator GATT service UUID. Scans filter on it and advertising carries it.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e4f_2a10_8c3d_4b7e_9f21_5d0c_8a7b_3e00);

/// Connection request characteristic UUID (client writes its unique name here).
/// Properties: Write
pub const CONNECTION_REQUEST_UUID: Uuid = Uuid::from_u128(0x6e4f_2a10_8c3d_4b7e_9f21_5d0c_8a7b_3e01);

/// Connection response characteristic UUID (server answers accept/reject).
/// Properties: Notify
pub const CONNECTION_RESPONSE_UUID: Uuid =
    Uuid::from_u128(0x6e4f_2a10_8c3d_4b7e_9f21_5d0c_8a7b_3e02);

/// Message characteristic UUID.
/// Properties: Write, Notify
pub const MESSAGE_UUID: Uuid = Uuid::from_u128(0x6e4f_2a10_8c3d_4b7e_9f21_5d0c_8a7b_3e03);

/// Out-of-band data characteristic UUID.
/// Properties: Write, Notify
pub const DATA_UUID: Uuid = Uuid::from_u128(0x6e4f_2a10_8c3d_4b7e_9f21_5d0c_8a7b_3e04);

/// Name update characteristic UUID.
/// Properties: Write, Notify
pub const NAME_UPDATE_UUID: Uuid = Uuid::from_u128(0x6e4f_2a10_8c3d_4b7e_9f21_5d0c_8a7b_3e05);

/// Graceful disconnection notice characteristic UUID.
/// Properties: Write, Notify
pub const DISCONNECTION_UUID: Uuid = Uuid::from_u128(0x6e4f_2a10_8c3d_4b7e_9f21_5d0c_8a7b_3e06);

/// Fragment type markers.
pub mod fragment_type {
    pub const NON_FINAL: u8 = 0x00;
    pub const FINAL: u8 = 0x01;
}

/// Connection response payloads.
pub mod response {
    pub const REJECT: u8 = 0x00;
    pub const ACCEPT: u8 = 0x01;
}

/// Peer naming limits.
pub mod naming {
    /// Length of the numeric id appended to the logical name.
    pub const ID_LENGTH: usize = 2;

    /// Maximum logical name length in bytes, so the unique name fits a scan response.
    pub const MAX_NAME_LENGTH: usize = 16;
}

/// BLE configuration constants.
pub mod config {
    /// Default MTU (minimum for all BLE devices).
    pub const DEFAULT_MTU: usize = 23;

    /// MTU requested by the client after a link comes up.
    pub const PREFERRED_MTU: usize = 185;

    /// Largest ATT MTU the specification allows.
    pub const MAX_MTU: usize = 517;

    /// ATT protocol overhead (3 bytes).
    pub const ATT_OVERHEAD: usize = 3;

    /// Fragment header: header byte, message id (2), sequence (2), type.
    pub const FRAGMENT_HEADER_LEN: usize = 6;

    /// Sub-payload bytes that fit in one fragment for a given MTU.
    pub fn sub_payload_size(mtu: usize) -> usize {
        mtu.clamp(DEFAULT_MTU, MAX_MTU) - ATT_OVERHEAD - FRAGMENT_HEADER_LEN
    }
}
