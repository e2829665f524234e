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

//! Per-peer transport endpoint.
//!
//! A channel owns the [`Peer`] record for one role, writes the fragments of
//! the current outbound message one at a time (the next one only after the
//! previous write completed) and reassembles inbound fragments.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use super::adapter::{BluetoothAdapter, LinkKind, Role};
use super::ble_constants::config;
use super::peer::Peer;
use super::protocol::{Fragment, Message, ProtocolError};
use super::reassembler::MessageReassembler;

pub struct Channel {
    peer: Peer,
    role: Role,
    mtu: usize,
    next_message_id: u16,
    outbound: HashMap<LinkKind, VecDeque<Vec<u8>>>,
    writing: HashSet<LinkKind>,
    message_reassembler: MessageReassembler,
    data_reassembler: MessageReassembler,
}

impl Channel {
    pub fn new(peer: Peer, role: Role, mtu: usize) -> Self {
        Self {
            peer,
            role,
            mtu,
            next_message_id: 0,
            outbound: HashMap::new(),
            writing: HashSet::new(),
            message_reassembler: MessageReassembler::new(),
            data_reassembler: MessageReassembler::new(),
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn peer_mut(&mut self) -> &mut Peer {
        &mut self.peer
    }

    pub fn set_mtu(&mut self, mtu: usize) {
        debug!("MTU for {} updated: {} -> {} bytes", self.peer.unique_name(), self.mtu, mtu);
        self.mtu = mtu;
    }

    /// Fragment `message` and start writing it on `kind`.
    pub fn send(
        &mut self,
        kind: LinkKind,
        message: &Message,
        adapter: &mut dyn BluetoothAdapter,
    ) -> Result<(), ProtocolError> {
        let capacity = config::sub_payload_size(self.mtu);
        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);

        let frames: Vec<Vec<u8>> = message
            .fragments(message_id, capacity)?
            .iter()
            .map(Fragment::encode)
            .collect();

        debug!(
            "Sending {:?} {} to {} ({}): {} bytes in {} fragments",
            kind,
            message_id,
            self.peer.unique_name(),
            self.role,
            message.data().len(),
            frames.len()
        );

        self.outbound.entry(kind).or_default().extend(frames);
        if !self.writing.contains(&kind) {
            self.write_next(kind, adapter);
        }
        Ok(())
    }

    fn write_next(&mut self, kind: LinkKind, adapter: &mut dyn BluetoothAdapter) -> bool {
        match self.outbound.get_mut(&kind).and_then(|queue| queue.pop_front()) {
            Some(frame) => {
                self.writing.insert(kind);
                adapter.write(self.role, self.peer.device(), kind, frame);
                true
            }
            None => {
                self.writing.remove(&kind);
                self.outbound.remove(&kind);
                false
            }
        }
    }

    /// Handle a write completion on `kind`.
    ///
    /// Returns `true` once the current message has nothing left in flight,
    /// either because its last fragment was written or because a write failed
    /// and the rest of the message was dropped.
    pub fn on_write_completed(
        &mut self,
        kind: LinkKind,
        success: bool,
        adapter: &mut dyn BluetoothAdapter,
    ) -> bool {
        if !self.writing.contains(&kind) {
            return false;
        }

        if !success {
            warn!(
                "Write of {:?} to {} failed, dropping the rest of the message",
                kind,
                self.peer.unique_name()
            );
            self.cancel(kind);
            return true;
        }

        !self.write_next(kind, adapter)
    }

    pub fn is_sending(&self, kind: LinkKind) -> bool {
        self.writing.contains(&kind)
    }

    pub fn cancel(&mut self, kind: LinkKind) {
        self.outbound.remove(&kind);
        self.writing.remove(&kind);
    }

    pub fn cancel_all(&mut self) {
        self.outbound.clear();
        self.writing.clear();
    }

    /// Feed one inbound frame; returns the message once it is complete.
    pub fn on_frame(&mut self, kind: LinkKind, data: &[u8]) -> Option<Message> {
        let reassembler = match kind {
            LinkKind::Message => &mut self.message_reassembler,
            LinkKind::Data => &mut self.data_reassembler,
            _ => return None,
        };

        let fragment = match Fragment::decode(data) {
            Ok(fragment) => fragment,
            Err(e) => {
                warn!("Malformed fragment from {}: {}", self.peer.unique_name(), e);
                return None;
            }
        };

        let (header, payload) = reassembler.process_fragment(fragment)?;
        let mut message = Message::new(header, payload);
        message.set_sender(Some(self.peer.clone()));
        Some(message)
    }

    /// Forget partially received messages, e.g. after the link dropped.
    pub fn reset_reassembly(&mut self) {
        self.message_reassembler.reset();
        self.data_reassembler.reset();
    }
}
