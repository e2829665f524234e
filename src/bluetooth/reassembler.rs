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

//! BLE fragment reassembly logic.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::protocol::Fragment;

struct PartialMessage {
    header: u8,
    expected_seq: u16,
    buffer: Vec<u8>,
}

/// Reassembles fragments into complete payloads, one buffer per message id.
pub struct MessageReassembler {
    pending: HashMap<u16, PartialMessage>,
}

impl MessageReassembler {
    /// Create a new message reassembler.
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Process an incoming fragment.
    ///
    /// Returns `Some((header, payload))` when the FINAL fragment of a message
    /// arrives, otherwise returns `None`. A gap or a duplicate drops the
    /// partial message.
    pub fn process_fragment(&mut self, fragment: Fragment) -> Option<(u8, Vec<u8>)> {
        let id = fragment.message_id;

        if fragment.sequence == 0 {
            if self.pending.contains_key(&id) {
                warn!("Message {} restarted before completion, dropping partial data", id);
            }
            self.pending.insert(
                id,
                PartialMessage {
                    header: fragment.header,
                    expected_seq: 0,
                    buffer: Vec::with_capacity(fragment.payload.len()),
                },
            );
        }

        let Some(partial) = self.pending.get_mut(&id) else {
            warn!(
                "Fragment {} of message {} received without start",
                fragment.sequence, id
            );
            return None;
        };

        if fragment.sequence != partial.expected_seq {
            warn!(
                "Sequence error on message {}: expected {}, got {}",
                id, partial.expected_seq, fragment.sequence
            );
            self.pending.remove(&id);
            return None;
        }

        partial.buffer.extend_from_slice(&fragment.payload);
        partial.expected_seq = partial.expected_seq.wrapping_add(1);

        if fragment.is_final() {
            let complete = self.pending.remove(&id)?;
            debug!(
                "Message {} reassembly complete: {} bytes",
                id,
                complete.buffer.len()
            );
            return Some((complete.header, complete.buffer));
        }

        None
    }

    /// Drop every partial message.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Check if reassembly is in progress.
    pub fn is_in_progress(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl Default for MessageReassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::protocol::{FragmentType, Message};

    fn fragment(id: u16, seq: u16, last: bool, payload: &[u8]) -> Fragment {
        Fragment {
            header: b'm',
            message_id: id,
            sequence: seq,
            fragment_type: if last {
                FragmentType::Final
            } else {
                FragmentType::NonFinal
            },
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_single_fragment_message() {
        let mut reassembler = MessageReassembler::new();
        let result = reassembler.process_fragment(fragment(1, 0, true, b"hello"));
        assert_eq!(result, Some((b'm', b"hello".to_vec())));
        assert!(!reassembler.is_in_progress());
    }

    #[test]
    fn test_three_fragment_message() {
        let mut reassembler = MessageReassembler::new();

        assert!(reassembler.process_fragment(fragment(4, 0, false, b"abcde")).is_none());
        assert!(reassembler.is_in_progress());
        assert!(reassembler.process_fragment(fragment(4, 1, false, b"fghij")).is_none());

        let result = reassembler.process_fragment(fragment(4, 2, true, b"klmno"));
        assert_eq!(result, Some((b'm', b"abcdefghijklmno".to_vec())));
    }

    #[test]
    fn test_sequence_gap_drops_message() {
        let mut reassembler = MessageReassembler::new();

        assert!(reassembler.process_fragment(fragment(2, 0, false, b"hello")).is_none());
        // Wrong sequence (should be 1, but is 2)
        assert!(reassembler.process_fragment(fragment(2, 2, true, b"world")).is_none());
        assert!(!reassembler.is_in_progress());
    }

    #[test]
    fn test_duplicate_fragment_drops_message() {
        let mut reassembler = MessageReassembler::new();

        assert!(reassembler.process_fragment(fragment(2, 0, false, b"ab")).is_none());
        assert!(reassembler.process_fragment(fragment(2, 1, false, b"cd")).is_none());
        assert!(reassembler.process_fragment(fragment(2, 1, false, b"cd")).is_none());
        assert!(!reassembler.is_in_progress());

        // Remaining fragments of the dropped message are ignored
        assert!(reassembler.process_fragment(fragment(2, 2, true, b"ef")).is_none());
    }

    #[test]
    fn test_continuation_without_start() {
        let mut reassembler = MessageReassembler::new();
        assert!(reassembler.process_fragment(fragment(9, 1, true, b"late")).is_none());
        assert!(!reassembler.is_in_progress());
    }

    #[test]
    fn test_interleaved_message_ids() {
        let mut reassembler = MessageReassembler::new();

        assert!(reassembler.process_fragment(fragment(1, 0, false, b"one-")).is_none());
        assert!(reassembler.process_fragment(fragment(2, 0, false, b"two-")).is_none());
        assert_eq!(
            reassembler.process_fragment(fragment(2, 1, true, b"done")),
            Some((b'm', b"two-done".to_vec()))
        );
        assert_eq!(
            reassembler.process_fragment(fragment(1, 1, true, b"done")),
            Some((b'm', b"one-done".to_vec()))
        );
    }

    #[test]
    fn test_roundtrip() {
        let original = b"This is a test message that will be fragmented and reassembled!";
        let message = Message::new(b'x', original.to_vec());

        let mut reassembler = MessageReassembler::new();
        let mut result = None;
        for fragment in message.fragments(11, 14).unwrap() {
            let decoded = Fragment::decode(&fragment.encode()).unwrap();
            if let Some(done) = reassembler.process_fragment(decoded) {
                result = Some(done);
            }
        }

        assert_eq!(result, Some((b'x', original.to_vec())));
    }
}
