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

//! Application messages and their fragment wire format.

use super::ble_constants::config::FRAGMENT_HEADER_LEN;
use super::ble_constants::fragment_type;
use super::peer::Peer;

/// Header used when the caller supplies none.
pub const DEFAULT_HEADER: u8 = b' ';

/// Largest number of fragments one message can be split into.
pub const MAX_FRAGMENTS: usize = u16::MAX as usize + 1;

/// Errors from encoding or decoding fragments.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("fragment too short: {0} bytes")]
    TooShort(usize),
    #[error("unknown fragment type: {0:#04x}")]
    UnknownFragmentType(u8),
    #[error("message of {len} bytes needs more than {max} fragments")]
    MessageTooLarge { len: usize, max: usize },
    #[error("fragment capacity must be positive")]
    ZeroCapacity,
}

/// Logical application payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    sender: Option<Peer>,
    receiver: Option<Peer>,
    header: u8,
    data: Vec<u8>,
}

impl Message {
    /// Create a locally originated broadcast message.
    pub fn new(header: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            sender: None,
            receiver: None,
            header,
            data: data.into(),
        }
    }

    /// Create a message from a textual header; only its first byte is kept,
    /// and an empty header is padded with [`DEFAULT_HEADER`].
    pub fn with_header(header: &str, data: impl Into<Vec<u8>>) -> Self {
        Self::new(normalize_header(header), data)
    }

    /// Create a text message.
    pub fn text(header: &str, text: &str) -> Self {
        Self::with_header(header, text.as_bytes())
    }

    /// Address the message to a single peer.
    pub fn to(mut self, receiver: Peer) -> Self {
        self.receiver = Some(receiver);
        self
    }

    pub fn header(&self) -> u8 {
        self.header
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload as UTF-8, if it is.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    pub fn sender(&self) -> Option<&Peer> {
        self.sender.as_ref()
    }

    pub fn receiver(&self) -> Option<&Peer> {
        self.receiver.as_ref()
    }

    pub fn set_sender(&mut self, sender: Option<Peer>) {
        self.sender = sender;
    }

    /// Split into fragments of at most `capacity` payload bytes.
    ///
    /// All fragments share `message_id`; sequence numbers run from zero and
    /// only the last fragment is FINAL. An empty message yields one empty
    /// FINAL fragment.
    pub fn fragments(&self, message_id: u16, capacity: usize) -> Result<Vec<Fragment>, ProtocolError> {
        if capacity == 0 {
            return Err(ProtocolError::ZeroCapacity);
        }

        let count = self.data.len().div_ceil(capacity).max(1);
        if count > MAX_FRAGMENTS {
            return Err(ProtocolError::MessageTooLarge {
                len: self.data.len(),
                max: MAX_FRAGMENTS,
            });
        }

        if self.data.is_empty() {
            return Ok(vec![Fragment {
                header: self.header,
                message_id,
                sequence: 0,
                fragment_type: FragmentType::Final,
                payload: Vec::new(),
            }]);
        }

        let fragments = self
            .data
            .chunks(capacity)
            .enumerate()
            .map(|(index, chunk)| Fragment {
                header: self.header,
                message_id,
                sequence: index as u16,
                fragment_type: if index + 1 == count {
                    FragmentType::Final
                } else {
                    FragmentType::NonFinal
                },
                payload: chunk.to_vec(),
            })
            .collect();

        Ok(fragments)
    }
}

fn normalize_header(header: &str) -> u8 {
    header.as_bytes().first().copied().unwrap_or(DEFAULT_HEADER)
}

/// Whether more fragments follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentType {
    NonFinal,
    Final,
}

impl FragmentType {
    fn as_byte(&self) -> u8 {
        match self {
            FragmentType::NonFinal => fragment_type::NON_FINAL,
            FragmentType::Final => fragment_type::FINAL,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            fragment_type::NON_FINAL => Ok(FragmentType::NonFinal),
            fragment_type::FINAL => Ok(FragmentType::Final),
            other => Err(ProtocolError::UnknownFragmentType(other)),
        }
    }
}

/// One wire-sized piece of a [`Message`].
///
/// Layout: `[header][message id: u16 LE][sequence: u16 LE][type][payload]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub header: u8,
    pub message_id: u16,
    pub sequence: u16,
    pub fragment_type: FragmentType,
    pub payload: Vec<u8>,
}

impl Fragment {
    pub fn is_final(&self) -> bool {
        self.fragment_type == FragmentType::Final
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAGMENT_HEADER_LEN + self.payload.len());
        out.push(self.header);
        out.extend_from_slice(&self.message_id.to_le_bytes());
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.push(self.fragment_type.as_byte());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < FRAGMENT_HEADER_LEN {
            return Err(ProtocolError::TooShort(bytes.len()));
        }

        Ok(Self {
            header: bytes[0],
            message_id: u16::from_le_bytes([bytes[1], bytes[2]]),
            sequence: u16::from_le_bytes([bytes[3], bytes[4]]),
            fragment_type: FragmentType::from_byte(bytes[5])?,
            payload: bytes[FRAGMENT_HEADER_LEN..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_normalization() {
        assert_eq!(Message::with_header("m", b"x".to_vec()).header(), b'm');
        assert_eq!(Message::with_header("msg", b"x".to_vec()).header(), b'm');
        assert_eq!(Message::with_header("", b"x".to_vec()).header(), DEFAULT_HEADER);
    }

    #[test]
    fn test_fragment_count_and_types() {
        let data: Vec<u8> = (0..100u8).collect();
        let message = Message::new(b'm', data.clone());

        let fragments = message.fragments(7, 14).unwrap();
        assert_eq!(fragments.len(), 8); // ceil(100 / 14)

        for (index, fragment) in fragments.iter().enumerate() {
            assert_eq!(fragment.sequence as usize, index);
            assert_eq!(fragment.message_id, 7);
            assert_eq!(fragment.header, b'm');
            assert_eq!(fragment.is_final(), index == fragments.len() - 1);
            assert!(fragment.payload.len() <= 14);
        }

        let joined: Vec<u8> = fragments.iter().flat_map(|f| f.payload.clone()).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_exact_multiple_of_capacity() {
        let message = Message::new(b'd', vec![0xAB; 28]);
        let fragments = message.fragments(0, 14).unwrap();
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[1].payload.len(), 14);
        assert!(fragments[1].is_final());
    }

    #[test]
    fn test_empty_message_is_one_final_fragment() {
        let message = Message::new(b'p', Vec::new());
        let fragments = message.fragments(3, 14).unwrap();
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].is_final());
        assert!(fragments[0].payload.is_empty());
    }

    #[test]
    fn test_fragment_limits() {
        let message = Message::new(b'm', vec![0; 10]);
        assert_eq!(message.fragments(0, 0), Err(ProtocolError::ZeroCapacity));

        let huge = Message::new(b'm', vec![0; MAX_FRAGMENTS + 1]);
        assert!(matches!(
            huge.fragments(0, 1),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_wire_layout() {
        let fragment = Fragment {
            header: b'm',
            message_id: 0x0102,
            sequence: 0x0304,
            fragment_type: FragmentType::Final,
            payload: b"hi".to_vec(),
        };

        let bytes = fragment.encode();
        assert_eq!(bytes, vec![b'm', 0x02, 0x01, 0x04, 0x03, 0x01, b'h', b'i']);
        assert_eq!(Fragment::decode(&bytes).unwrap(), fragment);
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(Fragment::decode(&[1, 2, 3]), Err(ProtocolError::TooShort(3)));
        assert_eq!(
            Fragment::decode(&[b'm', 0, 0, 0, 0, 9]),
            Err(ProtocolError::UnknownFragmentType(9))
        );
    }

    #[test]
    fn test_text_message() {
        let message = Message::text("t", "hello");
        assert_eq!(message.as_text(), Some("hello"));
        assert!(message.sender().is_none());
        assert!(message.receiver().is_none());
    }
}
