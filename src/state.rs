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

//! Application state management.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::bluetooth::ConnectionState;

/// Shared application state.
#[derive(Debug, Default)]
pub struct AppState {
    /// Whether we are visible to remote clients.
    pub advertising: RwLock<bool>,

    /// Whether we are looking for remote servers.
    pub discovering: RwLock<bool>,

    /// Known peers by unique name.
    pub peers: RwLock<BTreeMap<String, ConnectionState>>,

    /// Unique names seen by discovery.
    pub found: RwLock<BTreeSet<String>>,

    /// Sender and text of the last message.
    pub last_message: RwLock<Option<(String, String)>>,

    /// Last reported failure.
    pub last_error: RwLock<Option<String>>,
}

impl AppState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_advertising(&self, advertising: bool) {
        *self.advertising.write() = advertising;
    }

    pub fn is_advertising(&self) -> bool {
        *self.advertising.read()
    }

    pub fn set_discovering(&self, discovering: bool) {
        *self.discovering.write() = discovering;
    }

    pub fn is_discovering(&self) -> bool {
        *self.discovering.read()
    }

    pub fn set_peer(&self, unique_name: &str, state: ConnectionState) {
        self.peers.write().insert(unique_name.to_string(), state);
    }

    pub fn remove_peer(&self, unique_name: &str) {
        self.peers.write().remove(unique_name);
    }

    pub fn get_peer(&self, unique_name: &str) -> Option<ConnectionState> {
        self.peers.read().get(unique_name).copied()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Move a peer and its discovery entry to a new unique name.
    pub fn rename(&self, old: &str, new: &str) {
        if old == new {
            return;
        }
        let mut peers = self.peers.write();
        if let Some(state) = peers.remove(old) {
            peers.insert(new.to_string(), state);
        }
        drop(peers);

        let mut found = self.found.write();
        if found.remove(old) {
            found.insert(new.to_string());
        }
    }

    pub fn add_found(&self, unique_name: &str) {
        self.found.write().insert(unique_name.to_string());
    }

    pub fn remove_found(&self, unique_name: &str) {
        self.found.write().remove(unique_name);
    }

    pub fn get_found(&self) -> Vec<String> {
        self.found.read().iter().cloned().collect()
    }

    pub fn set_last_message(&self, sender: String, text: String) {
        *self.last_message.write() = Some((sender, text));
    }

    pub fn get_last_message(&self) -> Option<(String, String)> {
        self.last_message.read().clone()
    }

    pub fn set_error(&self, error: String) {
        *self.last_error.write() = Some(error);
    }

    pub fn get_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_moves_peer_and_discovery_entry() {
        let state = AppState::new();
        state.set_peer("Phone07", ConnectionState::Reconnecting);
        state.add_found("Phone07");

        state.rename("Phone07", "Handset07");

        assert_eq!(state.get_peer("Phone07"), None);
        assert_eq!(state.get_peer("Handset07"), Some(ConnectionState::Reconnecting));
        assert_eq!(state.get_found(), vec!["Handset07".to_string()]);
    }

    #[test]
    fn test_rename_of_unknown_peer_is_ignored() {
        let state = AppState::new();
        state.rename("Ghost01", "Ghost02");
        assert_eq!(state.peer_count(), 0);
        assert!(state.get_found().is_empty());
    }
}
