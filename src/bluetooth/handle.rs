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

//! Async handle to a [`Communicator`] running on its own task.
//!
//! The task is the only owner of the communicator. Commands, platform events
//! and deadline ticks are all handled there, one at a time.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::adapter::{BluetoothAdapter, PlatformReceiver};
use super::communicator::{BluetoothResult, Communicator, CommunicatorConfig, CommunicatorSnapshot};
use super::peer::Peer;
use super::protocol::Message;
use crate::events::CommunicatorEvent;

type Reply = oneshot::Sender<BluetoothResult>;

enum Command {
    StartAdvertising(Reply),
    StopAdvertising(bool, Reply),
    StartDiscovery(Reply),
    StopDiscovery(bool, Reply),
    Connect(Peer, Reply),
    Accept(Peer, Reply),
    Reject(Peer, Reply),
    Disconnect(Peer, Reply),
    DisconnectAll(Reply),
    SendMessage(Message, Reply),
    SendData(Message, Reply),
    SetName(String, Reply),
    Subscribe(oneshot::Sender<mpsc::UnboundedReceiver<CommunicatorEvent>>),
    Snapshot(oneshot::Sender<CommunicatorSnapshot>),
    Destroy(oneshot::Sender<()>),
}

/// Cloneable handle; every method is answered by the owning task.
#[derive(Clone)]
pub struct BluetoothCommunicator {
    commands: mpsc::UnboundedSender<Command>,
}

impl BluetoothCommunicator {
    /// Start the event loop that owns `adapter`.
    ///
    /// `platform` must be the receiving end of the channel the adapter
    /// reports on. The loop ends once the communicator is destroyed; dropping
    /// every handle destroys it.
    pub fn spawn<A>(adapter: A, platform: PlatformReceiver, config: CommunicatorConfig) -> (Self, JoinHandle<()>)
    where
        A: BluetoothAdapter + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let communicator = Communicator::new(adapter, &config);
        let task = tokio::spawn(run(communicator, rx, platform, config.tick_interval));
        (Self { commands: tx }, task)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| anyhow!("Communicator is no longer running"))?;
        rx.await
            .map_err(|_| anyhow!("Communicator stopped before answering"))
    }

    pub async fn start_advertising(&self) -> Result<BluetoothResult> {
        self.request(Command::StartAdvertising).await
    }

    pub async fn stop_advertising(&self, restore_bluetooth_status: bool) -> Result<BluetoothResult> {
        self.request(|reply| Command::StopAdvertising(restore_bluetooth_status, reply))
            .await
    }

    pub async fn start_discovery(&self) -> Result<BluetoothResult> {
        self.request(Command::StartDiscovery).await
    }

    pub async fn stop_discovery(&self, restore_bluetooth_status: bool) -> Result<BluetoothResult> {
        self.request(|reply| Command::StopDiscovery(restore_bluetooth_status, reply))
            .await
    }

    pub async fn connect(&self, peer: Peer) -> Result<BluetoothResult> {
        self.request(|reply| Command::Connect(peer, reply)).await
    }

    pub async fn accept_connection(&self, peer: Peer) -> Result<BluetoothResult> {
        self.request(|reply| Command::Accept(peer, reply)).await
    }

    pub async fn reject_connection(&self, peer: Peer) -> Result<BluetoothResult> {
        self.request(|reply| Command::Reject(peer, reply)).await
    }

    pub async fn disconnect(&self, peer: Peer) -> Result<BluetoothResult> {
        self.request(|reply| Command::Disconnect(peer, reply)).await
    }

    pub async fn disconnect_from_all(&self) -> Result<BluetoothResult> {
        self.request(Command::DisconnectAll).await
    }

    pub async fn send_message(&self, message: Message) -> Result<BluetoothResult> {
        self.request(|reply| Command::SendMessage(message, reply))
            .await
    }

    pub async fn send_data(&self, data: Message) -> Result<BluetoothResult> {
        self.request(|reply| Command::SendData(data, reply)).await
    }

    pub async fn set_name(&self, name: &str) -> Result<BluetoothResult> {
        let name = name.to_string();
        self.request(|reply| Command::SetName(name, reply)).await
    }

    /// Register a new observer.
    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<CommunicatorEvent>> {
        self.request(Command::Subscribe).await
    }

    pub async fn snapshot(&self) -> Result<CommunicatorSnapshot> {
        self.request(Command::Snapshot).await
    }

    /// Tear down and wait until Bluetooth has been turned off.
    pub async fn destroy(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Destroy(tx)).is_err() {
            debug!("Communicator already gone");
            return Ok(());
        }
        rx.await
            .map_err(|_| anyhow!("Communicator stopped before completing destroy"))
    }
}

fn execute<A: BluetoothAdapter>(communicator: &mut Communicator<A>, command: Command) {
    // A dropped reply only means the caller stopped waiting
    match command {
        Command::StartAdvertising(reply) => {
            let _ = reply.send(communicator.start_advertising());
        }
        Command::StopAdvertising(restore, reply) => {
            let _ = reply.send(communicator.stop_advertising(restore));
        }
        Command::StartDiscovery(reply) => {
            let _ = reply.send(communicator.start_discovery());
        }
        Command::StopDiscovery(restore, reply) => {
            let _ = reply.send(communicator.stop_discovery(restore));
        }
        Command::Connect(peer, reply) => {
            let _ = reply.send(communicator.connect(&peer));
        }
        Command::Accept(peer, reply) => {
            let _ = reply.send(communicator.accept_connection(&peer));
        }
        Command::Reject(peer, reply) => {
            let _ = reply.send(communicator.reject_connection(&peer));
        }
        Command::Disconnect(peer, reply) => {
            let _ = reply.send(communicator.disconnect(&peer));
        }
        Command::DisconnectAll(reply) => {
            let _ = reply.send(communicator.disconnect_from_all());
        }
        Command::SendMessage(message, reply) => {
            let _ = reply.send(communicator.send_message(message));
        }
        Command::SendData(data, reply) => {
            let _ = reply.send(communicator.send_data(data));
        }
        Command::SetName(name, reply) => {
            let _ = reply.send(communicator.set_name(&name));
        }
        Command::Subscribe(reply) => {
            let _ = reply.send(communicator.subscribe());
        }
        Command::Snapshot(reply) => {
            let _ = reply.send(communicator.snapshot());
        }
        Command::Destroy(done) => {
            communicator.destroy(done);
        }
    }
}

async fn run<A: BluetoothAdapter>(
    mut communicator: Communicator<A>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut platform: PlatformReceiver,
    tick_interval: Duration,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut commands_open = true;
    let mut platform_open = true;

    info!("Communicator event loop started");

    loop {
        tokio::select! {
            // Platform reports queued ahead of a command are applied first
            biased;

            event = platform.recv(), if platform_open => match event {
                Some(event) => communicator.handle_platform_event(event),
                None => {
                    debug!("Platform event channel closed");
                    platform_open = false;
                }
            },
            command = commands.recv(), if commands_open => match command {
                Some(command) => execute(&mut communicator, command),
                None => {
                    info!("All handles dropped, destroying communicator");
                    commands_open = false;
                    let (done, _) = oneshot::channel();
                    communicator.destroy(done);
                }
            },
            _ = ticker.tick() => communicator.tick(Instant::now()),
        }

        if communicator.is_destroyed() {
            break;
        }
        if !commands_open && !platform_open {
            debug!("No command or platform source left");
            break;
        }
    }

    info!("Communicator event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::adapter::{platform_channel, AdapterState, PlatformEvent};
    use crate::bluetooth::testing::{shutdown, FakeAdapter};
    use crate::bluetooth::{ConnectionError, DeviceAddress};

    fn config() -> CommunicatorConfig {
        CommunicatorConfig {
            name: "Desk".to_string(),
            ..CommunicatorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_commands_and_events_flow_through_the_loop() {
        let (platform_tx, platform_rx) = platform_channel();
        let (communicator, task) = BluetoothCommunicator::spawn(FakeAdapter::new(), platform_rx, config());
        let mut events = communicator.subscribe().await.unwrap();

        assert_eq!(communicator.start_advertising().await.unwrap(), BluetoothResult::Success);
        assert_eq!(
            communicator.start_advertising().await.unwrap(),
            BluetoothResult::AlreadyStarted
        );

        platform_tx.send(PlatformEvent::AdvertiseStarted).unwrap();
        assert!(matches!(events.recv().await, Some(CommunicatorEvent::AdvertiseStarted)));

        let snapshot = communicator.snapshot().await.unwrap();
        assert!(snapshot.advertising);
        assert!(!snapshot.discovering);
        assert!(snapshot.unique_name.starts_with("Desk"));
        assert_eq!(snapshot.bluetooth_state, AdapterState::On);

        shutdown(communicator, platform_tx, task).await;
    }

    #[tokio::test]
    async fn test_destroy_waits_for_adapter_off() {
        let (platform_tx, platform_rx) = platform_channel();
        let (communicator, task) = BluetoothCommunicator::spawn(FakeAdapter::new(), platform_rx, config());

        let destroying = communicator.clone();
        let destroy = tokio::spawn(async move { destroying.destroy().await });

        // Once destroy has been applied every command is refused
        loop {
            match communicator.start_advertising().await.unwrap() {
                BluetoothResult::Destroying => break,
                _ => tokio::task::yield_now().await,
            }
        }
        assert!(!destroy.is_finished());

        platform_tx
            .send(PlatformEvent::AdapterStateChanged(AdapterState::Off))
            .unwrap();
        destroy.await.unwrap().unwrap();
        task.await.unwrap();

        assert!(communicator.start_advertising().await.is_err());
        assert!(communicator.destroy().await.is_ok());
    }

    #[tokio::test]
    async fn test_dropping_every_handle_destroys() {
        let (platform_tx, platform_rx) = platform_channel();
        let (communicator, task) = BluetoothCommunicator::spawn(FakeAdapter::off(), platform_rx, config());
        drop(communicator);

        // Already off, so destroy completes without a platform report
        task.await.unwrap();
        drop(platform_tx);
    }

    #[tokio::test]
    async fn test_deadlines_are_driven_by_ticks() {
        let (platform_tx, platform_rx) = platform_channel();
        let config = CommunicatorConfig {
            connection_timeout: Duration::from_millis(20),
            tick_interval: Duration::from_millis(5),
            ..config()
        };
        let (communicator, task) = BluetoothCommunicator::spawn(FakeAdapter::new(), platform_rx, config);
        let mut events = communicator.subscribe().await.unwrap();

        let peer = Peer::new("Phone07", DeviceAddress::new([1, 2, 3, 4, 5, 6]));
        assert_eq!(communicator.connect(peer).await.unwrap(), BluetoothResult::Success);

        let failed = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if let CommunicatorEvent::ConnectionFailed { error, .. } = event {
                    return Some(error);
                }
            }
            None
        })
        .await
        .unwrap();
        assert_eq!(failed, Some(ConnectionError::Timeout));

        shutdown(communicator, platform_tx, task).await;
    }
}
