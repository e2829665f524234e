//! Integration tests for the full communication flow.
//!
//! Two communicators share an in-memory radio. Every platform call one of
//! them makes is turned into the events both sides would see, and the test
//! pumps those events until the radio is quiet.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use ble_communicator::bluetooth::{
    AdapterState, BluetoothAdapter, BluetoothResult, Communicator, CommunicatorConfig,
    DeviceAddress, LinkKind, Message, Peer, PlatformEvent, Role, ScanMatch,
};
use ble_communicator::events::CommunicatorEvent;

const ADDRESSES: [DeviceAddress; 2] = [
    DeviceAddress::new([0x10, 0, 0, 0, 0, 0xA1]),
    DeviceAddress::new([0x10, 0, 0, 0, 0, 0xB2]),
];

#[derive(Default)]
struct Radio {
    inboxes: [Vec<PlatformEvent>; 2],
    advertising: [Option<String>; 2],
    scanning: [bool; 2],
    /// Open link between the client side and the server side.
    link: Option<(usize, usize)>,
}

struct LoopbackAdapter {
    side: usize,
    state: AdapterState,
    name: String,
    radio: Arc<Mutex<Radio>>,
}

impl LoopbackAdapter {
    fn other(&self) -> usize {
        1 - self.side
    }

    fn opposite(role: Role) -> Role {
        match role {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

impl BluetoothAdapter for LoopbackAdapter {
    fn is_le_supported(&self) -> bool {
        true
    }

    fn state(&self) -> AdapterState {
        self.state
    }

    fn enable(&mut self) -> bool {
        self.state = AdapterState::On;
        self.radio.lock().inboxes[self.side].push(PlatformEvent::AdapterStateChanged(AdapterState::On));
        true
    }

    fn disable(&mut self) -> bool {
        self.state = AdapterState::Off;
        self.radio.lock().inboxes[self.side].push(PlatformEvent::AdapterStateChanged(AdapterState::Off));
        true
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn set_name(&mut self, name: &str) -> bool {
        self.name = name.to_string();
        true
    }

    fn start_advertising(&mut self, local_name: &str) {
        let (me, other) = (self.side, self.other());
        let mut radio = self.radio.lock();
        radio.advertising[me] = Some(local_name.to_string());
        radio.inboxes[me].push(PlatformEvent::AdvertiseStarted);
        if radio.scanning[other] {
            radio.inboxes[other].push(PlatformEvent::ScanResult {
                kind: ScanMatch::FirstMatch,
                device: ADDRESSES[me],
                name: local_name.to_string(),
            });
        }
    }

    fn stop_advertising(&mut self) {
        self.radio.lock().advertising[self.side] = None;
    }

    fn start_scan(&mut self) {
        let (me, other) = (self.side, self.other());
        let mut radio = self.radio.lock();
        radio.scanning[me] = true;
        if let Some(name) = radio.advertising[other].clone() {
            radio.inboxes[me].push(PlatformEvent::ScanResult {
                kind: ScanMatch::FirstMatch,
                device: ADDRESSES[other],
                name,
            });
        }
    }

    fn stop_scan(&mut self) {
        self.radio.lock().scanning[self.side] = false;
    }

    fn connect(&mut self, device: DeviceAddress) {
        let (me, other) = (self.side, self.other());
        assert_eq!(device, ADDRESSES[other]);
        let mut radio = self.radio.lock();
        radio.link = Some((me, other));
        radio.inboxes[me].push(PlatformEvent::LinkUp {
            role: Role::Client,
            device,
        });
        radio.inboxes[other].push(PlatformEvent::LinkUp {
            role: Role::Server,
            device: ADDRESSES[me],
        });
    }

    fn disconnect(&mut self, role: Role, device: DeviceAddress) {
        let (me, other) = (self.side, self.other());
        let mut radio = self.radio.lock();
        if radio.link.take().is_none() {
            return;
        }
        radio.inboxes[me].push(PlatformEvent::LinkDown { role, device });
        radio.inboxes[other].push(PlatformEvent::LinkDown {
            role: Self::opposite(role),
            device: ADDRESSES[me],
        });
    }

    fn write(&mut self, role: Role, device: DeviceAddress, kind: LinkKind, data: Vec<u8>) {
        let (me, other) = (self.side, self.other());
        let mut radio = self.radio.lock();
        let success = radio.link.is_some();
        if success {
            radio.inboxes[other].push(PlatformEvent::FrameReceived {
                role: Self::opposite(role),
                device: ADDRESSES[me],
                kind,
                data,
            });
        }
        radio.inboxes[me].push(PlatformEvent::WriteCompleted {
            role,
            device,
            kind,
            success,
        });
    }

    fn request_mtu(&mut self, device: DeviceAddress, mtu: usize) {
        let (me, other) = (self.side, self.other());
        let mut radio = self.radio.lock();
        radio.inboxes[me].push(PlatformEvent::MtuChanged {
            role: Role::Client,
            device,
            mtu,
        });
        radio.inboxes[other].push(PlatformEvent::MtuChanged {
            role: Role::Server,
            device: ADDRESSES[me],
            mtu,
        });
    }
}

struct Node {
    communicator: Communicator<LoopbackAdapter>,
    events: mpsc::UnboundedReceiver<CommunicatorEvent>,
}

impl Node {
    fn new(side: usize, name: &str, radio: &Arc<Mutex<Radio>>) -> Self {
        let adapter = LoopbackAdapter {
            side,
            state: AdapterState::On,
            name: format!("host-{}", side),
            radio: radio.clone(),
        };
        let config = CommunicatorConfig {
            name: name.to_string(),
            ..CommunicatorConfig::default()
        };
        let mut communicator = Communicator::new(adapter, &config);
        let events = communicator.subscribe();
        Self { communicator, events }
    }

    fn drain(&mut self) -> Vec<CommunicatorEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Deliver queued platform events until neither side has any left.
fn pump(radio: &Arc<Mutex<Radio>>, nodes: &mut [Node; 2]) {
    for _ in 0..10_000 {
        let mut idle = true;
        for (side, node) in nodes.iter_mut().enumerate() {
            let inbox = std::mem::take(&mut radio.lock().inboxes[side]);
            idle &= inbox.is_empty();
            for event in inbox {
                node.communicator.handle_platform_event(event);
            }
        }
        if idle {
            return;
        }
    }
    panic!("radio never went quiet");
}

fn long_text(seed: &str, len: usize) -> String {
    seed.chars().cycle().take(len).collect()
}

#[test]
fn test_discover_connect_exchange_disconnect() {
    let radio = Arc::new(Mutex::new(Radio::default()));
    let mut nodes = [Node::new(0, "Alpha", &radio), Node::new(1, "Bravo", &radio)];

    // Discovery
    assert_eq!(nodes[1].communicator.start_advertising(), BluetoothResult::Success);
    assert_eq!(nodes[0].communicator.start_discovery(), BluetoothResult::Success);
    pump(&radio, &mut nodes);

    let bravo_name = nodes[1].communicator.unique_name();
    let alpha_name = nodes[0].communicator.unique_name();
    assert!(nodes[1]
        .drain()
        .iter()
        .any(|event| matches!(event, CommunicatorEvent::AdvertiseStarted)));
    let found: Vec<Peer> = nodes[0]
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            CommunicatorEvent::PeerFound(peer) => Some(peer),
            _ => None,
        })
        .collect();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].unique_name(), bravo_name);
    assert_eq!(found[0].name(), "Bravo");

    // Handshake
    assert_eq!(nodes[0].communicator.connect(&found[0]), BluetoothResult::Success);
    pump(&radio, &mut nodes);

    let request = nodes[1]
        .drain()
        .into_iter()
        .find_map(|event| match event {
            CommunicatorEvent::ConnectionRequest(peer) => Some(peer),
            _ => None,
        })
        .expect("connection request");
    assert_eq!(request.unique_name(), alpha_name);

    assert_eq!(nodes[1].communicator.accept_connection(&request), BluetoothResult::Success);
    pump(&radio, &mut nodes);

    assert!(nodes[0].drain().iter().any(|event| matches!(
        event,
        CommunicatorEvent::ConnectionSuccess { peer, source: Role::Client } if peer.unique_name() == bravo_name
    )));
    assert!(nodes[1].drain().iter().any(|event| matches!(
        event,
        CommunicatorEvent::ConnectionSuccess { source: Role::Server, .. }
    )));
    assert_eq!(nodes[0].communicator.peer_count(), 1);
    assert_eq!(nodes[1].communicator.peer_count(), 1);

    // Multi-fragment traffic in both directions
    let greeting = long_text("hello from alpha ", 500);
    let reply = long_text("bravo answers ", 700);
    assert_eq!(
        nodes[0].communicator.send_message(Message::text("", &greeting)),
        BluetoothResult::Success
    );
    assert_eq!(
        nodes[1].communicator.send_message(Message::text("r", &reply)),
        BluetoothResult::Success
    );
    assert_eq!(
        nodes[1].communicator.send_data(Message::new(b'd', vec![7u8; 400])),
        BluetoothResult::Success
    );
    pump(&radio, &mut nodes);

    let at_bravo = nodes[1].drain();
    let received = at_bravo
        .iter()
        .find_map(|event| match event {
            CommunicatorEvent::MessageReceived {
                message,
                source: Role::Server,
            } => Some(message),
            _ => None,
        })
        .expect("message at bravo");
    assert_eq!(received.as_text(), Some(greeting.as_str()));
    assert_eq!(received.sender().map(Peer::unique_name), Some(alpha_name.as_str()));

    let at_alpha = nodes[0].drain();
    let received = at_alpha
        .iter()
        .find_map(|event| match event {
            CommunicatorEvent::MessageReceived {
                message,
                source: Role::Client,
            } => Some(message),
            _ => None,
        })
        .expect("message at alpha");
    assert_eq!(received.header(), b'r');
    assert_eq!(received.as_text(), Some(reply.as_str()));

    let data = at_alpha
        .iter()
        .find_map(|event| match event {
            CommunicatorEvent::DataReceived { message, .. } => Some(message),
            _ => None,
        })
        .expect("data at alpha");
    assert_eq!(data.data(), &[7u8; 400][..]);
    assert_eq!(nodes[0].communicator.queued_messages(), 0);
    assert_eq!(nodes[1].communicator.queued_data(), 0);

    // Graceful disconnect
    assert_eq!(nodes[0].communicator.disconnect(&found[0]), BluetoothResult::Success);
    pump(&radio, &mut nodes);

    for node in nodes.iter_mut() {
        assert!(node.drain().iter().any(|event| matches!(
            event,
            CommunicatorEvent::Disconnected { peers_left: 0, .. }
        )));
        assert_eq!(node.communicator.peer_count(), 0);
        // Bluetooth was on before we started, so it stays on
        assert_eq!(node.communicator.bluetooth_state(), AdapterState::On);
    }
}

#[test]
fn test_rejected_connection_closes_link() {
    let radio = Arc::new(Mutex::new(Radio::default()));
    let mut nodes = [Node::new(0, "Alpha", &radio), Node::new(1, "Bravo", &radio)];

    nodes[1].communicator.start_advertising();
    pump(&radio, &mut nodes);

    let bravo = Peer::new(nodes[1].communicator.unique_name(), ADDRESSES[1]);
    assert_eq!(nodes[0].communicator.connect(&bravo), BluetoothResult::Success);
    pump(&radio, &mut nodes);

    let request = nodes[1]
        .drain()
        .into_iter()
        .find_map(|event| match event {
            CommunicatorEvent::ConnectionRequest(peer) => Some(peer),
            _ => None,
        })
        .expect("connection request");
    assert_eq!(nodes[1].communicator.reject_connection(&request), BluetoothResult::Success);
    pump(&radio, &mut nodes);

    assert!(nodes[0].drain().iter().any(|event| matches!(
        event,
        CommunicatorEvent::ConnectionFailed { .. }
    )));
    assert!(radio.lock().link.is_none());
    assert_eq!(nodes[0].communicator.peer_count(), 0);
    assert_eq!(nodes[1].communicator.peer_count(), 0);
    assert!(!nodes[0].communicator.is_initializing_connection());
}
