//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use relaypair::connection::{ConnectionState, ResumptionInfo, WireMessage};
use relaypair::core::{ChannelError, CryptoError, DEFAULT_CHUNK_SIZE, MemoryKeyStore};
use relaypair::crypto::{PublicKey, SessionCipher};
use relaypair::framer::{Chunker, Unchunker, length_prefixed, strip_length_prefix};
use relaypair::session::{ActiveSessions, InboundMessages, Session, SessionConfig};
use relaypair::transport::{
    ChannelEvent, ChannelHandles, ConnectRequest, DriverEndpoint, Incoming, SecureChannel,
    channel_pair,
};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Connection id handed out for generation `n` of a [`MockChannel`].
pub fn connection_id(n: u8) -> Bytes {
    Bytes::from(vec![n; 16])
}

struct FixedCipher(Bytes);

impl SessionCipher for FixedCipher {
    fn encrypt_with_session_keys(
        &self,
        _plaintext: &[u8],
        _nonce: &[u8; 24],
    ) -> Result<Vec<u8>, CryptoError> {
        Ok(self.0.to_vec())
    }
}

/// Secure channel whose driver side is handed to the test.
pub struct MockChannel {
    endpoints: mpsc::UnboundedSender<DriverEndpoint>,
    generations: AtomicU8,
}

impl MockChannel {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DriverEndpoint>) {
        let (endpoints, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            endpoints,
            generations: AtomicU8::new(0),
        });
        (channel, rx)
    }
}

impl SecureChannel for MockChannel {
    fn connect(&self, _request: ConnectRequest) -> Result<ChannelHandles, ChannelError> {
        let n = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let (handles, endpoint) = channel_pair(Arc::new(FixedCipher(connection_id(n))));
        let _ = self.endpoints.send(endpoint);
        Ok(handles.with_driver(std::future::pending::<Result<(), ChannelError>>()))
    }
}

/// The remote side of one mock channel generation.
pub struct FakePeer {
    pub endpoint: DriverEndpoint,
    unchunker: Unchunker,
    next_id: u64,
    /// Chunks received from the session.
    pub received: u64,
    /// Chunks sent to the session.
    pub sent: u64,
}

impl FakePeer {
    pub fn new(endpoint: DriverEndpoint) -> Self {
        Self {
            endpoint,
            unchunker: Unchunker::new(),
            next_id: 0,
            received: 0,
            sent: 0,
        }
    }

    pub async fn accept(endpoints: &mut mpsc::UnboundedReceiver<DriverEndpoint>) -> Self {
        let endpoint = tokio::time::timeout(RECV_TIMEOUT, endpoints.recv())
            .await
            .expect("no channel generation")
            .expect("channel dropped");
        Self::new(endpoint)
    }

    pub fn event(&self, event: ChannelEvent) {
        self.endpoint.events.send(event).unwrap();
    }

    /// Relay and peer handshakes with the peer already present.
    pub fn handshake(&self) {
        self.event(ChannelEvent::Connecting);
        self.event(ChannelEvent::ServerHandshakeComplete {
            peer_connected: true,
        });
        self.event(ChannelEvent::PeerHandshakeComplete);
    }

    /// Next raw chunk handed to the send primitive.
    pub async fn next_chunk(&mut self) -> Bytes {
        let frame = tokio::time::timeout(RECV_TIMEOUT, self.endpoint.outgoing.recv())
            .await
            .expect("no outgoing chunk")
            .expect("sender dropped");
        self.received += 1;
        strip_length_prefix(frame).unwrap()
    }

    /// Next complete message sent by the session.
    pub async fn next_message(&mut self) -> WireMessage {
        loop {
            let chunk = self.next_chunk().await;
            if let Some(message) = self.unchunker.add_chunk(chunk).unwrap() {
                return WireMessage::decode(&message).unwrap();
            }
        }
    }

    pub async fn expect_info(&mut self) -> ResumptionInfo {
        match self.next_message().await {
            WireMessage::ConnectionInfo(info) => info,
            other => panic!("expected connection info, got {other:?}"),
        }
    }

    pub fn send(&mut self, message: &WireMessage) {
        let data = message.encode().unwrap();
        for chunk in Chunker::new(self.next_id, data, DEFAULT_CHUNK_SIZE).unwrap() {
            let frame = length_prefixed(&chunk).unwrap();
            self.endpoint.incoming.send(Incoming::Data(frame)).unwrap();
            self.sent += 1;
        }
        self.next_id += 1;
    }

    pub fn send_info(&mut self, current: Bytes, previous: Option<(Bytes, u64)>) {
        let (previous_id, previous_sequence) = match previous {
            Some((id, sequence)) => (Some(id), Some(sequence)),
            None => (None, None),
        };
        self.send(&WireMessage::ConnectionInfo(ResumptionInfo {
            current_id: current,
            previous_id,
            previous_sequence,
        }));
    }

    pub fn send_payload(&mut self, payload: &'static [u8]) {
        self.send(&WireMessage::Application {
            payload: Bytes::from_static(payload),
        });
    }

    pub async fn expect_payload(&mut self) -> Bytes {
        match self.next_message().await {
            WireMessage::Application { payload } => payload,
            other => panic!("expected application message, got {other:?}"),
        }
    }

    /// Whether the session handed over nothing further.
    pub fn is_quiet(&mut self) -> bool {
        self.endpoint.outgoing.try_recv().is_err()
    }
}

pub struct Harness {
    pub session: Session,
    pub inbound: InboundMessages,
    pub endpoints: mpsc::UnboundedReceiver<DriverEndpoint>,
    pub key_store: Arc<MemoryKeyStore>,
    pub registry: ActiveSessions,
}

pub fn peer_key() -> PublicKey {
    PublicKey::from_bytes([0x42; 32])
}

pub fn config() -> SessionConfig {
    SessionConfig::builder()
        .peer_public_key(peer_key())
        .server_public_key(PublicKey::from_bytes([0x24; 32]))
        .build()
}

pub fn harness() -> Harness {
    harness_with(config())
}

pub fn harness_with(config: SessionConfig) -> Harness {
    init_tracing();
    let (channel, endpoints) = MockChannel::new();
    let key_store = Arc::new(MemoryKeyStore::new());
    let registry = ActiveSessions::new();
    let (session, inbound) =
        Session::new(config, channel, key_store.clone(), registry.clone()).unwrap();
    Harness {
        session,
        inbound,
        endpoints,
        key_store,
        registry,
    }
}

/// Connect and complete a fresh pairing, returning the peer.
pub async fn ready_peer(harness: &mut Harness) -> FakePeer {
    harness.session.connect(None).await.unwrap();
    let mut peer = FakePeer::accept(&mut harness.endpoints).await;
    peer.handshake();
    let info = peer.expect_info().await;
    assert!(info.previous_id.is_none());
    peer.send_info(Bytes::from_static(b"peer-1"), None);
    wait_for_state(&harness.session, ConnectionState::Ready).await;
    peer
}

pub async fn wait_for_state(session: &Session, state: ConnectionState) {
    let result = tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            if session.state().await == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    if result.is_err() {
        panic!(
            "session stuck in {:?}, expected {state}",
            session.state().await
        );
    }
}
