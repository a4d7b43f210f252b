//! End-to-end runs of the relayed channel against an in-process relay.
//!
//! The test plays both the relay and the peer on the far end of a
//! duplex stream, speaking the real handshakes and link framing.

#![cfg(feature = "relay")]

mod common;

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use relaypair::connection::{CloseOptions, CloseReason, ConnectionState, ResumptionInfo, WireMessage};
use relaypair::core::{
    CLOSE_CODE_NORMAL, CONNECTION_ID_NONCE, DEFAULT_CHUNK_SIZE, LINK_KEYS_LABEL,
    MAX_LINK_FRAME_SIZE, MemoryKeyStore, PEER_KEYS_LABEL,
};
use relaypair::crypto::{
    FrameCipher, Keypair, PublicKey, ResponderHandshake, Role, SessionCipher, SessionKeySlot, SessionKeys,
};
use relaypair::framer::{Chunker, Unchunker, length_prefixed, strip_length_prefix};
use relaypair::session::{ActiveSessions, InboundMessages, Session, SessionConfig};
use relaypair::transport::{ClientHello, Connector, RelayFrame, RelayedChannel, ServerHello};

use common::{RECV_TIMEOUT, init_tracing, wait_for_state};

/// Hands out one prepared stream per connect.
struct DuplexConnector {
    streams: Mutex<VecDeque<DuplexStream>>,
}

impl Connector for DuplexConnector {
    type Stream = DuplexStream;

    fn connect(&self) -> BoxFuture<'static, io::Result<DuplexStream>> {
        let stream = self.streams.lock().unwrap().pop_front();
        Box::pin(async move {
            stream.ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no more links"))
        })
    }
}

/// Far end of the link: relay and peer in one.
struct FarEnd {
    link: Framed<DuplexStream, LengthDelimitedCodec>,
    relay: Keypair,
    peer: Keypair,
    link_cipher: Option<FrameCipher>,
    peer_cipher: Option<FrameCipher>,
    peer_keys: Arc<SessionKeySlot>,
    unchunker: Unchunker,
    next_id: u64,
}

impl FarEnd {
    async fn next_frame(&mut self) -> Option<RelayFrame> {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.link.next())
                .await
                .expect("link stalled")?
                .unwrap();
            let cipher = self.link_cipher.as_mut().unwrap();
            match RelayFrame::open(cipher, &frame).unwrap() {
                RelayFrame::Ping => continue,
                other => return Some(other),
            }
        }
    }

    async fn send_frame(&mut self, frame: RelayFrame) {
        let sealed = frame.seal(self.link_cipher.as_mut().unwrap()).unwrap();
        self.link.send(sealed).await.unwrap();
    }

    async fn server_handshake(&mut self, peer_connected: bool) -> PublicKey {
        let message = self.link.next().await.unwrap().unwrap();
        let mut responder = ResponderHandshake::new(&self.relay).unwrap();
        let (payload, client) = responder.read_message(&message).unwrap();
        let hello: ClientHello = rmp_serde::from_slice(&payload).unwrap();
        assert_eq!(hello.path.as_ref(), self.peer.public_key().as_bytes());

        let reply = rmp_serde::to_vec(&ServerHello { peer_connected }).unwrap();
        let (reply, result) = responder.write_message(&reply).unwrap();
        self.link.send(Bytes::from(reply)).await.unwrap();

        let keys = SessionKeys::derive(&result, LINK_KEYS_LABEL).unwrap();
        self.link_cipher = Some(FrameCipher::new(&keys, Role::Responder));
        client
    }

    async fn peer_handshake(&mut self) -> Vec<u8> {
        let Some(RelayFrame::Relay { data }) = self.next_frame().await else {
            panic!("expected peer handshake");
        };
        let mut responder = ResponderHandshake::new(&self.peer).unwrap();
        let (token, _) = responder.read_message(&data).unwrap();
        let (reply, result) = responder.write_message(b"").unwrap();
        self.send_frame(RelayFrame::Relay {
            data: Bytes::from(reply),
        })
        .await;

        let keys = SessionKeys::derive(&result, PEER_KEYS_LABEL).unwrap();
        self.peer_cipher = Some(FrameCipher::new(&keys, Role::Responder));
        self.peer_keys
            .install(SessionKeys::derive(&result, PEER_KEYS_LABEL).unwrap());
        token
    }

    async fn next_message(&mut self) -> Option<WireMessage> {
        loop {
            let RelayFrame::Relay { data } = self.next_frame().await? else {
                return None;
            };
            let frame = self.peer_cipher.as_mut().unwrap().open(&data).unwrap();
            let chunk = strip_length_prefix(Bytes::from(frame)).unwrap();
            if let Some(message) = self.unchunker.add_chunk(chunk).unwrap() {
                return Some(WireMessage::decode(&message).unwrap());
            }
        }
    }

    async fn send_message(&mut self, message: WireMessage) {
        let data = message.encode().unwrap();
        let chunks: Vec<Bytes> = Chunker::new(self.next_id, data, DEFAULT_CHUNK_SIZE)
            .unwrap()
            .collect();
        self.next_id += 1;
        for chunk in chunks {
            let framed = length_prefixed(&chunk).unwrap();
            let sealed = self.peer_cipher.as_mut().unwrap().seal(&framed).unwrap();
            self.send_frame(RelayFrame::Relay {
                data: Bytes::from(sealed),
            })
            .await;
        }
    }

    fn connection_id(&self) -> Bytes {
        Bytes::from(
            self.peer_keys
                .encrypt_with_session_keys(&[], CONNECTION_ID_NONCE)
                .unwrap(),
        )
    }
}

fn setup() -> (Session, InboundMessages, FarEnd) {
    let (session, inbound, mut ends) = setup_links(1);
    let far_end = ends.pop_front().unwrap();
    (session, inbound, far_end)
}

/// A session whose channel connects to `count` far ends, in order.
fn setup_links(count: usize) -> (Session, InboundMessages, VecDeque<FarEnd>) {
    init_tracing();
    let relay = Keypair::generate();
    let peer = Keypair::generate();
    let (near, far): (VecDeque<_>, Vec<_>) = (0..count)
        .map(|_| tokio::io::duplex(4 * MAX_LINK_FRAME_SIZE))
        .unzip();

    let config = SessionConfig::builder()
        .peer_public_key(*peer.public_key())
        .server_public_key(*relay.public_key())
        .disconnect_grace(Duration::from_millis(50))
        .build();
    let channel = RelayedChannel::new(DuplexConnector {
        streams: Mutex::new(near),
    });
    let (session, inbound) = Session::new(
        config,
        Arc::new(channel),
        Arc::new(MemoryKeyStore::new()),
        ActiveSessions::new(),
    )
    .unwrap();

    let ends = far
        .into_iter()
        .map(|far| {
            let codec = LengthDelimitedCodec::builder()
                .max_frame_length(MAX_LINK_FRAME_SIZE)
                .new_codec();
            FarEnd {
                link: Framed::new(far, codec),
                relay: relay.clone(),
                peer: peer.clone(),
                link_cipher: None,
                peer_cipher: None,
                peer_keys: Arc::new(SessionKeySlot::new()),
                unchunker: Unchunker::new(),
                next_id: 0,
            }
        })
        .collect();
    (session, inbound, ends)
}

#[tokio::test]
async fn test_pairing_through_relay() {
    let (session, mut inbound, mut far) = setup();
    let app_key = session.public_key().await;

    session
        .connect(Some(Bytes::from_static(b"one-time token")))
        .await
        .unwrap();
    let client = far.server_handshake(true).await;
    assert_eq!(client, app_key);
    assert_eq!(far.peer_handshake().await, b"one-time token");

    let Some(WireMessage::ConnectionInfo(info)) = far.next_message().await else {
        panic!("expected connection info");
    };
    // Both ends derive the same id from the peer session keys
    assert_eq!(info.current_id, far.connection_id());
    assert!(info.previous_id.is_none());

    far.send_message(WireMessage::ConnectionInfo(ResumptionInfo {
        current_id: far.connection_id(),
        previous_id: None,
        previous_sequence: None,
    }))
    .await;
    wait_for_state(&session, ConnectionState::Ready).await;

    session
        .send_message(Bytes::from_static(b"ping"), true)
        .await
        .unwrap();
    assert_eq!(
        far.next_message().await,
        Some(WireMessage::Application {
            payload: Bytes::from_static(b"ping")
        })
    );

    far.send_message(WireMessage::Application {
        payload: Bytes::from_static(b"pong"),
    })
    .await;
    assert_eq!(inbound.recv().await, Some(Bytes::from_static(b"pong")));

    session
        .stop(CloseOptions::new(CloseReason::Stop).with_notice())
        .await;
    assert_eq!(
        far.next_message().await,
        Some(WireMessage::Disconnect {
            reason: CloseReason::Stop
        })
    );
    assert_eq!(
        far.next_frame().await,
        Some(RelayFrame::Close {
            code: CLOSE_CODE_NORMAL
        })
    );
    wait_for_state(&session, ConnectionState::Disconnected).await;
}

#[tokio::test]
async fn test_peer_joins_later_then_leaves() {
    let (session, _inbound, mut far) = setup();
    session.connect(None).await.unwrap();
    far.server_handshake(false).await;
    wait_for_state(&session, ConnectionState::ServerHandshakeComplete).await;

    far.send_frame(RelayFrame::PeerJoined).await;
    assert!(far.peer_handshake().await.is_empty());
    wait_for_state(&session, ConnectionState::ResumeInfoSent).await;

    far.send_frame(RelayFrame::PeerLeft).await;
    wait_for_state(&session, ConnectionState::Disconnected).await;
    assert!(!session.is_running());
}

#[tokio::test]
async fn test_replace_leaves_link_without_close() {
    let (session, _inbound, mut ends) = setup_links(2);
    let mut first = ends.pop_front().unwrap();
    let mut second = ends.pop_front().unwrap();

    session.connect(None).await.unwrap();
    first.server_handshake(true).await;
    first.peer_handshake().await;
    let Some(WireMessage::ConnectionInfo(_)) = first.next_message().await else {
        panic!("expected connection info");
    };
    first
        .send_message(WireMessage::ConnectionInfo(ResumptionInfo {
            current_id: first.connection_id(),
            previous_id: None,
            previous_sequence: None,
        }))
        .await;
    wait_for_state(&session, ConnectionState::Ready).await;

    session.connect(None).await.unwrap();
    // The superseded link just ends, the relay sees no close frame
    assert_eq!(first.next_frame().await, None);

    second.server_handshake(true).await;
    assert!(second.peer_handshake().await.is_empty());
    let Some(WireMessage::ConnectionInfo(info)) = second.next_message().await else {
        panic!("expected connection info");
    };
    assert_eq!(info.previous_id, Some(first.connection_id()));
    assert!(session.is_running());
}
