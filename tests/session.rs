//! Session lifecycle scenarios against a mock secure channel.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use relaypair::connection::{CloseOptions, CloseReason, ConnectionState, WireMessage};
use relaypair::core::{
    CHUNK_LENGTH_PREFIX_SIZE, CLOSE_CODE_NORMAL, CLOSE_CODE_PROTOCOL_ERROR, ChannelError,
    CryptoError, DEFAULT_CHUNK_SIZE, KeyStore,
};
use relaypair::framer::{Chunk, strip_length_prefix};
use relaypair::transport::{ChannelEvent, Incoming};

use common::{FakePeer, connection_id, harness, harness_with, ready_peer, wait_for_state};

#[tokio::test]
async fn test_clean_pairing_large_message() {
    let mut h = harness();
    let mut peer = ready_peer(&mut h).await;
    assert!(h.session.is_running());
    assert_eq!(h.key_store.len(), 1);

    let payload = Bytes::from(vec![0xab; 200 * 1024]);
    h.session.send_message(payload.clone(), true).await.unwrap();

    let mut chunks = Vec::new();
    loop {
        let chunk = Chunk::parse(peer.next_chunk().await).unwrap();
        let done = chunk.is_end_of_message();
        chunks.push(chunk);
        if done {
            break;
        }
    }
    // The envelope adds a few bytes on top of the payload
    assert_eq!(chunks.len(), 4);
    assert!(
        chunks
            .iter()
            .all(|c| c.serialize().len() <= DEFAULT_CHUNK_SIZE)
    );
    assert!(chunks.iter().all(|c| c.id() == 1));

    let merged: Vec<u8> = chunks.iter().flat_map(|c| c.data().to_vec()).collect();
    assert_eq!(
        WireMessage::decode(&merged).unwrap(),
        WireMessage::Application { payload }
    );

    peer.send_payload(b"from peer");
    assert_eq!(
        h.inbound.recv().await,
        Some(Bytes::from_static(b"from peer"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_peer_never_joins() {
    let mut h = harness();
    h.session.connect(None).await.unwrap();
    let mut peer = FakePeer::accept(&mut h.endpoints).await;
    let started = Instant::now();

    peer.event(ChannelEvent::Connecting);
    peer.event(ChannelEvent::ServerHandshakeComplete {
        peer_connected: false,
    });
    wait_for_state(&h.session, ConnectionState::ServerHandshakeComplete).await;

    let code = (&mut peer.endpoint.disconnect).await.unwrap();
    assert_eq!(code, CLOSE_CODE_NORMAL);
    assert!(started.elapsed() >= Duration::from_secs(10));

    wait_for_state(&h.session, ConnectionState::Disconnected).await;
    assert!(!h.session.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_peer_joining_cancels_wait() {
    let mut h = harness();
    h.session.connect(None).await.unwrap();
    let mut peer = FakePeer::accept(&mut h.endpoints).await;

    peer.event(ChannelEvent::Connecting);
    peer.event(ChannelEvent::ServerHandshakeComplete {
        peer_connected: false,
    });
    tokio::time::sleep(Duration::from_secs(5)).await;
    peer.event(ChannelEvent::PeerHandshakeComplete);
    peer.expect_info().await;
    peer.send_info(Bytes::from_static(b"peer"), None);
    wait_for_state(&h.session, ConnectionState::Ready).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.session.state().await, Some(ConnectionState::Ready));
}

#[tokio::test]
async fn test_nothing_sent_before_ready() {
    let mut h = harness();
    let early = h
        .session
        .send_message(Bytes::from_static(b"early"), true);

    h.session.connect(None).await.unwrap();
    let mut peer = FakePeer::accept(&mut h.endpoints).await;
    peer.handshake();

    // Only the privileged resumption info goes out before Ready
    peer.expect_info().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(peer.is_quiet());

    peer.send_info(Bytes::from_static(b"peer"), None);
    assert_eq!(peer.expect_payload().await, Bytes::from_static(b"early"));
    early.await.unwrap();
}

#[tokio::test]
async fn test_order_preserved_under_load() {
    let mut h = harness();
    let mut peer = ready_peer(&mut h).await;

    let completions: Vec<_> = (0..100u32)
        .map(|n| {
            h.session
                .send_message(Bytes::from(n.to_be_bytes().to_vec()), n % 3 != 0)
        })
        .collect();
    for completion in completions {
        completion.await.unwrap();
    }

    for n in 0..100u32 {
        let payload = peer.expect_payload().await;
        assert_eq!(payload.as_ref(), n.to_be_bytes());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_order_preserved_across_producers() {
    const PRODUCERS: u8 = 4;
    const PER_PRODUCER: u16 = 50;

    let mut h = harness();
    let mut peer = ready_peer(&mut h).await;
    let session = Arc::new(h.session);

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let completions: Vec<_> = (0..PER_PRODUCER)
                    .map(|n| {
                        let [hi, lo] = n.to_be_bytes();
                        session.send_message(Bytes::from(vec![producer, hi, lo]), true)
                    })
                    .collect();
                for completion in completions {
                    completion.await.unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    let mut last_id = None;
    let mut next_seq: HashMap<u8, u16> = HashMap::new();
    for _ in 0..u32::from(PRODUCERS) * u32::from(PER_PRODUCER) {
        let chunk = Chunk::parse(peer.next_chunk().await).unwrap();
        assert!(chunk.is_end_of_message());
        if let Some(last) = last_id {
            assert!(chunk.id() > last, "chunk id {} after {last}", chunk.id());
        }
        last_id = Some(chunk.id());

        let WireMessage::Application { payload } = WireMessage::decode(chunk.data()).unwrap()
        else {
            panic!("expected application message");
        };
        let (producer, seq) = (payload[0], u16::from_be_bytes([payload[1], payload[2]]));
        let expected = next_seq.entry(producer).or_default();
        assert_eq!(seq, *expected, "producer {producer} out of order");
        *expected += 1;
    }
    assert!(next_seq.values().all(|&n| n == PER_PRODUCER));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replace_during_sends_carries_every_chunk() {
    for _ in 0..25 {
        let mut h = harness();
        let mut first = ready_peer(&mut h).await;
        let old = h.session.connection().await.unwrap();

        let sender = tokio::spawn(async move {
            let mut sent = 0u64;
            while old
                .send_message(Bytes::from_static(b"racing"), true)
                .await
                .is_ok()
            {
                sent += 1;
                if sent % 8 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            sent
        });
        tokio::task::yield_now().await;
        h.session.connect(None).await.unwrap();
        let sent = sender.await.unwrap();

        // Everything the first generation handed to its channel
        let mut ids = Vec::new();
        while let Some(frame) = first.endpoint.outgoing.recv().await {
            ids.push(Chunk::parse(strip_length_prefix(frame).unwrap()).unwrap().id());
        }
        assert_eq!(ids.len() as u64, sent);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        let delivered = first.received + sent;

        let mut second = FakePeer::accept(&mut h.endpoints).await;
        second.handshake();
        second.expect_info().await;
        let context = h.session.connection().await.unwrap().context().await.unwrap();
        let previous = context.previous().unwrap();
        assert_eq!(previous.chunk_cache().sequence_number(), delivered);
        // The new info message took the id after the last racing one
        assert_eq!(context.outgoing_counter(), ids.last().copied().unwrap_or(0) + 2);

        second.send_info(
            Bytes::from_static(b"peer-2"),
            Some((connection_id(1), delivered)),
        );
        wait_for_state(&h.session, ConnectionState::Ready).await;
    }
}

#[tokio::test]
async fn test_replace_resumes_previous_generation() {
    let mut h = harness();
    let mut first = ready_peer(&mut h).await;

    // id 1 and 2 reach the peer, id 3 is lost, id 4 is not cacheable
    for (payload, cacheable) in [
        (&b"one"[..], true),
        (&b"two"[..], true),
        (&b"three"[..], true),
        (&b"four"[..], false),
    ] {
        h.session
            .send_message(Bytes::from_static(payload), cacheable)
            .await
            .unwrap();
    }
    first.next_message().await;
    first.next_message().await;
    let acknowledged = first.received;
    assert_eq!(acknowledged, 3);
    first.send_payload(b"hello");
    assert_eq!(h.inbound.recv().await, Some(Bytes::from_static(b"hello")));

    h.session.connect(None).await.unwrap();
    assert!(h.session.is_running());
    // Replacement is silent: the old handles are dropped, not disconnected
    assert!((&mut first.endpoint.disconnect).await.is_err());

    let mut second = FakePeer::accept(&mut h.endpoints).await;
    second.handshake();
    let info = second.expect_info().await;
    assert_eq!(info.current_id, connection_id(2));
    assert_eq!(info.previous_id, Some(connection_id(1)));
    assert_eq!(info.previous_sequence, Some(first.sent));

    second.send_info(
        Bytes::from_static(b"peer-2"),
        Some((connection_id(1), acknowledged)),
    );
    let resent = Chunk::parse(second.next_chunk().await).unwrap();
    assert_eq!(resent.id(), 3);
    assert_eq!(
        WireMessage::decode(resent.data()).unwrap(),
        WireMessage::Application {
            payload: Bytes::from_static(b"three")
        }
    );
    wait_for_state(&h.session, ConnectionState::Ready).await;

    h.session
        .send_message(Bytes::from_static(b"five"), true)
        .await
        .unwrap();
    let next = Chunk::parse(second.next_chunk().await).unwrap();
    // Counter continues past the info message of the new generation
    assert_eq!(next.id(), 6);

    let connection = h.session.connection().await.unwrap();
    assert_eq!(connection.generation(), 2);
    let context = connection.context().await.unwrap();
    assert!(context.previous().is_none());
}

#[tokio::test]
async fn test_unknown_previous_id_starts_fresh() {
    let mut h = harness();
    let _first = ready_peer(&mut h).await;
    h.session
        .send_message(Bytes::from_static(b"lost"), true)
        .await
        .unwrap();

    h.session.connect(None).await.unwrap();
    let mut second = FakePeer::accept(&mut h.endpoints).await;
    second.handshake();
    second.expect_info().await;
    second.send_info(Bytes::from_static(b"peer-2"), None);
    wait_for_state(&h.session, ConnectionState::Ready).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(second.is_quiet());
}

#[tokio::test(start_paused = true)]
async fn test_stop_twice_sends_one_notice() {
    let mut h = harness();
    let mut peer = ready_peer(&mut h).await;

    let options = CloseOptions::new(CloseReason::Stop).with_notice();
    h.session.stop(options).await;
    h.session.stop(options).await;
    assert_eq!(
        h.session.state().await,
        Some(ConnectionState::Disconnecting)
    );

    assert_eq!(
        peer.next_message().await,
        WireMessage::Disconnect {
            reason: CloseReason::Stop
        }
    );
    let code = (&mut peer.endpoint.disconnect).await.unwrap();
    assert_eq!(code, CLOSE_CODE_NORMAL);
    assert!(peer.is_quiet());

    wait_for_state(&h.session, ConnectionState::Disconnected).await;
    let connection = h.session.connection().await.unwrap();
    assert!(!connection.owns_teardown());
    assert!(connection.context().await.is_none());
    assert!(!h.registry.contains(&h.session.session_id()));
}

#[tokio::test]
async fn test_pause_keeps_registration() {
    let mut h = harness();
    let _peer = ready_peer(&mut h).await;

    h.session
        .stop(CloseOptions::new(CloseReason::Pause).keep_context())
        .await;
    wait_for_state(&h.session, ConnectionState::Disconnected).await;
    assert!(h.session.is_running());
}

#[tokio::test]
async fn test_send_after_close_is_refused() {
    let mut h = harness();
    let _peer = ready_peer(&mut h).await;
    let connection = h.session.connection().await.unwrap();

    h.session.stop(CloseOptions::new(CloseReason::Stop)).await;
    let result = connection
        .send_message(Bytes::from_static(b"late"), true)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_peer_delete_forgets_session() {
    let mut h = harness();
    let mut peer = ready_peer(&mut h).await;
    let id = h.session.session_id();
    assert!(h.key_store.load_private_key(&id).is_some());

    peer.send(&WireMessage::Disconnect {
        reason: CloseReason::Delete,
    });
    wait_for_state(&h.session, ConnectionState::Disconnected).await;
    assert!(h.key_store.load_private_key(&id).is_none());
    assert!(!h.session.is_running());
    // A peer-initiated close sends no notice back
    assert!(peer.is_quiet());
}

#[tokio::test(start_paused = true)]
async fn test_forget_notifies_peer() {
    let mut h = harness();
    let mut peer = ready_peer(&mut h).await;
    let old_key = h.session.public_key().await;

    h.session.forget().await;
    assert_eq!(
        peer.next_message().await,
        WireMessage::Disconnect {
            reason: CloseReason::Delete
        }
    );
    assert_eq!((&mut peer.endpoint.disconnect).await, Ok(CLOSE_CODE_NORMAL));
    assert!(h.key_store.is_empty());
    assert_ne!(h.session.public_key().await, old_key);
}

#[tokio::test]
async fn test_receive_failure_closes_with_error() {
    let mut h = harness();
    let mut peer = ready_peer(&mut h).await;

    peer.endpoint
        .incoming
        .send(Incoming::Failed(ChannelError::Crypto(
            CryptoError::DecryptionFailed,
        )))
        .unwrap();
    assert_eq!(
        (&mut peer.endpoint.disconnect).await,
        Ok(CLOSE_CODE_PROTOCOL_ERROR)
    );
    wait_for_state(&h.session, ConnectionState::Disconnected).await;
    assert!(peer.is_quiet());
}

#[tokio::test(start_paused = true)]
async fn test_malformed_chunk_closes_with_notice() {
    let mut h = harness();
    let mut peer = ready_peer(&mut h).await;

    // Shorter than a chunk header
    let frame = Bytes::from_static(&[0, 0, 0, 2, 1, 2]);
    assert_eq!(frame.len(), CHUNK_LENGTH_PREFIX_SIZE + 2);
    peer.endpoint.incoming.send(Incoming::Data(frame)).unwrap();

    assert_eq!(
        peer.next_message().await,
        WireMessage::Disconnect {
            reason: CloseReason::Error
        }
    );
    assert_eq!(
        (&mut peer.endpoint.disconnect).await,
        Ok(CLOSE_CODE_PROTOCOL_ERROR)
    );
}

#[tokio::test]
async fn test_peer_disconnected_event_stops() {
    let mut h = harness();
    let peer = ready_peer(&mut h).await;
    let mut changes = h.session.subscribe();

    peer.event(ChannelEvent::PeerDisconnected);
    wait_for_state(&h.session, ConnectionState::Disconnected).await;

    let change = changes.recv().await.unwrap();
    assert_eq!(change.generation, 1);
    assert_eq!(change.from, ConnectionState::Ready);
    assert_eq!(change.to, ConnectionState::Disconnecting);
    assert!(!h.session.is_running());
}

#[tokio::test]
async fn test_connect_without_server_key_fails() {
    let config = relaypair::SessionConfig::builder()
        .peer_public_key(common::peer_key())
        .build();
    let h = harness_with(config);
    let err = h.session.connect(None).await.unwrap_err();
    assert!(matches!(err, relaypair::SessionError::Config(_)));
    assert!(!h.session.is_running());
}

#[tokio::test]
async fn test_key_restored_across_sessions() {
    let h = harness();
    let key = h.session.public_key().await;
    let stored = h
        .key_store
        .load_private_key(&h.session.session_id())
        .unwrap();
    assert_eq!(
        relaypair::crypto::Keypair::restore(stored).public_key(),
        &key
    );
}
