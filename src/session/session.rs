//! Caller-facing session handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, MutexGuard, broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::connection::{
    CloseOptions, CloseReason, Connection, ConnectionState, SessionShared, StateChange,
};
use crate::core::{KeyStore, STATE_EVENT_CAPACITY, SessionError};
use crate::crypto::{Keypair, PublicKey, SessionId};
use crate::transport::{ConnectRequest, SecureChannel};

use super::{ActiveSessions, Completion, OutboundQueue, RequestMarkers, SessionConfig};

/// Receiver of reassembled application payloads from the peer.
#[derive(Debug)]
pub struct InboundMessages {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl InboundMessages {
    /// Receive the next payload. Returns `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Receive a payload if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, Default)]
struct Active {
    connection: Option<Connection>,
    generation: u64,
}

/// Long-lived pairing with one peer.
///
/// Owns the key material, the active [`Connection`] and the outbound
/// queue. Each [`connect`](Session::connect) creates a new connection
/// generation, silently replacing the previous one and carrying its
/// context forward so that the peer can resume.
///
/// # Example
///
/// ```ignore
/// use relaypair::prelude::*;
///
/// let config = SessionConfig::builder()
///     .peer_public_key(peer)
///     .server_public_key(server)
///     .build();
/// let channel = Arc::new(RelayedChannel::new(TcpConnector::new(RelayConfig::new("relay:9000"))));
/// let (session, mut inbound) =
///     Session::new(config, channel, Arc::new(MemoryKeyStore::new()), ActiveSessions::new())?;
///
/// session.connect(None).await?;
/// session.send_message(Bytes::from_static(b"hello"), true).await?;
/// ```
pub struct Session {
    shared: Arc<SessionShared>,
    channel: Arc<dyn SecureChannel>,
    active: Mutex<Active>,
    keypair: Mutex<Option<Keypair>>,
    markers: Mutex<RequestMarkers>,
    queue: OutboundQueue,
}

impl Session {
    /// Create a session. Must be called within a Tokio runtime.
    pub fn new(
        config: SessionConfig,
        channel: Arc<dyn SecureChannel>,
        key_store: Arc<dyn KeyStore>,
        registry: ActiveSessions,
    ) -> Result<(Self, InboundMessages), SessionError> {
        let peer = config
            .peer_public_key
            .ok_or_else(|| SessionError::Config("peer public key missing".into()))?;

        let (state_events, _) = broadcast::channel(STATE_EVENT_CAPACITY);
        let (inbound, rx) = mpsc::unbounded_channel();
        let (ready, ready_rx) = watch::channel(None);
        let markers = RequestMarkers::new(config.request_marker_capacity);

        let shared = Arc::new(SessionShared {
            session_id: SessionId::for_peer(&peer),
            config: Arc::new(config),
            registry,
            key_store,
            state_events,
            inbound,
            ready,
            current: AtomicU64::new(0),
        });

        let session = Self {
            shared,
            channel,
            active: Mutex::new(Active::default()),
            keypair: Mutex::new(None),
            markers: Mutex::new(markers),
            queue: OutboundQueue::spawn(ready_rx),
        };
        Ok((session, InboundMessages { rx }))
    }

    /// Session identifier (hash of the peer's public key).
    pub fn session_id(&self) -> SessionId {
        self.shared.session_id
    }

    /// Whether the session is registered as running.
    pub fn is_running(&self) -> bool {
        self.shared.registry.contains(&self.shared.session_id)
    }

    /// Own public key, restoring or generating the keypair on first use.
    pub async fn public_key(&self) -> PublicKey {
        *self.keypair().await.public_key()
    }

    async fn keypair(&self) -> Keypair {
        let mut cached = self.keypair.lock().await;
        if let Some(keypair) = cached.as_ref() {
            return keypair.clone();
        }

        let store = &self.shared.key_store;
        let id = &self.shared.session_id;
        let keypair = match store.load_private_key(id) {
            Some(private) => {
                debug!(session = %id, "restored session key");
                Keypair::restore(private)
            }
            None => {
                let keypair = Keypair::generate();
                store.store_private_key(id, *keypair.private_key());
                debug!(session = %id, "generated session key");
                keypair
            }
        };
        *cached = Some(keypair.clone());
        keypair
    }

    /// Start a new connection generation.
    ///
    /// An active connection is closed as replaced (silently, keeping its
    /// registration) and its context is carried into the new generation.
    pub async fn connect(&self, auth_token: Option<Bytes>) -> Result<(), SessionError> {
        let config = &self.shared.config;
        config.validate()?;
        let peer_public_key = config
            .peer_public_key
            .ok_or_else(|| SessionError::Config("peer public key missing".into()))?;
        let server_public_key = config
            .server_public_key
            .ok_or_else(|| SessionError::Config("server public key missing".into()))?;

        let keypair = self.keypair().await;
        let session_id = self.shared.session_id;
        self.shared.registry.insert(session_id);

        let mut active = self.active.lock().await;
        let context = match active.connection.take() {
            Some(old) => {
                // Closing first stops further sends, so the carried cache
                // holds every chunk the old generation handed out
                old.close(CloseOptions::replace()).await;
                old.context().await
            }
            None => None,
        };

        active.generation += 1;
        let generation = active.generation;
        self.shared.current.store(generation, Ordering::Release);
        info!(session = %session_id, generation, resume = context.is_some(), "connecting");

        let connection = Connection::new(Arc::clone(&self.shared), generation, context);
        active.connection = Some(connection.clone());

        let request = ConnectRequest {
            keypair,
            peer_public_key,
            server_public_key,
            auth_token,
            ping_interval: config.ping_interval,
        };
        if let Err(e) = connection.connect(self.channel.as_ref(), request).await {
            warn!(session = %session_id, generation, error = %e, "channel initialisation failed");
            connection
                .close(CloseOptions::new(CloseReason::Error).keep_context())
                .await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Close the active connection.
    pub async fn stop(&self, options: CloseOptions) {
        let connection = self.active.lock().await.connection.clone();
        match connection {
            Some(connection) => connection.close(options).await,
            None => {
                if options.reason.is_terminal() {
                    self.shared.registry.remove(&self.shared.session_id);
                }
                if options.forget {
                    self.shared.key_store.forget(&self.shared.session_id);
                }
            }
        }
        if options.reason.is_terminal() {
            self.markers.lock().await.clear_all();
        }
    }

    /// Delete the pairing: notify the peer, close and drop the stored key.
    pub async fn forget(&self) {
        self.stop(CloseOptions::new(CloseReason::Delete).with_notice().forget())
            .await;
        self.keypair.lock().await.take();
    }

    /// Queue an application message for the peer.
    ///
    /// Non-cacheable messages are not replayed after a reconnect.
    pub fn send_message(&self, payload: Bytes, cacheable: bool) -> Completion {
        self.queue.enqueue(payload, cacheable)
    }

    /// State of the active connection, if any.
    pub async fn state(&self) -> Option<ConnectionState> {
        self.active
            .lock()
            .await
            .connection
            .as_ref()
            .map(Connection::state)
    }

    /// The active connection, if any.
    pub async fn connection(&self) -> Option<Connection> {
        self.active.lock().await.connection.clone()
    }

    /// Subscribe to state changes of every generation.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.shared.state_events.subscribe()
    }

    /// Request markers for the caller-facing layer.
    pub async fn requests(&self) -> MutexGuard<'_, RequestMarkers> {
        self.markers.lock().await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.shared.session_id)
            .finish_non_exhaustive()
    }
}
