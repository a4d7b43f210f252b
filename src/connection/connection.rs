//! One connection generation.
//!
//! A [`Connection`] drives a single secure-channel generation from `New`
//! to `Disconnected`. Three tasks run per generation:
//!
//! - the channel driver, which resolves when the channel is torn down
//! - the event dispatcher, which consumes [`ChannelEvent`]s until the
//!   terminal one
//! - the message dispatcher, started once the peer is authenticated
//!
//! Outbound sends are serialised by the context lock, so the message
//! counter and the chunk cache are never mutated concurrently. Every
//! error path ends in [`Connection::close`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{CONNECTION_ID_NONCE, ChannelError, KeyStore, ReceiveError, SendError};
use crate::crypto::{SessionCipher, SessionId};
use crate::framer::{length_prefixed, strip_length_prefix};
use crate::session::{ActiveSessions, SessionConfig};
use crate::transport::{
    ChannelEvent, ChannelHandles, ChannelSender, ConnectRequest, Disconnector, Incoming,
    SecureChannel,
};

use super::{
    CloseOptions, CloseReason, ConnectionContext, ConnectionState, ResumeOutcome,
    ResumptionExchange, ResumptionInfo, StateCell, WireMessage,
};

/// A state transition of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    /// Generation that changed state.
    pub generation: u64,
    /// Previous state.
    pub from: ConnectionState,
    /// New state.
    pub to: ConnectionState,
}

/// Session-wide state shared by every generation.
pub(crate) struct SessionShared {
    pub(crate) session_id: SessionId,
    pub(crate) config: Arc<SessionConfig>,
    pub(crate) registry: ActiveSessions,
    pub(crate) key_store: Arc<dyn KeyStore>,
    pub(crate) state_events: broadcast::Sender<StateChange>,
    pub(crate) inbound: mpsc::UnboundedSender<Bytes>,
    pub(crate) ready: watch::Sender<Option<WeakConnection>>,
    /// Generation of the session's active connection.
    pub(crate) current: AtomicU64,
}

/// Channel handles owned by one generation.
struct ChannelParts {
    sender: ChannelSender,
    disconnector: Disconnector,
    cipher: Arc<dyn SessionCipher>,
}

struct Inner {
    shared: Arc<SessionShared>,
    generation: u64,
    state: StateCell,
    context: Mutex<Option<ConnectionContext>>,
    channel: Mutex<Option<ChannelParts>>,
    exchange: Mutex<ResumptionExchange>,
    owns_teardown: AtomicBool,
    peer_wait: CancellationToken,
}

/// Non-owning reference to a [`Connection`].
#[derive(Debug, Clone)]
pub(crate) struct WeakConnection {
    generation: u64,
    inner: Weak<Inner>,
}

impl WeakConnection {
    pub(crate) fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

/// One handshake generation with the peer.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a generation, optionally carrying the predecessor's context.
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        generation: u64,
        context: Option<ConnectionContext>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                shared,
                generation,
                state: StateCell::new(),
                context: Mutex::new(context),
                channel: Mutex::new(None),
                exchange: Mutex::new(ResumptionExchange::default()),
                owns_teardown: AtomicBool::new(false),
                peer_wait: CancellationToken::new(),
            }),
        }
    }

    /// Generation number, starting at 1 for a session's first connection.
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// Current state snapshot.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.load()
    }

    /// Whether this generation still has to release the channel handles.
    pub fn owns_teardown(&self) -> bool {
        self.inner.owns_teardown.load(Ordering::Acquire)
    }

    /// Clone of the current connection context.
    pub async fn context(&self) -> Option<ConnectionContext> {
        self.inner.context.lock().await.clone()
    }

    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            generation: self.inner.generation,
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn config(&self) -> &SessionConfig {
        &self.inner.shared.config
    }

    fn is_current(&self) -> bool {
        self.inner.shared.current.load(Ordering::Acquire) == self.inner.generation
    }

    /// Start the channel for this generation.
    ///
    /// Fails only if the channel cannot be initialised; handshake progress
    /// and failures afterwards surface as state changes.
    pub async fn connect(
        &self,
        channel: &dyn SecureChannel,
        request: ConnectRequest,
    ) -> Result<(), ChannelError> {
        let ChannelHandles {
            driver,
            events,
            incoming,
            sender,
            disconnector,
            cipher,
        } = channel.connect(request)?;

        *self.inner.channel.lock().await = Some(ChannelParts {
            sender,
            disconnector,
            cipher,
        });
        self.inner.owns_teardown.store(true, Ordering::Release);

        let connection = self.clone();
        tokio::spawn(async move {
            let result = driver.await;
            connection.on_driver_exit(result).await;
        });
        tokio::spawn(self.clone().dispatch_events(events, incoming));
        Ok(())
    }

    /// Send an application message. Refused unless the state is `Ready`.
    pub async fn send_message(&self, payload: Bytes, cacheable: bool) -> Result<(), SendError> {
        self.transmit(WireMessage::Application { payload }, cacheable, false)
            .await
    }

    /// Close this generation. Safe to call any number of times.
    pub async fn close(&self, options: CloseOptions) {
        let generation = self.inner.generation;
        let previous = match self.inner.state.advance(ConnectionState::Disconnecting) {
            Ok(previous) => previous,
            Err(current) => {
                debug!(generation, %current, reason = %options.reason, "connection already closing");
                self.unregister(&options);
                return;
            }
        };
        self.publish(previous, ConnectionState::Disconnecting);
        info!(generation, reason = %options.reason, notice = options.send_disconnect_notice, "closing connection");

        self.inner.peer_wait.cancel();
        if options.reason == CloseReason::Replace {
            // The successor's channel supersedes ours at the relay
            self.inner.owns_teardown.store(false, Ordering::Release);
        }
        self.unregister(&options);

        // The notice needs this generation's own context
        if options.send_disconnect_notice && previous >= ConnectionState::ResumeInfoSent {
            let notice = WireMessage::Disconnect {
                reason: options.reason,
            };
            match self.transmit(notice, false, true).await {
                Ok(()) => {
                    let connection = self.clone();
                    let grace = self.config().disconnect_grace;
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        connection.release_channel(options).await;
                    });
                    return;
                }
                Err(e) => warn!(generation, error = %e, "could not send disconnect notice"),
            }
        }
        self.release_channel(options).await;
    }

    fn unregister(&self, options: &CloseOptions) {
        let shared = &self.inner.shared;
        if options.reason.is_terminal() && self.is_current() {
            shared.registry.remove(&shared.session_id);
        }
        if options.forget {
            info!(session = %shared.session_id, "forgetting session");
            shared.key_store.forget(&shared.session_id);
        }
    }

    async fn release_channel(&self, options: CloseOptions) {
        let parts = self.inner.channel.lock().await.take();
        if let Some(parts) = parts {
            if self.inner.owns_teardown.swap(false, Ordering::AcqRel) {
                let code = options.reason.close_code();
                if parts.disconnector.disconnect(code) {
                    debug!(generation = self.inner.generation, code, "channel disconnect requested");
                } else {
                    debug!(generation = self.inner.generation, "channel already gone");
                }
            }
        }
        if options.close_underlying {
            self.inner.context.lock().await.take();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&self, to: ConnectionState) -> bool {
        match self.inner.state.advance(to) {
            Ok(from) => {
                self.publish(from, to);
                true
            }
            Err(current) => {
                debug!(generation = self.inner.generation, %current, target = %to, "state change skipped");
                false
            }
        }
    }

    fn publish(&self, from: ConnectionState, to: ConnectionState) {
        let generation = self.inner.generation;
        debug!(generation, %from, %to, "connection state changed");

        let shared = &self.inner.shared;
        let _ = shared.state_events.send(StateChange {
            generation,
            from,
            to,
        });
        if to == ConnectionState::Ready {
            shared.ready.send_replace(Some(self.downgrade()));
        } else if to.is_closing() {
            shared.ready.send_if_modified(|current| {
                if current.as_ref().is_some_and(|c| c.generation == generation) {
                    *current = None;
                    true
                } else {
                    false
                }
            });
        }
    }

    async fn sender(&self) -> Option<ChannelSender> {
        self.inner
            .channel
            .lock()
            .await
            .as_ref()
            .map(|parts| parts.sender.clone())
    }

    async fn cipher(&self) -> Option<Arc<dyn SessionCipher>> {
        self.inner
            .channel
            .lock()
            .await
            .as_ref()
            .map(|parts| Arc::clone(&parts.cipher))
    }

    /// Chunk, cache and hand a message to the channel.
    ///
    /// Privileged control messages bypass the `Ready` gate.
    async fn transmit(
        &self,
        message: WireMessage,
        cacheable: bool,
        privileged: bool,
    ) -> Result<(), SendError> {
        let data = message.encode()?;

        let mut guard = self.inner.context.lock().await;
        let state = self.state();
        if !privileged && state != ConnectionState::Ready {
            warn!(generation = self.inner.generation, %state, "refusing to send, connection not ready");
            return Err(SendError::NotReady(state));
        }
        let context = guard.as_mut().ok_or(SendError::NoContext)?;
        let sender = self.sender().await.ok_or(SendError::ChannelClosed)?;

        let chunks = context.chunk_message(data, self.config().max_chunk_size, cacheable)?;
        for chunk in &chunks {
            sender.send(length_prefixed(chunk)?)?;
        }
        Ok(())
    }

    async fn dispatch_events(
        self,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        incoming: mpsc::UnboundedReceiver<Incoming>,
    ) {
        let generation = self.inner.generation;
        let mut incoming = Some(incoming);

        while let Some(event) = events.recv().await {
            debug!(generation, ?event, "channel event");
            match event {
                ChannelEvent::Connecting => {
                    self.set_state(ConnectionState::Connecting);
                }
                ChannelEvent::ServerHandshakeComplete { peer_connected } => {
                    self.set_state(ConnectionState::ServerHandshakeComplete);
                    if !peer_connected {
                        self.start_peer_wait();
                    }
                }
                ChannelEvent::PeerHandshakeComplete => {
                    self.inner.peer_wait.cancel();
                    self.set_state(ConnectionState::PeerHandshakeComplete);
                    if self.begin_resumption().await {
                        if let Some(incoming) = incoming.take() {
                            tokio::spawn(self.clone().dispatch_incoming(incoming));
                        }
                    }
                }
                ChannelEvent::PeerDisconnected => {
                    self.close(CloseOptions::new(CloseReason::Stop)).await;
                    break;
                }
            }
        }
        debug!(generation, "event dispatch finished");
    }

    fn start_peer_wait(&self) {
        let connection = self.clone();
        let token = self.inner.peer_wait.clone();
        let timeout = self.config().peer_wait_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    info!(generation = connection.generation(), ?timeout, "peer did not connect in time");
                    connection
                        .close(CloseOptions::new(CloseReason::Stop).with_notice())
                        .await;
                }
            }
        });
    }

    /// Install this generation's context and send the local resumption info.
    async fn begin_resumption(&self) -> bool {
        if self.state().is_closing() {
            return false;
        }
        let Some(cipher) = self.cipher().await else {
            return false;
        };
        let connection_id = match cipher.encrypt_with_session_keys(&[], CONNECTION_ID_NONCE) {
            Ok(id) => Bytes::from(id),
            Err(e) => {
                warn!(generation = self.inner.generation, error = %e, "cannot derive connection id");
                self.close(CloseOptions::new(CloseReason::Error).with_notice())
                    .await;
                return false;
            }
        };

        let info = {
            let mut guard = self.inner.context.lock().await;
            let mut context = ConnectionContext::new(connection_id);
            if let Some(previous) = guard.take() {
                context.inherit(previous, self.config().unchunker_max_age);
            }
            let info = context.resumption_info();
            *guard = Some(context);
            info
        };

        debug!(generation = self.inner.generation, resume = info.wants_resume(), "sending resumption info");
        self.set_state(ConnectionState::ResumeInfoSent);
        if let Err(e) = self
            .transmit(WireMessage::ConnectionInfo(info), false, true)
            .await
        {
            warn!(generation = self.inner.generation, error = %e, "failed to send resumption info");
            self.close(CloseOptions::new(CloseReason::Error)).await;
            return false;
        }

        let remote = self.inner.exchange.lock().await.local_sent();
        if let Some(remote) = remote {
            if let Err(e) = self.complete_resumption(remote).await {
                warn!(generation = self.inner.generation, error = %e, "resumption failed");
                self.close(CloseOptions::new(CloseReason::Error).with_notice())
                    .await;
                return false;
            }
        }
        true
    }

    /// Answer the peer's resumption info and become `Ready`.
    async fn complete_resumption(&self, remote: ResumptionInfo) -> Result<(), ReceiveError> {
        let generation = self.inner.generation;
        let mut guard = self.inner.context.lock().await;
        let context = guard.as_mut().ok_or(ReceiveError::NoContext)?;

        match context.resume(&remote)? {
            ResumeOutcome::Fresh => debug!(generation, "nothing to resume"),
            ResumeOutcome::Discarded => {
                info!(generation, "peer did not resume, previous connection discarded");
            }
            ResumeOutcome::Resumed { resend } => {
                info!(generation, chunks = resend.len(), "resuming previous connection");
                let sender = self.sender().await.ok_or(SendError::ChannelClosed)?;
                for chunk in &resend {
                    sender.send(length_prefixed(chunk)?)?;
                }
            }
        }
        self.set_state(ConnectionState::Ready);
        Ok(())
    }

    async fn dispatch_incoming(self, mut incoming: mpsc::UnboundedReceiver<Incoming>) {
        let generation = self.inner.generation;
        while let Some(item) = incoming.recv().await {
            match item {
                Incoming::Data(frame) => {
                    if let Err(e) = self.on_chunk(frame).await {
                        warn!(generation, error = %e, "dropping connection after bad inbound data");
                        self.close(CloseOptions::new(CloseReason::Error).with_notice())
                            .await;
                        break;
                    }
                }
                Incoming::Closed { code } => debug!(generation, code, "channel closed by relay"),
                Incoming::Failed(e) => {
                    warn!(generation, error = %e, "receive failed");
                    self.close(CloseOptions::new(CloseReason::Error)).await;
                    break;
                }
            }
        }
        debug!(generation, "message dispatch finished");
    }

    async fn on_chunk(&self, frame: Bytes) -> Result<(), ReceiveError> {
        let chunk = strip_length_prefix(frame)?;
        let message = {
            let mut guard = self.inner.context.lock().await;
            let context = guard.as_mut().ok_or(ReceiveError::NoContext)?;
            context.add_incoming(chunk)?
        };
        let Some(message) = message else {
            return Ok(());
        };

        match WireMessage::decode(&message)? {
            WireMessage::ConnectionInfo(info) => {
                debug!(generation = self.inner.generation, resume = info.wants_resume(), "received resumption info");
                self.set_state(ConnectionState::ResumeInfoReceived);
                let remote = self.inner.exchange.lock().await.remote_received(info);
                if let Some(remote) = remote {
                    self.complete_resumption(remote).await?;
                }
            }
            WireMessage::Disconnect { reason } => {
                info!(generation = self.inner.generation, %reason, "peer sent disconnect notice");
                let options = if reason == CloseReason::Delete {
                    CloseOptions::new(CloseReason::Delete).forget()
                } else {
                    CloseOptions::new(CloseReason::Stop)
                };
                self.close(options).await;
            }
            WireMessage::Application { payload } => {
                if self.inner.shared.inbound.send(payload).is_err() {
                    debug!(generation = self.inner.generation, "inbound receiver dropped");
                }
            }
        }
        Ok(())
    }

    async fn on_driver_exit(&self, result: Result<(), ChannelError>) {
        let generation = self.inner.generation;
        match result {
            Ok(()) => debug!(generation, "channel driver finished"),
            Err(e) => {
                warn!(generation, error = %e, "channel driver failed");
                self.close(CloseOptions::new(CloseReason::Error)).await;
            }
        }
        if !self.state().is_closing() {
            self.close(CloseOptions::new(CloseReason::Stop)).await;
        }
        self.inner.peer_wait.cancel();
        self.inner.channel.lock().await.take();
        self.set_state(ConnectionState::Disconnected);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("generation", &self.inner.generation)
            .field("state", &self.state())
            .field("owns_teardown", &self.owns_teardown())
            .finish_non_exhaustive()
    }
}
