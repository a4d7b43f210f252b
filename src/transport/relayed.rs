//! Secure channel relayed through an untrusted server.
//!
//! One link to the relay carries two Noise_IK handshakes: first with the
//! relay itself, then with the peer, tunnelled in [`RelayFrame::Relay`]
//! frames. The relay only ever sees sealed peer data.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{Instant, interval_at};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, trace, warn};

use crate::core::{ChannelError, LINK_KEYS_LABEL, MAX_LINK_FRAME_SIZE, PEER_KEYS_LABEL, WireError};
use crate::crypto::{FrameCipher, InitiatorHandshake, PublicKey, Role, SessionKeySlot, SessionKeys};

use super::{
    ChannelEvent, ChannelHandles, ClientHello, ConnectRequest, DriverEndpoint, Incoming, RelayFrame,
    SecureChannel, ServerHello, channel_pair,
};

type Link<S> = Framed<S, LengthDelimitedCodec>;

/// Opens the byte stream to the relay.
pub trait Connector: Send + Sync + 'static {
    /// Stream type.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new stream.
    fn connect(&self) -> BoxFuture<'static, io::Result<Self::Stream>>;
}

/// Relay endpoint configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Relay address (`host:port`).
    pub address: String,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
}

impl RelayConfig {
    /// Create a config for `address` with a 10 second connect timeout.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// [`Connector`] over plain TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    config: RelayConfig,
}

impl TcpConnector {
    /// Create a connector.
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self) -> BoxFuture<'static, io::Result<TcpStream>> {
        let address = self.config.address.clone();
        let timeout = self.config.connect_timeout;
        Box::pin(async move {
            let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "relay connect timed out"))??;
            stream.set_nodelay(true)?;
            Ok(stream)
        })
    }
}

/// [`SecureChannel`] relayed through a server reachable via `C`.
#[derive(Debug)]
pub struct RelayedChannel<C> {
    connector: Arc<C>,
}

impl<C: Connector> RelayedChannel<C> {
    /// Create a channel factory.
    pub fn new(connector: C) -> Self {
        Self {
            connector: Arc::new(connector),
        }
    }
}

impl<C: Connector> SecureChannel for RelayedChannel<C> {
    fn connect(&self, request: ConnectRequest) -> Result<ChannelHandles, ChannelError> {
        let server = InitiatorHandshake::new(&request.keypair, &request.server_public_key)
            .map_err(|e| ChannelError::Init(e.to_string()))?;
        let peer = InitiatorHandshake::new(&request.keypair, &request.peer_public_key)
            .map_err(|e| ChannelError::Init(e.to_string()))?;

        let keys = Arc::new(SessionKeySlot::new());
        let (handles, endpoint) = channel_pair(keys.clone());
        let task = LinkTask {
            peer_public_key: request.peer_public_key,
            auth_token: request.auth_token,
            ping_interval: request.ping_interval.max(Duration::from_millis(1)),
            keys,
            endpoint,
        };
        let connector = Arc::clone(&self.connector);

        Ok(handles.with_driver(async move {
            task.emit(ChannelEvent::Connecting);
            let stream = match connector.connect().await {
                Ok(stream) => stream,
                Err(e) => {
                    task.emit(ChannelEvent::PeerDisconnected);
                    return Err(e.into());
                }
            };
            task.run(stream, server, peer).await
        }))
    }
}

/// State of the peer handshake.
enum PeerLeg {
    Pending(InitiatorHandshake),
    Sent(InitiatorHandshake),
    Established(FrameCipher),
    Gone,
}

struct LinkTask {
    peer_public_key: PublicKey,
    auth_token: Option<Bytes>,
    ping_interval: Duration,
    keys: Arc<SessionKeySlot>,
    endpoint: DriverEndpoint,
}

impl LinkTask {
    fn emit(&self, event: ChannelEvent) {
        let _ = self.endpoint.events.send(event);
    }

    fn deliver(&self, message: Incoming) {
        let _ = self.endpoint.incoming.send(message);
    }

    async fn run<S>(
        mut self,
        stream: S,
        server: InitiatorHandshake,
        peer: InitiatorHandshake,
    ) -> Result<(), ChannelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_LINK_FRAME_SIZE)
            .new_codec();
        let mut link = Framed::new(stream, codec);

        let result = self.session(&mut link, server, peer).await;
        // The event stream always ends with the terminal event
        self.emit(ChannelEvent::PeerDisconnected);
        if let Err(e) = &result {
            debug!(error = %e, "relay link ended with error");
        }
        result
    }

    async fn session<S>(
        &mut self,
        link: &mut Link<S>,
        server: InitiatorHandshake,
        peer: InitiatorHandshake,
    ) -> Result<(), ChannelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut link_cipher, peer_connected) = self.server_handshake(link, server).await?;
        self.emit(ChannelEvent::ServerHandshakeComplete { peer_connected });

        let mut leg = PeerLeg::Pending(peer);
        if peer_connected {
            self.start_peer_handshake(&mut leg, link, &mut link_cipher).await?;
        }

        let mut ping = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        loop {
            tokio::select! {
                biased;

                // Ahead of the outgoing branch: releasing the handles drops
                // the senders right after the disconnect request
                code = &mut self.endpoint.disconnect => {
                    let Ok(code) = code else {
                        // Superseded by another generation, the relay replaces the link
                        debug!("disconnect handle dropped, leaving the link silently");
                        return Ok(());
                    };
                    debug!(code, "disconnect requested");
                    return close_link(link, &mut link_cipher, code).await;
                }
                frame = link.next() => {
                    let Some(frame) = frame.transpose()? else {
                        debug!("relay closed the link");
                        return Ok(());
                    };
                    match RelayFrame::open(&mut link_cipher, &frame)? {
                        RelayFrame::PeerJoined => {
                            debug!("peer joined");
                            self.start_peer_handshake(&mut leg, link, &mut link_cipher).await?;
                        }
                        RelayFrame::PeerLeft => {
                            debug!("peer left");
                            return Ok(());
                        }
                        RelayFrame::Relay { data } => self.on_peer_data(&mut leg, data)?,
                        RelayFrame::Ping => trace!("relay ping"),
                        RelayFrame::Close { code } => {
                            debug!(code, "relay closed the path");
                            self.deliver(Incoming::Closed { code });
                            return Ok(());
                        }
                    }
                }
                chunk = self.endpoint.outgoing.recv() => {
                    let Some(chunk) = chunk else {
                        debug!("channel handles released, leaving the link silently");
                        return Ok(());
                    };
                    let PeerLeg::Established(cipher) = &mut leg else {
                        warn!(len = chunk.len(), "dropping chunk, peer handshake incomplete");
                        continue;
                    };
                    let data = Bytes::from(cipher.seal(&chunk)?);
                    link.send(RelayFrame::Relay { data }.seal(&mut link_cipher)?).await?;
                }
                _ = ping.tick() => {
                    link.send(RelayFrame::Ping.seal(&mut link_cipher)?).await?;
                }
            }
        }
    }

    async fn server_handshake<S>(
        &self,
        link: &mut Link<S>,
        mut handshake: InitiatorHandshake,
    ) -> Result<(FrameCipher, bool), ChannelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let hello = ClientHello {
            path: Bytes::copy_from_slice(self.peer_public_key.as_bytes()),
        };
        let payload = rmp_serde::to_vec(&hello).map_err(WireError::from)?;
        link.send(Bytes::from(handshake.write_message(&payload)?)).await?;

        let reply = link
            .next()
            .await
            .transpose()?
            .ok_or_else(|| ChannelError::Protocol("relay closed during handshake".into()))?;
        let (payload, result) = handshake.read_message(&reply)?;
        let hello: ServerHello = rmp_serde::from_slice(&payload).map_err(WireError::from)?;

        let keys = SessionKeys::derive(&result, LINK_KEYS_LABEL)?;
        debug!(peer_connected = hello.peer_connected, "server handshake complete");
        Ok((FrameCipher::new(&keys, Role::Initiator), hello.peer_connected))
    }

    async fn start_peer_handshake<S>(
        &self,
        leg: &mut PeerLeg,
        link: &mut Link<S>,
        link_cipher: &mut FrameCipher,
    ) -> Result<(), ChannelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut handshake = match std::mem::replace(leg, PeerLeg::Gone) {
            PeerLeg::Pending(handshake) => handshake,
            other => {
                *leg = other;
                return Ok(());
            }
        };

        let token = self.auth_token.as_deref().unwrap_or_default();
        let message = handshake.write_message(token)?;
        *leg = PeerLeg::Sent(handshake);

        let frame = RelayFrame::Relay {
            data: Bytes::from(message),
        };
        link.send(frame.seal(link_cipher)?).await?;
        Ok(())
    }

    fn on_peer_data(&self, leg: &mut PeerLeg, data: Bytes) -> Result<(), ChannelError> {
        if let PeerLeg::Established(cipher) = leg {
            return match cipher.open(&data) {
                Ok(chunk) => {
                    self.deliver(Incoming::Data(Bytes::from(chunk)));
                    Ok(())
                }
                Err(e) => {
                    warn!(error = %e, "peer data failed authentication");
                    self.deliver(Incoming::Failed(ChannelError::Crypto(e)));
                    Err(ChannelError::Protocol("peer data failed authentication".into()))
                }
            };
        }

        let PeerLeg::Sent(handshake) = std::mem::replace(leg, PeerLeg::Gone) else {
            return Err(ChannelError::Protocol(
                "peer data before peer handshake".into(),
            ));
        };
        let (_, result) = handshake.read_message(&data)?;
        let keys = SessionKeys::derive(&result, PEER_KEYS_LABEL)?;
        *leg = PeerLeg::Established(FrameCipher::new(&keys, Role::Initiator));
        self.keys.install(keys);

        debug!("peer handshake complete");
        self.emit(ChannelEvent::PeerHandshakeComplete);
        Ok(())
    }
}

async fn close_link<S>(
    link: &mut Link<S>,
    link_cipher: &mut FrameCipher,
    code: u16,
) -> Result<(), ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    link.send(RelayFrame::Close { code }.seal(link_cipher)?).await?;
    SinkExt::<Bytes>::close(link).await?;
    Ok(())
}
