//! Handles returned by [`SecureChannel::connect`](super::SecureChannel::connect).
//!
//! The channel itself runs inside a driver future. Everything else talks
//! to it by message passing through these handles, never through shared
//! state.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{self, BoxFuture};
use tokio::sync::{mpsc, oneshot};

use crate::core::{ChannelError, SendError};
use crate::crypto::SessionCipher;

use super::{ChannelEvent, Incoming};

/// Future that runs the channel until it is fully torn down.
pub type ChannelDriver = BoxFuture<'static, Result<(), ChannelError>>;

/// Everything a connection needs from one secure-channel generation.
pub struct ChannelHandles {
    /// Runs the handshake and the task loop; resolves on teardown.
    pub driver: ChannelDriver,
    /// Lifecycle events.
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
    /// Decrypted inbound chunks.
    pub incoming: mpsc::UnboundedReceiver<Incoming>,
    /// Send primitive.
    pub sender: ChannelSender,
    /// Disconnect primitive.
    pub disconnector: Disconnector,
    /// Access to the peer session key.
    pub cipher: Arc<dyn SessionCipher>,
}

impl ChannelHandles {
    /// Replace the driver future.
    pub fn with_driver<F>(mut self, driver: F) -> Self
    where
        F: Future<Output = Result<(), ChannelError>> + Send + 'static,
    {
        self.driver = Box::pin(driver);
        self
    }
}

impl fmt::Debug for ChannelHandles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandles").finish_non_exhaustive()
    }
}

/// Send primitive of a channel.
///
/// Accepting a buffer means the channel took ownership of it; it does not
/// mean the peer received it.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ChannelSender {
    /// Hand a length-prefixed chunk to the channel.
    pub fn send(&self, chunk: Bytes) -> Result<(), SendError> {
        self.tx.send(chunk).map_err(|_| SendError::ChannelClosed)
    }

    /// Whether the channel still accepts buffers.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Disconnect primitive of a channel. Usable once.
#[derive(Debug)]
pub struct Disconnector {
    tx: oneshot::Sender<u16>,
}

impl Disconnector {
    /// Ask the channel to close the relay link with `code`.
    ///
    /// Returns false if the channel was already gone.
    pub fn disconnect(self, code: u16) -> bool {
        self.tx.send(code).is_ok()
    }
}

/// The driver side of [`ChannelHandles`].
///
/// Channel implementations (and test doubles) feed events and inbound
/// chunks through it and observe every send and disconnect call.
#[derive(Debug)]
pub struct DriverEndpoint {
    /// Lifecycle event sink.
    pub events: mpsc::UnboundedSender<ChannelEvent>,
    /// Inbound message sink.
    pub incoming: mpsc::UnboundedSender<Incoming>,
    /// Buffers handed to the send primitive.
    pub outgoing: mpsc::UnboundedReceiver<Bytes>,
    /// Resolves when the disconnect primitive is invoked.
    pub disconnect: oneshot::Receiver<u16>,
}

/// Create connected handle and driver halves.
///
/// The returned handles carry a driver that completes immediately; real
/// channels install theirs with [`ChannelHandles::with_driver`].
pub fn channel_pair(cipher: Arc<dyn SessionCipher>) -> (ChannelHandles, DriverEndpoint) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let (disconnect_tx, disconnect_rx) = oneshot::channel();

    let handles = ChannelHandles {
        driver: Box::pin(future::ready(Ok(()))),
        events: event_rx,
        incoming: incoming_rx,
        sender: ChannelSender { tx: outgoing_tx },
        disconnector: Disconnector { tx: disconnect_tx },
        cipher,
    };
    let endpoint = DriverEndpoint {
        events: event_tx,
        incoming: incoming_tx,
        outgoing: outgoing_rx,
        disconnect: disconnect_rx,
    };
    (handles, endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SessionKeySlot;

    #[tokio::test]
    async fn test_channel_pair_wiring() {
        let (mut handles, mut endpoint) = channel_pair(Arc::new(SessionKeySlot::new()));

        endpoint.events.send(ChannelEvent::Connecting).unwrap();
        assert_eq!(handles.events.recv().await, Some(ChannelEvent::Connecting));

        handles.sender.send(Bytes::from_static(b"chunk")).unwrap();
        assert_eq!(endpoint.outgoing.recv().await, Some(Bytes::from_static(b"chunk")));

        assert!(handles.disconnector.disconnect(1000));
        assert_eq!(endpoint.disconnect.await, Ok(1000));

        assert!(handles.driver.await.is_ok());
    }

    #[tokio::test]
    async fn test_sender_fails_after_driver_gone() {
        let (handles, endpoint) = channel_pair(Arc::new(SessionKeySlot::new()));
        drop(endpoint);

        assert!(handles.sender.is_closed());
        assert!(matches!(
            handles.sender.send(Bytes::new()),
            Err(SendError::ChannelClosed)
        ));
        assert!(!handles.disconnector.disconnect(1000));
    }
}
