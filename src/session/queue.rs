//! Ordered outbound message queue.
//!
//! A single drain task pops messages in submission order and only pops the
//! next one after the current one was accepted (or refused) by a `Ready`
//! connection. While no connection is ready the queue simply waits, so a
//! message is never dropped for arriving early.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::connection::WeakConnection;
use crate::core::SendError;

struct QueuedMessage {
    payload: Bytes,
    cacheable: bool,
    completion: oneshot::Sender<Result<(), SendError>>,
}

/// Resolves once a queued message was handed to the channel.
///
/// Acceptance by the channel is not delivery to the peer.
#[derive(Debug)]
#[must_use = "a completion does nothing unless awaited"]
pub struct Completion {
    rx: oneshot::Receiver<Result<(), SendError>>,
}

impl Future for Completion {
    type Output = Result<(), SendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(SendError::SessionClosed)))
    }
}

/// Outbound queue feeding whichever connection is `Ready`.
#[derive(Debug)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<QueuedMessage>,
    task: JoinHandle<()>,
}

impl OutboundQueue {
    /// Start the drain task. Must be called within a Tokio runtime.
    pub(crate) fn spawn(ready: watch::Receiver<Option<WeakConnection>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(drain(rx, ready));
        Self { tx, task }
    }

    /// Append a message. Never blocks.
    pub fn enqueue(&self, payload: Bytes, cacheable: bool) -> Completion {
        let (completion, rx) = oneshot::channel();
        let message = QueuedMessage {
            payload,
            cacheable,
            completion,
        };
        if let Err(mpsc::error::SendError(message)) = self.tx.send(message) {
            let _ = message.completion.send(Err(SendError::SessionClosed));
        }
        Completion { rx }
    }
}

impl Drop for OutboundQueue {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn drain(
    mut rx: mpsc::UnboundedReceiver<QueuedMessage>,
    mut ready: watch::Receiver<Option<WeakConnection>>,
) {
    while let Some(message) = rx.recv().await {
        let result = loop {
            let current = match ready.wait_for(Option::is_some).await {
                Ok(current) => current.clone(),
                Err(_) => break Err(SendError::SessionClosed),
            };
            match current.and_then(|weak| weak.upgrade()) {
                Some(connection) => {
                    break connection
                        .send_message(message.payload.clone(), message.cacheable)
                        .await;
                }
                None => {
                    if ready.changed().await.is_err() {
                        break Err(SendError::SessionClosed);
                    }
                }
            }
        };

        match &result {
            Ok(()) => trace!(len = message.payload.len(), "queued message sent"),
            Err(e) => debug!(error = %e, "queued message not sent"),
        }
        let _ = message.completion.send(result);
    }
}
