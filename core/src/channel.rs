/// Real-time channel contract
///
/// One live connection per signed-in user. The channel only moves events:
/// storing, de-duplicating and counting are the session's job.
use crate::auth::Credential;
use crate::error::Result;
use crate::types::{Message, OutgoingMessage};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Events surfaced to the channel's owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    MessageReceived(Message),
    /// Transport-level error reported by the server or the socket
    Error(String),
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn is_connected(&self) -> bool;

    /// New receiver for channel events
    fn events(&self) -> broadcast::Receiver<ChannelEvent>;

    /// Fire-and-forget send. The persisted copy comes back as `MessageReceived`.
    async fn send(&self, message: OutgoingMessage) -> Result<()>;

    async fn close(&self);
}

/// Opens channels. A fresh connection every call.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str, credential: &Credential) -> Result<Arc<dyn Channel>>;
}

/// Active event subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.stop();
    }

    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Deliver every event of `channel` to `handler`, one at a time, in order
pub fn subscribe<F, Fut>(channel: &dyn Channel, handler: F) -> Subscription
where
    F: FnMut(ChannelEvent) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    subscribe_receiver(channel.events(), handler)
}

pub(crate) fn subscribe_receiver<F, Fut>(
    mut rx: broadcast::Receiver<ChannelEvent>,
    mut handler: F,
) -> Subscription
where
    F: FnMut(ChannelEvent) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => handler(event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Subscriber is too slow; skip lagged events and continue
                    warn!("Channel subscriber lagged {} events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Channel event stream closed");
                    break;
                }
            }
        }
    });
    Subscription {
        handle: Some(handle),
    }
}
