//! Signal Relay Client
//!
//! Thin adapter over an external pub/sub relay. Each subscribed channel gets
//! its own pump task that delivers frames, in order, to the handlers bound on
//! that channel only. Performs no WebRTC logic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::future::BoxFuture;
use mesh_common::{ChannelName, ParticipantId, RelayEvent, RelayFrame};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

mod memory;
mod websocket;

pub use memory::{MemoryRelay, MemoryRelayHub, RelayOp};
pub use websocket::{ConnectionStatus, WebSocketRelay};

/// Relay errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Relay not connected")]
    NotConnected,
    #[error("Relay connection closed")]
    Closed,
    #[error("Not subscribed to channel {0}")]
    NotSubscribed(ChannelName),
    #[error("Relay transport error: {0}")]
    Transport(String),
    #[error("Relay codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Pub/sub transport underneath the relay client.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Start receiving frames published on `channel`, in publish order.
    async fn subscribe(
        &self,
        channel: &ChannelName,
    ) -> Result<mpsc::UnboundedReceiver<RelayFrame>, RelayError>;

    /// Stop receiving frames on `channel`; the receiver ends.
    async fn unsubscribe(&self, channel: &ChannelName) -> Result<(), RelayError>;

    async fn publish(&self, frame: RelayFrame) -> Result<(), RelayError>;
}

/// Event handler bound on a channel.
pub type Handler = Arc<dyn Fn(RelayFrame) -> BoxFuture<'static, ()> + Send + Sync>;

/// Identifies one binding so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(u64);

type Bindings = HashMap<String, Vec<(BindingId, Handler)>>;

struct Subscription {
    bindings: Arc<Mutex<Bindings>>,
    pump: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Channel subscriptions and their event bindings.
pub struct SignalRelayClient {
    transport: Arc<dyn RelayTransport>,
    subscriptions: HashMap<ChannelName, Subscription>,
    next_binding: u64,
}

impl SignalRelayClient {
    pub fn new(transport: Arc<dyn RelayTransport>) -> Self {
        Self {
            transport,
            subscriptions: HashMap::new(),
            next_binding: 0,
        }
    }

    /// Subscribe to `channel`. Subscribing twice is a no-op.
    pub async fn subscribe(&mut self, channel: &ChannelName) -> Result<(), RelayError> {
        if self.subscriptions.contains_key(channel) {
            return Ok(());
        }

        let frames = self.transport.subscribe(channel).await?;
        let bindings = Arc::new(Mutex::new(Bindings::new()));
        let pump = tokio::spawn(pump(channel.clone(), frames, bindings.clone()));

        self.subscriptions
            .insert(channel.clone(), Subscription { bindings, pump });
        info!(channel = %channel, "Subscribed to relay channel");
        Ok(())
    }

    /// Drop the subscription and every binding on it.
    pub async fn unsubscribe(&mut self, channel: &ChannelName) -> Result<(), RelayError> {
        if self.subscriptions.remove(channel).is_none() {
            return Ok(());
        }

        self.transport.unsubscribe(channel).await?;
        info!(channel = %channel, "Unsubscribed from relay channel");
        Ok(())
    }

    /// Bind `handler` to `event` on `channel`.
    pub fn bind(
        &mut self,
        channel: &ChannelName,
        event: &str,
        handler: Handler,
    ) -> Result<BindingId, RelayError> {
        let subscription = self
            .subscriptions
            .get(channel)
            .ok_or_else(|| RelayError::NotSubscribed(channel.clone()))?;

        self.next_binding += 1;
        let id = BindingId(self.next_binding);
        subscription
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.to_string())
            .or_default()
            .push((id, handler));

        debug!(channel = %channel, event, "Bound relay event");
        Ok(id)
    }

    /// Remove one binding. Returns whether it existed.
    pub fn unbind(&mut self, channel: &ChannelName, event: &str, id: BindingId) -> bool {
        let Some(subscription) = self.subscriptions.get(channel) else {
            return false;
        };

        let mut bindings = subscription
            .bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(handlers) = bindings.get_mut(event) else {
            return false;
        };

        let before = handlers.len();
        handlers.retain(|(bound, _)| *bound != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            bindings.remove(event);
        }
        removed
    }

    /// Publish `event` on `channel` as `sender`.
    ///
    /// The frame and any `fromUserId` field are stamped with `sender` so
    /// receivers can filter by origin.
    pub async fn publish(
        &self,
        channel: &ChannelName,
        sender: &ParticipantId,
        mut event: RelayEvent,
    ) -> Result<(), RelayError> {
        event.stamp_sender(sender);
        debug!(channel = %channel, event = event.name(), "Publishing relay event");

        self.transport
            .publish(RelayFrame {
                channel: channel.clone(),
                sender: Some(sender.clone()),
                message: event,
            })
            .await
    }

    pub fn is_subscribed(&self, channel: &ChannelName) -> bool {
        self.subscriptions.contains_key(channel)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Number of handlers bound on `channel`.
    pub fn binding_count(&self, channel: &ChannelName) -> usize {
        self.subscriptions.get(channel).map_or(0, |s| {
            s.bindings
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .map(Vec::len)
                .sum()
        })
    }
}

/// Deliver one channel's frames to the handlers bound on it.
async fn pump(
    channel: ChannelName,
    mut frames: mpsc::UnboundedReceiver<RelayFrame>,
    bindings: Arc<Mutex<Bindings>>,
) {
    while let Some(frame) = frames.recv().await {
        if frame.channel != channel {
            warn!(channel = %channel, other = %frame.channel, "Dropping frame for another channel");
            continue;
        }

        let handlers: Vec<Handler> = bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(frame.message.name())
            .map(|bound| bound.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!(channel = %channel, event = frame.message.name(), "No binding for relay event");
            continue;
        }

        for handler in handlers {
            handler(frame.clone()).await;
        }
    }

    debug!(channel = %channel, "Relay subscription ended");
}
