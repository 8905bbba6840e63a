//! In-process relay
//!
//! A broadcast hub standing in for the external relay service. Every
//! participant gets its own [`MemoryRelay`] handle; frames published on a
//! channel reach every current subscriber of that channel, the publisher
//! included, in publish order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use mesh_common::{ChannelName, ParticipantId, RelayEvent, RelayFrame};
use tokio::sync::mpsc;
use tracing::debug;

use super::{RelayError, RelayTransport};

/// Subscription change observed by the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOp {
    Subscribe {
        participant: ParticipantId,
        channel: ChannelName,
    },
    Unsubscribe {
        participant: ParticipantId,
        channel: ChannelName,
    },
}

#[derive(Default)]
struct HubState {
    subscribers: HashMap<ChannelName, Vec<(ParticipantId, mpsc::UnboundedSender<RelayFrame>)>>,
    published: Vec<RelayFrame>,
    ops: Vec<RelayOp>,
}

/// Shared broadcast hub.
#[derive(Clone, Default)]
pub struct MemoryRelayHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryRelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transport handle for one participant.
    pub fn client(&self, participant: impl Into<ParticipantId>) -> MemoryRelay {
        MemoryRelay {
            hub: self.clone(),
            participant: participant.into(),
        }
    }

    /// Publish as the authority (no sender). Returns the number of receivers.
    pub fn broadcast(&self, channel: &ChannelName, event: RelayEvent) -> usize {
        self.deliver(RelayFrame {
            channel: channel.clone(),
            sender: None,
            message: event,
        })
    }

    fn deliver(&self, frame: RelayFrame) -> usize {
        let mut state = self.lock();
        state.published.push(frame.clone());

        let Some(subscribers) = state.subscribers.get_mut(&frame.channel) else {
            return 0;
        };
        subscribers.retain(|(_, tx)| tx.send(frame.clone()).is_ok());
        subscribers.len()
    }

    /// Every frame published so far.
    pub fn published(&self) -> Vec<RelayFrame> {
        self.lock().published.clone()
    }

    /// Published frames carrying the named event.
    pub fn published_events(&self, name: &str) -> Vec<RelayFrame> {
        self.lock()
            .published
            .iter()
            .filter(|f| f.message.name() == name)
            .cloned()
            .collect()
    }

    /// Subscribe/unsubscribe history across all participants.
    pub fn ops(&self) -> Vec<RelayOp> {
        self.lock().ops.clone()
    }

    pub fn subscriber_count(&self, channel: &ChannelName) -> usize {
        self.lock()
            .subscribers
            .get(channel)
            .map_or(0, |subs| subs.iter().filter(|(_, tx)| !tx.is_closed()).count())
    }
}

/// One participant's connection to a [`MemoryRelayHub`].
#[derive(Clone)]
pub struct MemoryRelay {
    hub: MemoryRelayHub,
    participant: ParticipantId,
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    async fn subscribe(
        &self,
        channel: &ChannelName,
    ) -> Result<mpsc::UnboundedReceiver<RelayFrame>, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.hub.lock();

        let subscribers = state.subscribers.entry(channel.clone()).or_default();
        subscribers.retain(|(p, _)| *p != self.participant);
        subscribers.push((self.participant.clone(), tx));

        state.ops.push(RelayOp::Subscribe {
            participant: self.participant.clone(),
            channel: channel.clone(),
        });
        debug!(participant = %self.participant, channel = %channel, "Memory relay subscribe");
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &ChannelName) -> Result<(), RelayError> {
        let mut state = self.hub.lock();

        if let Some(subscribers) = state.subscribers.get_mut(channel) {
            subscribers.retain(|(p, _)| *p != self.participant);
        }
        state.ops.push(RelayOp::Unsubscribe {
            participant: self.participant.clone(),
            channel: channel.clone(),
        });
        Ok(())
    }

    async fn publish(&self, frame: RelayFrame) -> Result<(), RelayError> {
        self.hub.deliver(frame);
        Ok(())
    }
}
