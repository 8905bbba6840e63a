//! ICE Candidate Buffer
//!
//! Candidates can arrive over the relay before the offer or answer they belong
//! to has been applied. They are queued per participant, even before a
//! connection exists, and applied in arrival order once the connection has a
//! remote description.
//!
//! Queues are bounded: at most `capacity` candidates per participant (oldest
//! dropped first), and a queue that is not drained within `ttl` is discarded.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use mesh_common::{IceCandidate, ParticipantId};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::peer::PeerConnection;

struct PendingQueue {
    candidates: VecDeque<IceCandidate>,
    /// When the oldest still-queued candidate arrived.
    since: Instant,
}

/// Per-participant queues of not-yet-applicable candidates.
pub struct IceCandidateBuffer {
    queues: HashMap<ParticipantId, PendingQueue>,
    capacity: usize,
    ttl: Duration,
}

impl IceCandidateBuffer {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            queues: HashMap::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Queue a candidate behind any already buffered for `participant`.
    pub fn add(&mut self, participant: &ParticipantId, candidate: IceCandidate) {
        self.expire();

        let now = Instant::now();
        let queue = self
            .queues
            .entry(participant.clone())
            .or_insert_with(|| PendingQueue {
                candidates: VecDeque::new(),
                since: now,
            });

        if queue.candidates.len() >= self.capacity {
            queue.candidates.pop_front();
            warn!(
                participant = %participant,
                capacity = self.capacity,
                "ICE candidate buffer full, dropping oldest candidate"
            );
        }
        queue.candidates.push_back(candidate);
    }

    /// Apply every buffered candidate if `connection` has a remote description.
    ///
    /// Returns the number of candidates applied. A candidate the connection
    /// rejects is logged and skipped; the rest are still applied.
    pub async fn drain_if_ready(
        &mut self,
        participant: &ParticipantId,
        connection: &dyn PeerConnection,
    ) -> usize {
        if !self.queues.contains_key(participant) || !connection.has_remote_description().await {
            return 0;
        }

        let Some(queue) = self.queues.remove(participant) else {
            return 0;
        };

        let mut applied = 0;
        for candidate in queue.candidates {
            match connection.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!(participant = %participant, error = %e, "Failed to apply buffered ICE candidate");
                }
            }
        }

        debug!(participant = %participant, applied, "Drained buffered ICE candidates");
        applied
    }

    /// Drop everything queued for `participant`.
    pub fn discard(&mut self, participant: &ParticipantId) -> usize {
        self.queues
            .remove(participant)
            .map_or(0, |q| q.candidates.len())
    }

    /// Drop queues older than the configured TTL.
    pub fn expire(&mut self) -> usize {
        let ttl = self.ttl;
        let before = self.queues.len();
        self.queues.retain(|participant, queue| {
            let keep = queue.since.elapsed() < ttl;
            if !keep {
                debug!(
                    participant = %participant,
                    dropped = queue.candidates.len(),
                    "Expired buffered ICE candidates"
                );
            }
            keep
        });
        before - self.queues.len()
    }

    /// Number of candidates waiting for `participant`.
    pub fn pending(&self, participant: &ParticipantId) -> usize {
        self.queues.get(participant).map_or(0, |q| q.candidates.len())
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }
}
