//! Mesh Errors

use thiserror::Error;

use crate::audio::AudioError;
use crate::peer::PeerError;
use crate::relay::RelayError;

/// Errors surfaced by the orchestrator handle.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("Mesh is not running")]
    Stopped,
}
