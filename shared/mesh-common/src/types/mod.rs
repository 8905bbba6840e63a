//! Shared Types

mod context;
mod ids;

pub use context::{CaptureErrorKind, MeshContext, MeshStatus};
pub use ids::{ChannelName, ParticipantId, TeamId};
