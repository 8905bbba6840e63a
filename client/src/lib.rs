//! Teammesh Voice Client Library
//!
//! Team-scoped peer-to-peer voice mesh: one direct WebRTC connection per
//! remote participant, signaled over per-team relay channels, with
//! push-to-talk gating and receive-only moderator spectating.

pub mod audio;
pub mod config;
pub mod error;
pub mod ice;
pub mod mesh;
pub mod peer;
pub mod ptt;
pub mod registry;
pub mod relay;
pub mod rtc;

#[cfg(test)]
mod testing;

pub use config::MeshConfig;
pub use error::MeshError;
pub use mesh::{MeshDeps, MeshHandle, MeshOrchestrator};
pub use mesh_common::{MeshContext, MeshStatus};
