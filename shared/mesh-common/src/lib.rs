//! Teammesh Common Library
//!
//! Wire protocol and shared types used by every mesh participant and by the
//! relay that carries their signaling traffic.

pub mod protocol;
pub mod types;

pub use protocol::*;
pub use types::*;
