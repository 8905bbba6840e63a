//! Mesh Configuration
//!
//! Loads configuration from environment variables.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// Mesh configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    /// WebSocket relay endpoint (e.g., "ws://127.0.0.1:6001/relay")
    pub relay_url: String,

    /// Fixed STUN resolvers handed to every peer connection
    pub stun_servers: Vec<String>,

    /// Push-to-talk key (default: "v")
    pub ptt_key: String,

    /// Push-to-talk debounce window (default: 50ms)
    pub ptt_debounce: Duration,

    /// Maximum pending ICE candidates per participant (default: 64)
    pub ice_buffer_cap: usize,

    /// Pending ICE candidate expiry (default: 30s)
    pub ice_buffer_ttl: Duration,

    /// Capacity of the relay and command queue feeding the dispatch loop
    /// (default: 256). Peer callbacks are queued separately.
    pub event_capacity: usize,

    /// JSON log output in the binary
    pub log_json: bool,
}

const DEFAULT_STUN_SERVERS: &str = "stun:stun.l.google.com:19302,stun:stun1.l.google.com:19302";

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} has an invalid value: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl MeshConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let stun_servers = split_list(
            &env::var("MESH_STUN_SERVERS").unwrap_or_else(|_| DEFAULT_STUN_SERVERS.into()),
        );
        if stun_servers.is_empty() {
            anyhow::bail!("MESH_STUN_SERVERS must name at least one server");
        }

        let ice_buffer_cap = parsed("MESH_ICE_BUFFER_CAP", 64usize)?;
        if ice_buffer_cap == 0 {
            anyhow::bail!("MESH_ICE_BUFFER_CAP must be greater than zero");
        }

        Ok(Self {
            relay_url: env::var("MESH_RELAY_URL")
                .unwrap_or_else(|_| "ws://127.0.0.1:6001/relay".into()),
            stun_servers,
            ptt_key: env::var("MESH_PTT_KEY").unwrap_or_else(|_| "v".into()),
            ptt_debounce: Duration::from_millis(parsed("MESH_PTT_DEBOUNCE_MS", 50u64)?),
            ice_buffer_cap,
            ice_buffer_ttl: Duration::from_secs(parsed("MESH_ICE_BUFFER_TTL_SECS", 30u64)?),
            event_capacity: parsed("MESH_EVENT_CAPACITY", 256usize)?.max(1),
            log_json: parsed("MESH_LOG_JSON", false)?,
        })
    }

    /// Create a default configuration for testing.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:6001/relay".into(),
            stun_servers: vec!["stun:stun.l.google.com:19302".into()],
            ptt_key: "v".into(),
            ptt_debounce: Duration::from_millis(50),
            ice_buffer_cap: 8,
            ice_buffer_ttl: Duration::from_secs(30),
            event_capacity: 64,
            log_json: false,
        }
    }
}
