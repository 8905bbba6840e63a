//! Teammesh Node - Main Entry Point
//!
//! Runs one mesh participant against a WebSocket relay. Push-to-talk and
//! authority updates are read from stdin:
//!
//! - `down` / `up`: press or release the push-to-talk key
//! - `context {json}`: replace the authority context
//! - `quit`: leave the mesh

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use mesh_client::audio::{AudioOutput, MicrophoneSource};
use mesh_client::ptt::KeyEvent;
use mesh_client::relay::WebSocketRelay;
use mesh_client::rtc::WebRtcConnector;
use mesh_client::{MeshConfig, MeshContext, MeshDeps, MeshHandle, MeshOrchestrator};
use mesh_common::{ParticipantId, TeamId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Must happen before any DTLS handshake
    let _ =
        rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider());

    dotenvy::dotenv().ok();
    let config = MeshConfig::from_env()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mesh_client=debug,mesh_node=debug".into());
    if config.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let context = context_from_env()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        participant = %context.self_id,
        relay = %config.relay_url,
        "Starting Teammesh node"
    );

    let relay = WebSocketRelay::connect(config.relay_url.clone());
    let connector = WebRtcConnector::new().context("failed to initialise WebRTC")?;
    let (microphone, output) = audio_devices();

    let handle = MeshOrchestrator::new(MeshDeps {
        config: config.clone(),
        transport: Arc::new(relay),
        connector: Arc::new(connector),
        microphone,
        output,
    })
    .start(context);

    let mut status = handle.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            info!(
                transmitting = current.transmitting,
                connected = current.connected_peers,
                capture_error = ?current.capture_error,
                roster = ?current.roster,
                "Mesh status"
            );
        }
    });

    tokio::select! {
        result = read_commands(&handle, &config.ptt_key) => {
            if let Err(e) = result {
                warn!(error = %e, "Command input failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }

    handle.stop().await?;
    Ok(())
}

/// Initial authority context from `MESH_*` variables.
fn context_from_env() -> Result<MeshContext> {
    let self_id = std::env::var("MESH_SELF_ID")
        .map(ParticipantId::from)
        .context("MESH_SELF_ID must be set")?;
    let team = std::env::var("MESH_TEAM").ok().map(TeamId::from);
    let moderator = std::env::var("MESH_MODERATOR").is_ok_and(|v| v == "1" || v == "true");
    let teams = |name: &str| -> BTreeSet<TeamId> {
        std::env::var(name)
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(TeamId::from)
            .collect()
    };

    Ok(MeshContext {
        self_id,
        team,
        moderator,
        spectating: teams("MESH_SPECTATE"),
        voice_enabled: teams("MESH_VOICE_ENABLED"),
    })
}

#[cfg(feature = "native-audio")]
fn audio_devices() -> (Arc<dyn MicrophoneSource>, Arc<dyn AudioOutput>) {
    use mesh_client::audio::{CpalMicrophone, CpalOutput};

    (
        Arc::new(CpalMicrophone::new(std::env::var("MESH_INPUT_DEVICE").ok())),
        Arc::new(CpalOutput::new(std::env::var("MESH_OUTPUT_DEVICE").ok())),
    )
}

#[cfg(not(feature = "native-audio"))]
fn audio_devices() -> (Arc<dyn MicrophoneSource>, Arc<dyn AudioOutput>) {
    use mesh_client::audio::{NoMicrophone, NullOutput};

    warn!("Built without native-audio, running receive-only with muted playback");
    (Arc::new(NoMicrophone), Arc::new(NullOutput))
}

async fn read_commands(handle: &MeshHandle, ptt_key: &str) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line.split_once(' ').unwrap_or((line, "")) {
            ("down", _) => handle.key_event(KeyEvent::down(ptt_key)).await?,
            ("up", _) => handle.key_event(KeyEvent::up(ptt_key)).await?,
            ("context", json) => match serde_json::from_str::<MeshContext>(json) {
                Ok(context) => handle.update_context(context).await?,
                Err(e) => warn!(error = %e, "Invalid context"),
            },
            ("quit", _) => break,
            ("", _) => {}
            (other, _) => warn!(command = other, "Unknown command"),
        }
    }
    Ok(())
}
