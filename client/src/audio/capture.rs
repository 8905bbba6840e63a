//! Local Audio Capture Manager
//!
//! Owns the microphone for the mesh: one hardware acquisition per activation,
//! full release on deactivation or drop.

use std::sync::Arc;

use bytes::Bytes;
use mesh_common::CaptureErrorKind;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{AudioError, CaptureStream, LocalAudioTrack, MicrophoneSource};

/// Frames buffered between the capture callback and the track writer.
const FRAME_QUEUE: usize = 64;

struct ActiveCapture {
    track: Arc<LocalAudioTrack>,
    stream: Box<dyn CaptureStream>,
    writer: JoinHandle<()>,
}

impl Drop for ActiveCapture {
    fn drop(&mut self) {
        self.track.set_enabled(false);
        self.stream.stop();
        self.writer.abort();
    }
}

/// Acquires and releases the shared microphone track.
pub struct AudioCaptureManager {
    source: Arc<dyn MicrophoneSource>,
    active: Option<ActiveCapture>,
    tracks: watch::Sender<Option<Arc<LocalAudioTrack>>>,
    last_error: Option<CaptureErrorKind>,
}

impl AudioCaptureManager {
    pub fn new(source: Arc<dyn MicrophoneSource>) -> Self {
        let (tracks, _) = watch::channel(None);
        Self {
            source,
            active: None,
            tracks,
            last_error: None,
        }
    }

    /// Drive the "should be active" signal.
    ///
    /// Activating while already active reuses the existing track. Returns the
    /// current track (if any).
    pub async fn set_active(
        &mut self,
        active: bool,
    ) -> Result<Option<Arc<LocalAudioTrack>>, AudioError> {
        if !active {
            if self.active.take().is_some() {
                self.tracks.send_replace(None);
                info!("Microphone released");
            }
            return Ok(None);
        }

        if let Some(current) = &self.active {
            return Ok(Some(current.track.clone()));
        }

        let (frames_tx, frames_rx) = mpsc::channel::<Bytes>(FRAME_QUEUE);
        let stream = match self.source.open(frames_tx).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Microphone acquisition failed");
                self.last_error = Some(e.kind());
                return Err(e);
            }
        };

        let track = Arc::new(LocalAudioTrack::new());
        let writer = tokio::spawn(write_frames(track.clone(), frames_rx));

        self.active = Some(ActiveCapture {
            track: track.clone(),
            stream,
            writer,
        });
        self.last_error = None;
        self.tracks.send_replace(Some(track.clone()));

        info!(track = %track.id(), "Microphone acquired");
        Ok(Some(track))
    }

    pub fn track(&self) -> Option<Arc<LocalAudioTrack>> {
        self.active.as_ref().map(|a| a.track.clone())
    }

    pub const fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub const fn last_error(&self) -> Option<CaptureErrorKind> {
        self.last_error
    }

    /// Observe track creation and teardown.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<LocalAudioTrack>>> {
        self.tracks.subscribe()
    }
}

/// Pump encoded frames from the capture stream into the track.
async fn write_frames(track: Arc<LocalAudioTrack>, mut frames: mpsc::Receiver<Bytes>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = track.write_frame(frame).await {
            warn!(track = %track.id(), error = %e, "Failed to write to local track");
        }
    }
}
