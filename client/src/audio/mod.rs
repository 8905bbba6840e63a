//! Audio Input/Output
//!
//! Microphone acquisition, the shared outbound track, and playback of remote
//! participants. Hardware access sits behind [`MicrophoneSource`] and
//! [`AudioOutput`]; the cpal/opus implementations are in `native` (feature
//! `native-audio`).

use async_trait::async_trait;
use bytes::Bytes;
use mesh_common::{CaptureErrorKind, ParticipantId};
use thiserror::Error;
use tokio::sync::mpsc;

mod capture;
#[cfg(feature = "native-audio")]
mod native;
mod track;

pub use capture::AudioCaptureManager;
#[cfg(feature = "native-audio")]
pub use native::{CpalMicrophone, CpalOutput};
pub(crate) use track::opus_capability;
pub use track::LocalAudioTrack;

/// Audio configuration constants
pub const SAMPLE_RATE: u32 = 48000;
pub const CHANNELS: u16 = 2;
pub const FRAME_SIZE_MS: usize = 20;
pub const FRAME_SIZE: usize = (SAMPLE_RATE as usize * FRAME_SIZE_MS) / 1000; // 960 samples per channel

/// Audio errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Permission denied")]
    PermissionDenied,
    #[error("No input device available")]
    NoInputDevice,
    #[error("No output device available")]
    NoOutputDevice,
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("Failed to get device config: {0}")]
    ConfigError(String),
    #[error("Failed to build stream: {0}")]
    StreamError(String),
    #[error("Opus encoder error: {0}")]
    EncoderError(String),
    #[error("Opus decoder error: {0}")]
    DecoderError(String),
}

impl AudioError {
    /// Reason reported to the UI.
    pub const fn kind(&self) -> CaptureErrorKind {
        match self {
            Self::PermissionDenied => CaptureErrorKind::PermissionDenied,
            Self::NoInputDevice | Self::NoOutputDevice | Self::DeviceNotFound(_) => {
                CaptureErrorKind::DeviceNotFound
            }
            _ => CaptureErrorKind::Capture,
        }
    }
}

/// Microphone, the `getUserMedia` equivalent.
#[async_trait]
pub trait MicrophoneSource: Send + Sync {
    /// Start hardware capture, delivering encoded Opus frames to `frames`.
    async fn open(&self, frames: mpsc::Sender<Bytes>) -> Result<Box<dyn CaptureStream>, AudioError>;
}

/// A running hardware capture.
pub trait CaptureStream: Send + Sync {
    /// Stop the hardware stream and release the device. Idempotent.
    fn stop(&mut self);
}

/// Encoded audio received from a remote participant.
#[async_trait]
pub trait RemoteAudioSource: Send {
    /// Next encoded packet, or `None` once the remote track ends.
    async fn next_packet(&mut self) -> Option<Bytes>;
}

/// Speaker side: turns a remote source into an audible sink.
pub trait AudioOutput: Send + Sync {
    fn play(
        &self,
        participant: &ParticipantId,
        source: Box<dyn RemoteAudioSource>,
    ) -> Result<Box<dyn PlaybackSink>, AudioError>;
}

/// A playing remote stream. Dropping it stops playback.
pub trait PlaybackSink: Send + Sync {}

/// Output that discards remote audio; used when no speaker is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOutput;

struct NullSink;

impl PlaybackSink for NullSink {}

impl AudioOutput for NullOutput {
    fn play(
        &self,
        _participant: &ParticipantId,
        _source: Box<dyn RemoteAudioSource>,
    ) -> Result<Box<dyn PlaybackSink>, AudioError> {
        Ok(Box::new(NullSink))
    }
}

/// Microphone for builds without audio hardware support.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMicrophone;

#[async_trait]
impl MicrophoneSource for NoMicrophone {
    async fn open(
        &self,
        _frames: mpsc::Sender<Bytes>,
    ) -> Result<Box<dyn CaptureStream>, AudioError> {
        Err(AudioError::NoInputDevice)
    }
}
