//! cpal/opus Audio Backend
//!
//! `cpal::Stream` is not `Send`, so every stream is created, played and dropped
//! on its own blocking task; the handles returned here only hold control
//! channels.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, BuildStreamError, Device, StreamConfig};
use mesh_common::ParticipantId;
use opus::{Application, Channels as OpusChannels, Decoder, Encoder};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    AudioError, AudioOutput, CaptureStream, MicrophoneSource, PlaybackSink, RemoteAudioSource,
    CHANNELS, FRAME_SIZE, SAMPLE_RATE,
};

/// Decoded samples kept per remote participant before old audio is dropped.
const MAX_PLAYBACK_BUFFER_FRAMES: usize = 20;

fn stream_config() -> StreamConfig {
    StreamConfig {
        channels: CHANNELS,
        sample_rate: SAMPLE_RATE,
        buffer_size: BufferSize::Default,
    }
}

fn find_device(name: Option<&str>, is_input: bool) -> Result<Device, AudioError> {
    let host = cpal::default_host();
    match name {
        Some(name) => {
            let mut devices = if is_input {
                host.input_devices()
            } else {
                host.output_devices()
            }
            .map_err(|e| AudioError::ConfigError(e.to_string()))?;

            devices
                .find(|d| d.description().is_ok_and(|desc| desc.name() == name))
                .ok_or_else(|| AudioError::DeviceNotFound(name.to_string()))
        }
        None => {
            if is_input {
                host.default_input_device().ok_or(AudioError::NoInputDevice)
            } else {
                host.default_output_device().ok_or(AudioError::NoOutputDevice)
            }
        }
    }
}

/// Map a stream build failure to the capture taxonomy.
fn build_error(err: &BuildStreamError, is_input: bool) -> AudioError {
    match err {
        BuildStreamError::DeviceNotAvailable if is_input => AudioError::NoInputDevice,
        BuildStreamError::DeviceNotAvailable => AudioError::NoOutputDevice,
        other => {
            let message = other.to_string();
            let lower = message.to_lowercase();
            if lower.contains("permission") || lower.contains("denied") {
                AudioError::PermissionDenied
            } else {
                AudioError::StreamError(message)
            }
        }
    }
}

/// Default (or named) input device, Opus-encoded.
#[derive(Debug, Clone, Default)]
pub struct CpalMicrophone {
    device_name: Option<String>,
}

impl CpalMicrophone {
    pub const fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

struct NativeCapture {
    stop_tx: Option<mpsc::Sender<()>>,
}

impl CaptureStream for NativeCapture {
    fn stop(&mut self) {
        if self.stop_tx.take().is_some() {
            debug!("Audio capture stopped");
        }
    }
}

#[async_trait]
impl MicrophoneSource for CpalMicrophone {
    async fn open(
        &self,
        frames: mpsc::Sender<Bytes>,
    ) -> Result<Box<dyn CaptureStream>, AudioError> {
        let device = find_device(self.device_name.as_deref(), true)?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);

        tokio::task::spawn_blocking(move || {
            run_capture_task(device, frames, ready_tx, stop_rx);
        });

        match ready_rx.await {
            Ok(Ok(())) => {
                info!("Audio capture started");
                Ok(Box::new(NativeCapture {
                    stop_tx: Some(stop_tx),
                }))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AudioError::StreamError(
                "capture task exited before starting".into(),
            )),
        }
    }
}

/// Run capture task (owns the Stream)
fn run_capture_task(
    device: Device,
    frames: mpsc::Sender<Bytes>,
    ready: oneshot::Sender<Result<(), AudioError>>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let mut encoder = match Encoder::new(SAMPLE_RATE, OpusChannels::Stereo, Application::Voip) {
        Ok(enc) => enc,
        Err(e) => {
            let _ = ready.send(Err(AudioError::EncoderError(e.to_string())));
            return;
        }
    };

    let frame_samples = FRAME_SIZE * CHANNELS as usize;
    let mut buffer: Vec<f32> = Vec::with_capacity(frame_samples * 2);

    let stream = match device.build_input_stream(
        &stream_config(),
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            buffer.extend_from_slice(data);

            while buffer.len() >= frame_samples {
                let samples: Vec<i16> = buffer
                    .drain(..frame_samples)
                    .map(|s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
                    .collect();

                let mut encoded = vec![0u8; 4000];
                match encoder.encode(&samples, &mut encoded) {
                    Ok(len) => {
                        encoded.truncate(len);
                        if let Err(e) = frames.try_send(Bytes::from(encoded)) {
                            warn!("Failed to queue encoded audio: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("Opus encode error: {}", e);
                    }
                }
            }
        },
        |err| {
            error!("Audio capture stream error: {}", err);
        },
        None,
    ) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready.send(Err(build_error(&e, true)));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready.send(Err(AudioError::StreamError(e.to_string())));
        return;
    }

    if ready.send(Ok(())).is_err() {
        return;
    }

    // Block until the handle is stopped or dropped
    let _ = stop_rx.blocking_recv();

    drop(stream);
    info!("Capture task stopped");
}

/// Default (or named) output device, one stream per remote participant.
#[derive(Debug, Clone, Default)]
pub struct CpalOutput {
    device_name: Option<String>,
}

impl CpalOutput {
    pub const fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

struct NativePlayback {
    reader: JoinHandle<()>,
    _stop_tx: mpsc::Sender<()>,
}

impl PlaybackSink for NativePlayback {}

impl Drop for NativePlayback {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl AudioOutput for CpalOutput {
    fn play(
        &self,
        participant: &ParticipantId,
        mut source: Box<dyn RemoteAudioSource>,
    ) -> Result<Box<dyn PlaybackSink>, AudioError> {
        let device = find_device(self.device_name.as_deref(), false)?;

        let (packets_tx, packets_rx) = mpsc::channel::<Bytes>(100);
        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);

        let reader = tokio::spawn(async move {
            while let Some(packet) = source.next_packet().await {
                if packets_tx.send(packet).await.is_err() {
                    break;
                }
            }
        });

        let who = participant.clone();
        tokio::task::spawn_blocking(move || {
            run_playback_task(&who, device, packets_rx, stop_rx);
        });

        debug!(participant = %participant, "Playback started");
        Ok(Box::new(NativePlayback {
            reader,
            _stop_tx: stop_tx,
        }))
    }
}

/// Run playback task (owns the Stream)
fn run_playback_task(
    participant: &ParticipantId,
    device: Device,
    mut packets_rx: mpsc::Receiver<Bytes>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let mut decoder = match Decoder::new(SAMPLE_RATE, OpusChannels::Stereo) {
        Ok(dec) => dec,
        Err(e) => {
            error!(participant = %participant, "Failed to create decoder: {}", e);
            return;
        }
    };

    let frame_samples = FRAME_SIZE * CHANNELS as usize;
    let max_buffered = frame_samples * MAX_PLAYBACK_BUFFER_FRAMES;
    let playback_buffer = Arc::new(Mutex::new(VecDeque::<f32>::new()));

    // Decoding thread, ends when the packet reader goes away
    let decode_buffer = playback_buffer.clone();
    std::thread::spawn(move || {
        let mut decoded = vec![0i16; frame_samples * 2];
        while let Some(encoded) = packets_rx.blocking_recv() {
            match decoder.decode(&encoded, &mut decoded, false) {
                Ok(per_channel) => {
                    let len = (per_channel * CHANNELS as usize).min(decoded.len());
                    if let Ok(mut buffer) = decode_buffer.lock() {
                        buffer.extend(decoded[..len].iter().map(|&s| f32::from(s) / 32768.0));
                        if buffer.len() > max_buffered {
                            let excess = buffer.len() - max_buffered;
                            buffer.drain(..excess);
                        }
                    }
                }
                Err(e) => {
                    error!("Opus decode error: {}", e);
                }
            }
        }
    });

    let stream = match device.build_output_stream(
        &stream_config(),
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            if let Ok(mut buffer) = playback_buffer.lock() {
                for sample in data.iter_mut() {
                    *sample = buffer.pop_front().unwrap_or(0.0);
                }
            } else {
                data.fill(0.0);
            }
        },
        |err| {
            error!("Audio playback stream error: {}", err);
        },
        None,
    ) {
        Ok(s) => s,
        Err(e) => {
            error!(participant = %participant, error = %build_error(&e, false), "Failed to build playback stream");
            return;
        }
    };

    if let Err(e) = stream.play() {
        error!(participant = %participant, "Failed to start playback stream: {}", e);
        return;
    }

    // Block until the sink is dropped
    let _ = stop_rx.blocking_recv();

    drop(stream);
    info!(participant = %participant, "Playback task stopped");
}
