//! Microphone capture controller
//!
//! [`AudioCaptureController`] owns at most one recording at a time. The device
//! stream is acquired on start and dropped on stop, so the microphone is
//! released on every exit path. Samples arrive on the device thread and are
//! handed over through an unbounded channel; [`AudioCaptureController::collect_pending`]
//! moves them into the session.
//!
//! The device itself sits behind [`CaptureBackend`]. [`CpalBackend`] captures
//! from the default input device.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Sample, SampleFormat, Stream, StreamConfig};
use thiserror::Error;
use tokio::sync::mpsc;

use super::session::{AudioBlob, AudioSession, CaptureFormat};

/// Errors that can occur during audio capture.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AudioError {
    #[error("No audio input device available")]
    DeviceUnavailable,
    #[error("A recording is already in progress")]
    AlreadyRecording,
    #[error("No supported audio configuration")]
    NoSupportedConfig,
    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),
    #[error("Failed to finalize recording: {0}")]
    FinalizeFailed(String),
}

/// Called on the device thread with each buffer of PCM16 samples
pub type SampleCallback = Box<dyn FnMut(&[i16]) + Send + 'static>;

/// A running capture stream. Dropping it releases the device.
pub trait CaptureStream {
    fn format(&self) -> CaptureFormat;
}

/// Source of capture streams
pub trait CaptureBackend {
    /// Whether a capture device can be opened right now
    fn is_available(&self) -> bool;

    /// Open and start a capture stream delivering samples to `on_samples`
    fn open(&self, on_samples: SampleCallback) -> Result<Box<dyn CaptureStream>, AudioError>;
}

struct ActiveRecording {
    // Declared first so the device is released before the rest is dropped
    stream: Box<dyn CaptureStream>,
    session: AudioSession,
    chunk_rx: mpsc::UnboundedReceiver<Vec<i16>>,
}

/// Starts and stops microphone recordings
pub struct AudioCaptureController {
    backend: Box<dyn CaptureBackend>,
    active: Option<ActiveRecording>,
}

impl AudioCaptureController {
    pub fn new(backend: Box<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            active: None,
        }
    }

    /// Controller on the default input device
    pub fn with_default_device() -> Self {
        Self::new(Box::new(CpalBackend))
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Acquire the device and begin accumulating chunks
    pub fn start_recording(&mut self) -> Result<(), AudioError> {
        if self.active.is_some() {
            return Err(AudioError::AlreadyRecording);
        }
        if !self.backend.is_available() {
            return Err(AudioError::DeviceUnavailable);
        }

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let stream = self.backend.open(Box::new(move |samples: &[i16]| {
            // Receiver gone means the recording was stopped; drop the buffer
            let _ = chunk_tx.send(samples.to_vec());
        }))?;

        let format = stream.format();
        log::info!(
            "Recording started: {} Hz, {} channels",
            format.sample_rate,
            format.channels
        );

        self.active = Some(ActiveRecording {
            stream,
            session: AudioSession::new(format),
            chunk_rx,
        });
        Ok(())
    }

    /// Move chunks delivered by the device into the session.
    /// Returns how many chunks were collected.
    pub fn collect_pending(&mut self) -> usize {
        let Some(active) = self.active.as_mut() else {
            return 0;
        };
        let mut collected = 0;
        while let Ok(samples) = active.chunk_rx.try_recv() {
            active.session.push(samples);
            collected += 1;
        }
        collected
    }

    /// Release the device and finish the recording.
    /// Returns `Ok(None)` when nothing was being recorded.
    pub fn stop_recording(&mut self) -> Result<Option<AudioBlob>, AudioError> {
        let Some(active) = self.active.take() else {
            log::debug!("stop_recording: no active recording");
            return Ok(None);
        };

        let ActiveRecording {
            stream,
            mut session,
            mut chunk_rx,
        } = active;

        drop(stream);
        log::debug!("Capture device released");

        while let Ok(samples) = chunk_rx.try_recv() {
            session.push(samples);
        }

        session.finalize().map(Some)
    }
}

/// Capture from the default input device via `cpal`
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    fn default_device() -> Result<(Device, StreamConfig, SampleFormat), AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(AudioError::DeviceUnavailable)?;

        log::info!("Using audio input device: {:?}", device.name());

        let supported_config = device
            .default_input_config()
            .map_err(|_| AudioError::NoSupportedConfig)?;

        log::info!(
            "Audio config: {} Hz, {} channels, {:?}",
            supported_config.sample_rate().0,
            supported_config.channels(),
            supported_config.sample_format()
        );

        let sample_format = supported_config.sample_format();
        Ok((device, supported_config.into(), sample_format))
    }
}

impl CaptureBackend for CpalBackend {
    fn is_available(&self) -> bool {
        cpal::default_host().default_input_device().is_some()
    }

    fn open(&self, on_samples: SampleCallback) -> Result<Box<dyn CaptureStream>, AudioError> {
        let (device, config, sample_format) = Self::default_device()?;

        let stream = match sample_format {
            SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, on_samples),
            SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, on_samples),
            SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, on_samples),
            _ => Err(AudioError::NoSupportedConfig),
        }?;

        stream.play().map_err(|e| {
            AudioError::StreamCreationFailed(format!("Failed to start stream: {}", e))
        })?;

        Ok(Box::new(CpalStream {
            _stream: stream,
            format: CaptureFormat {
                sample_rate: config.sample_rate.0,
                channels: config.channels,
            },
        }))
    }
}

struct CpalStream {
    _stream: Stream,
    format: CaptureFormat,
}

impl CaptureStream for CpalStream {
    fn format(&self) -> CaptureFormat {
        self.format
    }
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    mut on_samples: SampleCallback,
) -> Result<Stream, AudioError>
where
    T: Sample + cpal::SizedSample + Send + 'static,
{
    let err_fn = |err: cpal::StreamError| log::error!("Audio stream error: {}", err);
    let mut buffer: Vec<i16> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                buffer.clear();
                buffer.extend(data.iter().map(|&s| sample_to_i16(s)));
                on_samples(&buffer);
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

/// Convert any sample type to PCM16.
fn sample_to_i16<T: Sample>(sample: T) -> i16 {
    let f32_sample: f32 = sample.to_float_sample().to_sample();
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}
