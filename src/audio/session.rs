//! In-progress recording and its finished blob
//!
//! An [`AudioSession`] collects PCM16 chunks in capture order. Finalizing it
//! produces a single WAV [`AudioBlob`].

use std::io::Cursor;
use std::time::Instant;

use hound::{WavSpec, WavWriter};

use super::recorder::AudioError;

/// Format delivered by the capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// A chunk of audio samples with metadata
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Interleaved PCM16 samples
    pub samples: Vec<i16>,
    /// Monotonic timestamp when this chunk was captured
    pub captured_at: Instant,
    /// Sequence number for ordering (monotonically increasing)
    pub sequence: u64,
}

impl AudioChunk {
    /// Create a new audio chunk with the current timestamp
    pub fn new(samples: Vec<i16>, sequence: u64) -> Self {
        Self {
            samples,
            captured_at: Instant::now(),
            sequence,
        }
    }
}

/// One recording, from start to stop
#[derive(Debug)]
pub struct AudioSession {
    chunks: Vec<AudioChunk>,
    format: CaptureFormat,
    next_sequence: u64,
    started_at: Instant,
}

impl AudioSession {
    pub fn new(format: CaptureFormat) -> Self {
        Self {
            chunks: Vec::new(),
            format,
            next_sequence: 0,
            started_at: Instant::now(),
        }
    }

    /// Append a chunk, returning its sequence number
    pub fn push(&mut self, samples: Vec<i16>) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.chunks.push(AudioChunk::new(samples, sequence));
        sequence
    }

    pub fn chunks(&self) -> &[AudioChunk] {
        &self.chunks
    }

    pub fn format(&self) -> CaptureFormat {
        self.format
    }

    /// Total samples across all chunks (all channels)
    pub fn sample_count(&self) -> usize {
        self.chunks.iter().map(|c| c.samples.len()).sum()
    }

    /// Duration of captured audio in milliseconds
    pub fn duration_ms(&self) -> u64 {
        let frames = self.sample_count() as u64 / u64::from(self.format.channels.max(1));
        if self.format.sample_rate == 0 {
            return 0;
        }
        frames * 1000 / u64::from(self.format.sample_rate)
    }

    /// Finish the recording into a WAV blob
    pub fn finalize(self) -> Result<AudioBlob, AudioError> {
        let spec = WavSpec {
            channels: self.format.channels,
            sample_rate: self.format.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec)
                .map_err(|e| AudioError::FinalizeFailed(e.to_string()))?;
            for chunk in &self.chunks {
                for &sample in &chunk.samples {
                    writer
                        .write_sample(sample)
                        .map_err(|e| AudioError::FinalizeFailed(e.to_string()))?;
                }
            }
            writer
                .finalize()
                .map_err(|e| AudioError::FinalizeFailed(e.to_string()))?;
        }

        let blob = AudioBlob {
            bytes: cursor.into_inner(),
            sample_rate: self.format.sample_rate,
            channels: self.format.channels,
            duration_ms: self.duration_ms(),
        };

        log::info!(
            "Recording finalized: {} chunks, {}ms, {} bytes (wall clock {:?})",
            self.chunks.len(),
            blob.duration_ms,
            blob.bytes.len(),
            self.started_at.elapsed()
        );

        Ok(blob)
    }
}

/// A finished recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBlob {
    /// WAV file bytes
    pub bytes: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_ms: u64,
}

impl AudioBlob {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
