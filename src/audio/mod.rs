//! Audio capture and playback seams
//!
//! Capture uses CPAL and finishes each recording into a WAV blob via hound.
//! Playback of assistant audio is delegated to an [`AudioPlayback`] implementor.

mod playback;
pub mod recorder;
mod session;

pub use playback::{AudioPlayback, NullPlayback};
pub use recorder::{
    AudioCaptureController, AudioError, CaptureBackend, CaptureStream, CpalBackend, SampleCallback,
};
pub use session::{AudioBlob, AudioChunk, AudioSession, CaptureFormat};
