//! Audio rendering seam for assistant audio deltas

/// Receives decoded assistant audio as it streams in
pub trait AudioPlayback: Send {
    fn play(&mut self, pcm: &[u8]);
}

/// Discards audio, keeping a byte count for logs
#[derive(Debug, Default)]
pub struct NullPlayback {
    bytes: u64,
}

impl NullPlayback {
    pub fn bytes_received(&self) -> u64 {
        self.bytes
    }
}

impl AudioPlayback for NullPlayback {
    fn play(&mut self, pcm: &[u8]) {
        self.bytes += pcm.len() as u64;
        log::trace!("NullPlayback: dropped {} bytes ({} total)", pcm.len(), self.bytes);
    }
}
