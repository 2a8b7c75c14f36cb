//! Pending-batch accumulation for outbound audio
//!
//! Capture frames queue here between flush ticks; each flush concatenates
//! everything queued, in arrival order, into one contiguous little-endian
//! buffer for the transport. The queue is bounded: if the transport stalls
//! long enough to hit the cap, the oldest frames are dropped and the drop is
//! logged, rather than growing without limit for the life of the session.

use crate::pcm::AudioFrame;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::warn;

/// Cadence at which queued frames are flushed to the transport.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(3000);

/// Default cap on queued frames (~12 s of audio at 4096 samples/frame).
pub const DEFAULT_MAX_FRAMES: usize = 64;

/// FIFO of audio frames awaiting the next flush.
#[derive(Debug)]
pub struct PendingBatch {
    frames: VecDeque<AudioFrame>,
    max_frames: usize,
    dropped: u64,
}

impl PendingBatch {
    pub fn new(max_frames: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            max_frames,
            dropped: 0,
        }
    }

    /// Queue a frame, evicting the oldest if the cap is reached.
    pub fn push(&mut self, frame: AudioFrame) {
        if self.frames.len() >= self.max_frames {
            self.frames.pop_front();
            self.dropped += 1;
            warn!(
                dropped = self.dropped,
                "pending batch full, dropping oldest frame"
            );
        }
        self.frames.push_back(frame);
    }

    /// Concatenate all queued frames into one little-endian byte buffer,
    /// preserving arrival order, and clear the queue. Returns `None` when
    /// nothing is queued.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.frames.is_empty() {
            return None;
        }
        let total: usize = self.frames.iter().map(AudioFrame::len).sum();
        let mut out = Vec::with_capacity(total * 2);
        for frame in self.frames.drain(..) {
            frame.extend_le_bytes(&mut out);
        }
        Some(out)
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Total samples currently queued.
    pub fn sample_count(&self) -> usize {
        self.frames.iter().map(AudioFrame::len).sum()
    }

    /// Frames evicted so far because the cap was hit.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for PendingBatch {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAMES)
    }
}
