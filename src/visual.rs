//! Capture level metering
//!
//! Reduces each raw capture chunk to a single energy scalar for UI level
//! bars. The reduction mirrors a frequency-domain analyser: FFT the chunk,
//! map bin magnitudes onto the usual decibel byte range, and average. The
//! meter observes the capture stream only; nothing on the send path
//! depends on it.

use rustfft::{num_complex::Complex, FftPlanner};

// Decibel window mapped to the 0..255 byte range, matching the default
// analyser range used by the original UI meter.
const MIN_DB: f32 = -100.0;
const MAX_DB: f32 = -30.0;

pub struct LevelMeter {
    planner: FftPlanner<f32>,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
        }
    }

    /// Mean spectral energy of one capture chunk.
    ///
    /// Returns 0.0 for silence and roughly 2.0 for a full-scale broadband
    /// signal; the scalar is only meaningful relative to itself.
    pub fn level(&mut self, samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }

        let mut buf: Vec<Complex<f32>> = samples
            .iter()
            .map(|&s| Complex::new(s, 0.0))
            .collect();
        let fft = self.planner.plan_fft_forward(buf.len());
        fft.process(&mut buf);

        let half = (buf.len() / 2).max(1);
        let scale = 2.0 / samples.len() as f32;
        let sum: f32 = buf[..half]
            .iter()
            .map(|c| {
                let magnitude = (c.norm() * scale).max(1e-10);
                let db = 20.0 * magnitude.log10();
                let byte = 255.0 * (db - MIN_DB) / (MAX_DB - MIN_DB);
                byte.clamp(0.0, 255.0)
            })
            .sum();
        sum / half as f32 / 128.0
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new()
    }
}
