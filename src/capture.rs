//! Microphone capture
//!
//! Acquires a PulseAudio record stream at the fixed session constraints
//! (16 kHz, mono) and feeds floating-point capture chunks to the session
//! over a channel from a dedicated OS thread. Noise suppression and echo
//! cancellation are requested in the capture config and applied by the
//! sound server's source filters.

use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Sample rate both backends expect.
pub const SAMPLE_RATE: u32 = 16_000;
/// Mono capture.
pub const CHANNELS: u8 = 1;
/// Samples per capture chunk, matching one capture callback's buffer.
pub const CHUNK_SAMPLES: usize = 4096;

/// Constraints the microphone stream is opened with.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub noise_suppression: bool,
    pub echo_cancellation: bool,
    /// Specific source name, or `None` for the default device.
    pub device: Option<String>,
    pub app_name: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            noise_suppression: true,
            echo_cancellation: true,
            device: None,
            app_name: "lingolive".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    /// Access denied or no usable input device. Session start must abort
    /// and surface this to the user.
    #[error("microphone unavailable: {0}")]
    PermissionDenied(String),

    #[error("capture stream failed: {0}")]
    Stream(String),
}

/// Shared on/off switch for the captured track, the equivalent of toggling
/// `enabled` on a live media track: the stream keeps running, but chunks
/// are discarded while the gate is disabled. Only the playback sequencer
/// disables the gate, and only for the duration of its own playback.
#[derive(Debug, Clone)]
pub struct MicGate(Arc<AtomicBool>);

impl MicGate {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for MicGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Controls a running capture thread.
pub struct CaptureHandle {
    running: Arc<AtomicBool>,
}

impl CaptureHandle {
    /// Stop the capture thread. Safe to call more than once.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Open the microphone and start streaming capture chunks.
///
/// Blocks until the record stream is up or has failed, so callers on an
/// async runtime should wrap this in `spawn_blocking`. The stream runs on
/// its own OS thread until the handle is stopped or the receiver dropped.
pub fn start_capture(
    config: &CaptureConfig,
) -> Result<(mpsc::Receiver<Vec<f32>>, CaptureHandle), CaptureError> {
    let spec = Spec {
        format: Format::F32le,
        channels: config.channels,
        rate: config.sample_rate,
    };
    if !spec.is_valid() {
        return Err(CaptureError::Stream(format!(
            "invalid sample spec: {} Hz, {} channel(s)",
            config.sample_rate, config.channels
        )));
    }

    let (tx, rx) = mpsc::channel::<Vec<f32>>(32);
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), CaptureError>>();
    let running = Arc::new(AtomicBool::new(true));
    let thread_running = running.clone();

    let app_name = config.app_name.clone();
    let device = config.device.clone();

    std::thread::spawn(move || {
        let simple = match Simple::new(
            None, // default server
            &app_name,
            Direction::Record,
            device.as_deref(),
            "capture",
            &spec,
            None, // default channel map
            None, // default buffering
        ) {
            Ok(s) => {
                let _ = ready_tx.send(Ok(()));
                s
            }
            Err(e) => {
                let _ = ready_tx.send(Err(CaptureError::PermissionDenied(format!("{}", e))));
                return;
            }
        };

        info!("microphone stream open at {} Hz", spec.rate);
        let mut buf = vec![0u8; CHUNK_SAMPLES * 4];
        while thread_running.load(Ordering::SeqCst) {
            match simple.read(&mut buf) {
                Ok(()) => {
                    let chunk = bytes_to_f32(&buf);
                    if tx.blocking_send(chunk).is_err() {
                        // Receiver gone, session is over.
                        break;
                    }
                }
                Err(e) => {
                    error!("microphone read failed: {}", e);
                    break;
                }
            }
        }
        info!("microphone stream closed");
    });

    match ready_rx.recv() {
        Ok(Ok(())) => Ok((rx, CaptureHandle { running })),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(CaptureError::Stream(
            "capture thread exited before reporting readiness".to_string(),
        )),
    }
}

fn bytes_to_f32(buf: &[u8]) -> Vec<f32> {
    buf.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_starts_enabled_and_toggles() {
        let gate = MicGate::new();
        assert!(gate.is_enabled());
        gate.set_enabled(false);
        assert!(!gate.is_enabled());
        let clone = gate.clone();
        clone.set_enabled(true);
        assert!(gate.is_enabled());
    }

    #[test]
    fn default_config_matches_session_constraints() {
        let cfg = CaptureConfig::default();
        assert_eq!(cfg.sample_rate, 16_000);
        assert_eq!(cfg.channels, 1);
        assert!(cfg.noise_suppression);
        assert!(cfg.echo_cancellation);
    }

    #[test]
    fn bytes_decode_to_f32_in_order() {
        let mut buf = Vec::new();
        for v in [0.0f32, -1.0, 0.5] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(bytes_to_f32(&buf), vec![0.0, -1.0, 0.5]);
    }
}
