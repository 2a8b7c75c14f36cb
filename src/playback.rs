//! Playback sequencing for synthesized speech
//!
//! Inbound speech buffers play strictly in arrival order, one at a time,
//! with the microphone gate disabled from the first enqueue until the
//! queue drains so the capture path cannot pick up the assistant's own
//! voice. Each buffer is decoded and played through a fresh output stream;
//! a buffer that fails to decode or play is dropped and the queue advances.

use crate::capture::MicGate;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::collections::VecDeque;
use std::io::Cursor;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("undecodable audio buffer: {0}")]
    Decode(#[from] hound::Error),

    #[error("audio output failed: {0}")]
    Output(String),
}

/// Decoded PCM ready for the output device.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Parse a received speech buffer as a WAV container.
pub fn decode_wav(buf: &[u8]) -> Result<DecodedAudio, PlaybackError> {
    let mut reader = hound::WavReader::new(Cursor::new(buf))?;
    let spec = reader.spec();
    let samples: Vec<i16> = match spec.sample_format {
        hound::SampleFormat::Int => reader.samples::<i16>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| {
                s.map(|v| {
                    let v = v.clamp(-1.0, 1.0);
                    if v < 0.0 {
                        (v * 32768.0) as i16
                    } else {
                        (v * 32767.0) as i16
                    }
                })
            })
            .collect::<Result<_, _>>()?,
    };
    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Something that can play decoded samples to completion.
pub trait AudioOutput: Send + 'static {
    /// Blocks until the samples have finished playing. Implementations
    /// open a fresh output stream per call and release it before returning.
    fn play(&mut self, audio: &DecodedAudio) -> Result<(), PlaybackError>;
}

/// PulseAudio playback. A new `Simple` stream is created per buffer and
/// drained to completion, keeping the output path independent of the
/// capture stream's lifecycle.
pub struct PulseOutput {
    app_name: String,
}

impl PulseOutput {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
        }
    }
}

impl AudioOutput for PulseOutput {
    fn play(&mut self, audio: &DecodedAudio) -> Result<(), PlaybackError> {
        let spec = Spec {
            format: Format::S16le,
            channels: audio.channels as u8,
            rate: audio.sample_rate,
        };
        if !spec.is_valid() {
            return Err(PlaybackError::Output(format!(
                "invalid playback spec: {} Hz, {} channel(s)",
                audio.sample_rate, audio.channels
            )));
        }

        let simple = Simple::new(
            None,
            &self.app_name,
            Direction::Playback,
            None,
            "playback",
            &spec,
            None,
            None,
        )
        .map_err(|e| PlaybackError::Output(format!("{}", e)))?;

        let mut bytes = Vec::with_capacity(audio.samples.len() * 2);
        for s in &audio.samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        simple
            .write(&bytes)
            .map_err(|e| PlaybackError::Output(format!("{}", e)))?;
        simple
            .drain()
            .map_err(|e| PlaybackError::Output(format!("{}", e)))?;
        Ok(())
    }
}

/// Strict-FIFO queue of raw speech buffers with microphone gating.
pub struct PlaybackSequencer<O: AudioOutput> {
    queue: VecDeque<Vec<u8>>,
    playing: bool,
    gate: MicGate,
    output: O,
}

impl<O: AudioOutput> PlaybackSequencer<O> {
    pub fn new(output: O, gate: MicGate) -> Self {
        Self {
            queue: VecDeque::new(),
            playing: false,
            gate,
            output,
        }
    }

    /// Accept an arriving buffer. The microphone is muted from the first
    /// enqueue; playback itself is driven by `play_next`.
    pub fn accept(&mut self, buf: Vec<u8>) {
        self.gate.set_enabled(false);
        self.queue.push_back(buf);
    }

    /// Decode and play the next queued buffer to completion.
    ///
    /// Returns true while more buffers remain. Once the queue is empty the
    /// microphone is re-enabled and false is returned. Decode and output
    /// failures drop only the one buffer.
    pub fn play_next(&mut self) -> bool {
        let Some(buf) = self.queue.pop_front() else {
            self.playing = false;
            self.gate.set_enabled(true);
            return false;
        };

        self.playing = true;
        match decode_wav(&buf) {
            Ok(audio) => {
                debug!(
                    samples = audio.samples.len(),
                    rate = audio.sample_rate,
                    "playing speech buffer"
                );
                if let Err(e) = self.output.play(&audio) {
                    warn!("playback failed, dropping buffer: {}", e);
                }
            }
            Err(e) => {
                warn!("undecodable speech buffer dropped: {}", e);
            }
        }
        self.playing = false;

        if self.queue.is_empty() {
            self.gate.set_enabled(true);
            false
        } else {
            true
        }
    }

    pub fn is_idle(&self) -> bool {
        !self.playing && self.queue.is_empty()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

/// Emitted by the sequencer thread when the queue has fully drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    Drained,
}

/// Run a sequencer on its own thread, fed by a channel of raw buffers.
///
/// Playback blocks that thread only; arrivals while a buffer is playing
/// wait in channel order, preserving FIFO. The thread exits when the
/// buffer sender is dropped.
pub fn spawn_sequencer<O: AudioOutput>(
    output: O,
    gate: MicGate,
) -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<PlaybackEvent>) {
    let (buf_tx, mut buf_rx) = mpsc::channel::<Vec<u8>>(32);
    let (ev_tx, ev_rx) = mpsc::channel::<PlaybackEvent>(8);

    std::thread::spawn(move || {
        let mut seq = PlaybackSequencer::new(output, gate);
        while let Some(buf) = buf_rx.blocking_recv() {
            seq.accept(buf);
            loop {
                // Pull in anything that arrived while the last buffer played.
                while let Ok(more) = buf_rx.try_recv() {
                    seq.accept(more);
                }
                if !seq.play_next() {
                    break;
                }
            }
            if ev_tx.blocking_send(PlaybackEvent::Drained).is_err() {
                break;
            }
        }
    });

    (buf_tx, ev_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records what was played and whether the gate was muted at play time.
    struct FakeOutput {
        log: Arc<Mutex<Vec<(i16, bool)>>>,
        gate: MicGate,
        fail_on_first_sample: Option<i16>,
    }

    impl AudioOutput for FakeOutput {
        fn play(&mut self, audio: &DecodedAudio) -> Result<(), PlaybackError> {
            let first = audio.samples.first().copied().unwrap_or(0);
            self.log
                .lock()
                .unwrap()
                .push((first, self.gate.is_enabled()));
            if self.fail_on_first_sample == Some(first) {
                return Err(PlaybackError::Output("device gone".into()));
            }
            Ok(())
        }
    }

    fn wav_with_first_sample(first: i16) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            writer.write_sample(first).unwrap();
            writer.write_sample(0i16).unwrap();
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn sequencer_with_log(
        fail_on: Option<i16>,
    ) -> (
        PlaybackSequencer<FakeOutput>,
        MicGate,
        Arc<Mutex<Vec<(i16, bool)>>>,
    ) {
        let gate = MicGate::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let output = FakeOutput {
            log: log.clone(),
            gate: gate.clone(),
            fail_on_first_sample: fail_on,
        };
        (PlaybackSequencer::new(output, gate.clone()), gate, log)
    }

    #[test]
    fn buffers_play_in_arrival_order() {
        let (mut seq, gate, log) = sequencer_with_log(None);
        for first in [10i16, 20, 30] {
            seq.accept(wav_with_first_sample(first));
        }
        while seq.play_next() {}

        let played: Vec<i16> = log.lock().unwrap().iter().map(|(s, _)| *s).collect();
        assert_eq!(played, vec![10, 20, 30]);
        assert!(gate.is_enabled());
        assert!(seq.is_idle());
    }

    #[test]
    fn microphone_muted_while_queue_active() {
        let (mut seq, gate, log) = sequencer_with_log(None);
        seq.accept(wav_with_first_sample(1));
        assert!(!gate.is_enabled(), "muted from first enqueue");
        seq.accept(wav_with_first_sample(2));
        while seq.play_next() {}

        // Gate was disabled at every play, re-enabled only after the drain.
        for (_, enabled) in log.lock().unwrap().iter() {
            assert!(!enabled);
        }
        assert!(gate.is_enabled());
    }

    #[test]
    fn undecodable_buffer_is_dropped_and_queue_advances() {
        let (mut seq, gate, log) = sequencer_with_log(None);
        seq.accept(wav_with_first_sample(5));
        seq.accept(b"definitely not a wav".to_vec());
        seq.accept(wav_with_first_sample(7));
        while seq.play_next() {}

        let played: Vec<i16> = log.lock().unwrap().iter().map(|(s, _)| *s).collect();
        assert_eq!(played, vec![5, 7]);
        assert!(gate.is_enabled());
    }

    #[test]
    fn output_failure_drops_one_buffer_only() {
        let (mut seq, gate, log) = sequencer_with_log(Some(5));
        seq.accept(wav_with_first_sample(5));
        seq.accept(wav_with_first_sample(9));
        while seq.play_next() {}

        let played: Vec<i16> = log.lock().unwrap().iter().map(|(s, _)| *s).collect();
        assert_eq!(played, vec![5, 9]);
        assert!(gate.is_enabled());
    }

    #[test]
    fn play_next_on_empty_queue_is_harmless() {
        let (mut seq, gate, _log) = sequencer_with_log(None);
        assert!(!seq.play_next());
        assert!(!seq.play_next());
        assert!(gate.is_enabled());
    }

    #[test]
    fn decode_rejects_garbage_and_accepts_wav() {
        assert!(decode_wav(b"junk").is_err());
        let audio = decode_wav(&wav_with_first_sample(42)).unwrap();
        assert_eq!(audio.sample_rate, 16_000);
        assert_eq!(audio.channels, 1);
        assert_eq!(audio.samples[0], 42);
    }

    #[tokio::test]
    async fn threaded_sequencer_reports_drain() {
        let gate = MicGate::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let output = FakeOutput {
            log: log.clone(),
            gate: gate.clone(),
            fail_on_first_sample: None,
        };
        let (buf_tx, mut ev_rx) = spawn_sequencer(output, gate.clone());

        buf_tx.send(wav_with_first_sample(3)).await.unwrap();
        buf_tx.send(wav_with_first_sample(4)).await.unwrap();
        drop(buf_tx);

        // Collect drain reports until the sequencer thread exits.
        let mut drains = 0;
        while let Some(ev) = ev_rx.recv().await {
            assert_eq!(ev, PlaybackEvent::Drained);
            drains += 1;
        }
        assert!(drains >= 1);

        let played: Vec<i16> = log.lock().unwrap().iter().map(|(s, _)| *s).collect();
        assert_eq!(played, vec![3, 4]);
        assert!(gate.is_enabled());
    }
}
