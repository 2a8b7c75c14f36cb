//! Voice-assistant session
//!
//! Extends the recording pipeline with peer negotiation and synthesized
//! speech playback: the socket carries signaling (offer/answer/candidate)
//! and a keep-alive ping alongside the outbound PCM batches, and inbound
//! binary frames are speech buffers handed to the playback sequencer.
//! While the assistant is speaking the session sits in `Playing` and
//! capture frames are dropped so the microphone cannot feed the
//! assistant's own voice back into the stream.

use crate::batch::{PendingBatch, DEFAULT_MAX_FRAMES, FLUSH_INTERVAL};
use crate::capture::{start_capture, CaptureConfig, CaptureError, CaptureHandle, MicGate};
use crate::pcm::AudioFrame;
use crate::playback::{spawn_sequencer, AudioOutput, PlaybackEvent, PulseOutput};
use crate::protocol::{self, AssistantOptions, SignalMessage};
use crate::rtc::PeerSignaling;
use crate::session::{SessionError, Teardown};
use crate::state::{transition, SessionState};
use crate::transport::{send_json, TransportEvent, Wire, WsTransport};
use crate::visual::LevelMeter;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Keep-alive cadence, independent of the audio flush cadence.
pub const PING_INTERVAL: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone)]
pub struct AssistantConfig {
    /// Backend base URL, e.g. `wss://backend.example/api`.
    pub base_url: String,
    pub options: AssistantOptions,
    pub capture: CaptureConfig,
    pub flush_interval: Duration,
    pub ping_interval: Duration,
    pub max_pending_frames: usize,
}

impl AssistantConfig {
    pub fn new(base_url: &str, options: AssistantOptions) -> Self {
        Self {
            base_url: base_url.to_string(),
            options,
            capture: CaptureConfig::default(),
            flush_interval: FLUSH_INTERVAL,
            ping_interval: PING_INTERVAL,
            max_pending_frames: DEFAULT_MAX_FRAMES,
        }
    }
}

#[derive(Debug, Clone)]
pub enum AssistantEvent {
    State(SessionState),
    /// Live transcript of the conversation; an empty string clears it.
    Transcript(String),
    Closed { clean: bool },
}

/// Handle to a running assistant session.
pub struct AssistantSession {
    events: mpsc::Receiver<AssistantEvent>,
    level: watch::Receiver<f32>,
    stop: mpsc::Sender<()>,
}

impl AssistantSession {
    /// Acquire the microphone, connect the assistant socket, and start the
    /// session driver. The SDP offer goes out as soon as the driver runs.
    pub async fn start(config: AssistantConfig) -> Result<Self, SessionError> {
        let url = protocol::assistant_url(&config.base_url, &config.options)?;

        let cap_cfg = config.capture.clone();
        let (cap_rx, cap_handle) = tokio::task::spawn_blocking(move || start_capture(&cap_cfg))
            .await
            .map_err(|e| CaptureError::Stream(format!("capture init task failed: {}", e)))??;

        let (wire, wire_events) = WsTransport::connect(&url).await?;
        let output = PulseOutput::new(&config.capture.app_name);
        Ok(Self::start_with_parts(
            config,
            cap_rx,
            Some(cap_handle),
            output,
            wire,
            wire_events,
        ))
    }

    fn start_with_parts<W: Wire + 'static, O: AudioOutput>(
        config: AssistantConfig,
        cap_rx: mpsc::Receiver<Vec<f32>>,
        cap_handle: Option<CaptureHandle>,
        output: O,
        wire: W,
        wire_events: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        let (event_tx, events) = mpsc::channel(64);
        let (level_tx, level) = watch::channel(0.0f32);
        let (stop_tx, stop_rx) = mpsc::channel(1);

        let gate = MicGate::new();
        let (play_tx, play_events) = spawn_sequencer(output, gate.clone());

        tokio::spawn(run_assistant(
            config,
            cap_rx,
            cap_handle,
            gate,
            wire,
            wire_events,
            play_tx,
            play_events,
            event_tx,
            level_tx,
            stop_rx,
        ));

        Self {
            events,
            level,
            stop: stop_tx,
        }
    }

    pub async fn next_event(&mut self) -> Option<AssistantEvent> {
        self.events.recv().await
    }

    /// Live capture level for the UI meter.
    pub fn level(&self) -> watch::Receiver<f32> {
        self.level.clone()
    }

    /// Request an orderly stop. Safe to call more than once.
    pub async fn stop(&self) {
        let _ = self.stop.send(()).await;
    }
}

fn set_state(state: &mut SessionState, to: SessionState, events: &mpsc::Sender<AssistantEvent>) {
    match transition(state, to) {
        Ok(()) => {
            let _ = events.try_send(AssistantEvent::State(to));
        }
        Err(e) => error!("{}", e),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_assistant<W: Wire>(
    config: AssistantConfig,
    mut cap_rx: mpsc::Receiver<Vec<f32>>,
    cap_handle: Option<CaptureHandle>,
    gate: MicGate,
    mut wire: W,
    mut wire_events: mpsc::Receiver<TransportEvent>,
    play_tx: mpsc::Sender<Vec<u8>>,
    mut play_events: mpsc::Receiver<PlaybackEvent>,
    events: mpsc::Sender<AssistantEvent>,
    level_tx: watch::Sender<f32>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let mut state = SessionState::Idle;
    set_state(&mut state, SessionState::Connecting, &events);
    info!(username = %config.options.username, "assistant session connecting");

    // Offer goes out immediately on the open socket; the session counts as
    // connected once the remote answer lands.
    let mut peer = PeerSignaling::new();
    match peer.create_offer() {
        Ok(sdp) => {
            if let Err(e) = send_json(&mut wire, &SignalMessage::Offer { sdp }).await {
                warn!("failed to send offer: {}", e);
            }
        }
        Err(e) => error!("offer construction failed: {}", e),
    }

    let mut meter = LevelMeter::new();
    let mut batch = PendingBatch::new(config.max_pending_frames);
    let mut flush = tokio::time::interval_at(
        tokio::time::Instant::now() + config.flush_interval,
        config.flush_interval,
    );
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    let mut teardown = Teardown::new(cap_handle, None);
    let mut capture_live = true;
    let mut playback_live = true;

    loop {
        tokio::select! {
            chunk = cap_rx.recv(), if capture_live => match chunk {
                Some(chunk) => {
                    // The meter taps the raw stream regardless of gating.
                    let _ = level_tx.send(meter.level(&chunk));
                    if state != SessionState::Playing && gate.is_enabled() {
                        batch.push(AudioFrame::from_f32(&chunk));
                    }
                }
                None => {
                    warn!("capture stream ended");
                    capture_live = false;
                }
            },

            _ = flush.tick() => {
                if wire.is_open() {
                    if let Some(buf) = batch.flush() {
                        debug!(bytes = buf.len(), "flushing audio batch");
                        if let Err(e) = wire.send_binary(buf).await {
                            warn!("audio flush failed: {}", e);
                        }
                    }
                }
            },

            _ = ping.tick() => {
                if wire.is_open() {
                    if let Err(e) = send_json(&mut wire, &SignalMessage::Ping).await {
                        warn!("keep-alive ping failed: {}", e);
                    }
                }
            },

            ev = wire_events.recv() => match ev {
                Some(TransportEvent::Text(text)) => {
                    match serde_json::from_str::<SignalMessage>(&text) {
                        Ok(SignalMessage::Answer { sdp }) => match peer.apply_answer(&sdp) {
                            Ok(()) => {
                                info!("peer negotiation complete");
                                set_state(&mut state, SessionState::Open, &events);
                            }
                            Err(e) => warn!("ignoring answer: {}", e),
                        },
                        Ok(SignalMessage::Candidate { candidate }) => {
                            if let Err(e) = peer.add_remote_candidate(candidate) {
                                warn!("ignoring candidate: {}", e);
                            }
                        }
                        Ok(SignalMessage::Transcript { text }) => {
                            let _ = events.send(AssistantEvent::Transcript(text)).await;
                        }
                        Ok(SignalMessage::Ping) => {
                            // Keep-alive echo from the server.
                        }
                        Ok(SignalMessage::Offer { .. }) => {
                            warn!("unexpected offer from server ignored");
                        }
                        Err(e) => warn!("ignoring malformed signaling message: {}", e),
                    }
                }
                Some(TransportEvent::Binary(buf)) => {
                    if state == SessionState::Open {
                        set_state(&mut state, SessionState::Playing, &events);
                    }
                    if state == SessionState::Playing {
                        debug!(bytes = buf.len(), "speech buffer queued for playback");
                        if play_tx.send(buf).await.is_err() {
                            warn!("playback sequencer is gone, dropping speech buffer");
                        }
                    } else {
                        warn!("speech buffer before negotiation completed, dropped");
                    }
                }
                Some(TransportEvent::Closed { clean }) => {
                    if clean {
                        info!("assistant socket closed");
                    } else {
                        warn!("assistant socket closed abnormally");
                    }
                    peer.close();
                    teardown.run();
                    let to = if clean { SessionState::Closed } else { SessionState::Error };
                    set_state(&mut state, to, &events);
                    let _ = events.send(AssistantEvent::Closed { clean }).await;
                    break;
                }
                None => {
                    peer.close();
                    teardown.run();
                    set_state(&mut state, SessionState::Error, &events);
                    let _ = events.send(AssistantEvent::Closed { clean: false }).await;
                    break;
                }
            },

            play_ev = play_events.recv(), if playback_live => match play_ev {
                Some(PlaybackEvent::Drained) => {
                    // Back to listening; the live transcript is cleared.
                    let _ = events.send(AssistantEvent::Transcript(String::new())).await;
                    if state == SessionState::Playing {
                        set_state(&mut state, SessionState::Open, &events);
                    }
                }
                None => {
                    warn!("playback sequencer exited");
                    playback_live = false;
                }
            },

            _ = stop_rx.recv() => {
                set_state(&mut state, SessionState::Closing, &events);
                peer.close();
                if wire.is_open() {
                    if let Some(buf) = batch.flush() {
                        debug!(bytes = buf.len(), "final flush");
                        if let Err(e) = wire.send_binary(buf).await {
                            warn!("final flush failed: {}", e);
                        }
                    }
                    if let Err(e) = wire.close_normal("assistant stopped").await {
                        warn!("close failed: {}", e);
                    }
                } else if let Err(e) = wire.close_normal("").await {
                    warn!("close failed: {}", e);
                }
                teardown.run();
                set_state(&mut state, SessionState::Closed, &events);
                let _ = events.send(AssistantEvent::Closed { clean: true }).await;
                break;
            }
        }
    }
    info!("assistant session finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::{DecodedAudio, PlaybackError};
    use crate::transport::testing::{FakeWire, WireOp};
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    fn options() -> AssistantOptions {
        AssistantOptions {
            username: "alice".into(),
            token: "tok".into(),
            student_class: "Class 3".into(),
            accent: "British".into(),
            topic: "space".into(),
            mood: "Calm".into(),
        }
    }

    fn test_config() -> AssistantConfig {
        let mut config = AssistantConfig::new("wss://backend.test/api", options());
        // Long cadences by default; individual tests advance time as needed.
        config.flush_interval = Duration::from_secs(3);
        config.ping_interval = Duration::from_secs(2);
        config
    }

    /// Output that records plays and can hold a buffer "playing" until
    /// released, so tests control when the queue drains.
    struct GatedOutput {
        played: Arc<Mutex<Vec<usize>>>,
        release: Option<std::sync::mpsc::Receiver<()>>,
    }

    impl AudioOutput for GatedOutput {
        fn play(&mut self, audio: &DecodedAudio) -> Result<(), PlaybackError> {
            self.played.lock().unwrap().push(audio.samples.len());
            if let Some(release) = &self.release {
                let _ = release.recv();
            }
            Ok(())
        }
    }

    fn instant_output() -> (GatedOutput, Arc<Mutex<Vec<usize>>>) {
        let played = Arc::new(Mutex::new(Vec::new()));
        (
            GatedOutput {
                played: played.clone(),
                release: None,
            },
            played,
        )
    }

    fn wav(samples: usize) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..samples {
                writer.write_sample(100i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn answer_json() -> String {
        serde_json::to_string(&SignalMessage::Answer {
            sdp: "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\n".into(),
        })
        .unwrap()
    }

    async fn wait_for_state(session: &mut AssistantSession, wanted: SessionState) {
        while let Some(ev) = session.next_event().await {
            if matches!(ev, AssistantEvent::State(s) if s == wanted) {
                return;
            }
        }
        panic!("session ended before reaching {:?}", wanted);
    }

    #[tokio::test(start_paused = true)]
    async fn offer_is_sent_immediately() {
        let (wire, _inject, wire_events, ops) = FakeWire::new();
        let (_cap_tx, cap_rx) = mpsc::channel(8);
        let (output, _played) = instant_output();
        let _session = AssistantSession::start_with_parts(
            test_config(),
            cap_rx,
            None,
            output,
            wire,
            wire_events,
        );
        tokio::time::sleep(Duration::from_millis(5)).await;

        let ops = ops.lock().unwrap();
        match ops.first() {
            Some(WireOp::Text(text)) => {
                let msg: SignalMessage = serde_json::from_str(text).unwrap();
                match msg {
                    SignalMessage::Offer { sdp } => assert!(sdp.starts_with("v=0")),
                    other => panic!("expected offer, got {:?}", other),
                }
            }
            other => panic!("expected offer first, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn answer_completes_negotiation() {
        let (wire, inject, wire_events, _ops) = FakeWire::new();
        let (_cap_tx, cap_rx) = mpsc::channel(8);
        let (output, _played) = instant_output();
        let mut session = AssistantSession::start_with_parts(
            test_config(),
            cap_rx,
            None,
            output,
            wire,
            wire_events,
        );

        inject
            .send(TransportEvent::Text(answer_json()))
            .await
            .unwrap();
        wait_for_state(&mut session, SessionState::Open).await;
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_pings_on_their_own_cadence() {
        let (wire, _inject, wire_events, ops) = FakeWire::new();
        let (_cap_tx, cap_rx) = mpsc::channel(8);
        let (output, _played) = instant_output();
        let _session = AssistantSession::start_with_parts(
            test_config(),
            cap_rx,
            None,
            output,
            wire,
            wire_events,
        );

        tokio::time::sleep(Duration::from_millis(6_100)).await;

        let ops = ops.lock().unwrap();
        let pings = ops
            .iter()
            .filter(|op| matches!(op, WireOp::Text(t) if t == r#"{"type":"ping"}"#))
            .count();
        // 2 s cadence over 6.1 s: three pings, regardless of the 3 s flush.
        assert_eq!(pings, 3);
        assert!(!ops.iter().any(|op| matches!(op, WireOp::Binary(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn transcript_messages_update_and_garbage_is_ignored() {
        let (wire, inject, wire_events, _ops) = FakeWire::new();
        let (_cap_tx, cap_rx) = mpsc::channel(8);
        let (output, _played) = instant_output();
        let mut session = AssistantSession::start_with_parts(
            test_config(),
            cap_rx,
            None,
            output,
            wire,
            wire_events,
        );

        inject
            .send(TransportEvent::Text("garbage".into()))
            .await
            .unwrap();
        inject
            .send(TransportEvent::Text(
                r#"{"type":"transcript","text":"hello"}"#.into(),
            ))
            .await
            .unwrap();

        loop {
            match session.next_event().await {
                Some(AssistantEvent::Transcript(text)) => {
                    assert_eq!(text, "hello");
                    break;
                }
                Some(_) => continue,
                None => panic!("session ended unexpectedly"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn speech_buffers_play_and_session_returns_to_open() {
        let (wire, inject, wire_events, _ops) = FakeWire::new();
        let (_cap_tx, cap_rx) = mpsc::channel(8);
        let (output, played) = instant_output();
        let mut session = AssistantSession::start_with_parts(
            test_config(),
            cap_rx,
            None,
            output,
            wire,
            wire_events,
        );

        inject
            .send(TransportEvent::Text(answer_json()))
            .await
            .unwrap();
        wait_for_state(&mut session, SessionState::Open).await;

        inject
            .send(TransportEvent::Binary(wav(320)))
            .await
            .unwrap();
        wait_for_state(&mut session, SessionState::Playing).await;

        // Queue drains, transcript clears, session listens again.
        let mut cleared = false;
        loop {
            match session.next_event().await {
                Some(AssistantEvent::Transcript(t)) if t.is_empty() => cleared = true,
                Some(AssistantEvent::State(SessionState::Open)) => break,
                Some(_) => continue,
                None => panic!("session ended unexpectedly"),
            }
        }
        assert!(cleared);
        assert_eq!(*played.lock().unwrap(), vec![320]);
    }

    #[tokio::test(start_paused = true)]
    async fn capture_is_dropped_while_playing() {
        let (wire, inject, wire_events, ops) = FakeWire::new();
        let (cap_tx, cap_rx) = mpsc::channel(8);
        let played = Arc::new(Mutex::new(Vec::new()));
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let output = GatedOutput {
            played: played.clone(),
            release: Some(release_rx),
        };
        let mut session = AssistantSession::start_with_parts(
            test_config(),
            cap_rx,
            None,
            output,
            wire,
            wire_events,
        );

        inject
            .send(TransportEvent::Text(answer_json()))
            .await
            .unwrap();
        wait_for_state(&mut session, SessionState::Open).await;

        inject
            .send(TransportEvent::Binary(wav(160)))
            .await
            .unwrap();
        wait_for_state(&mut session, SessionState::Playing).await;

        // Frames captured while the assistant speaks never reach the batch.
        cap_tx.send(vec![0.3f32; 4096]).await.unwrap();
        cap_tx.send(vec![0.3f32; 4096]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        release_tx.send(()).unwrap();
        wait_for_state(&mut session, SessionState::Open).await;

        tokio::time::sleep(Duration::from_millis(3_100)).await;
        let ops = ops.lock().unwrap();
        assert!(
            !ops.iter().any(|op| matches!(op, WireOp::Binary(_))),
            "dropped frames must not be flushed: {:?}",
            *ops
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flushes_and_closes() {
        let (wire, _inject, wire_events, ops) = FakeWire::new();
        let (cap_tx, cap_rx) = mpsc::channel(8);
        let (output, _played) = instant_output();
        let mut session = AssistantSession::start_with_parts(
            test_config(),
            cap_rx,
            None,
            output,
            wire,
            wire_events,
        );

        cap_tx.send(vec![0.1f32; 4096]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        session.stop().await;

        while let Some(ev) = session.next_event().await {
            if matches!(ev, AssistantEvent::Closed { clean: true }) {
                break;
            }
        }

        let ops = ops.lock().unwrap();
        // Offer first, then the final flush, then the normal close.
        assert!(matches!(ops.first(), Some(WireOp::Text(_))));
        assert!(ops
            .iter()
            .any(|op| matches!(op, WireOp::Binary(buf) if buf.len() == 4096 * 2)));
        assert!(matches!(ops.last(), Some(WireOp::Close(_))));
    }
}
