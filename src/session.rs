//! Recording session for the practice flow
//!
//! One session owns the microphone stream, the pending batch, the flush
//! timer, and the scoring socket. Flushes go out every flush interval
//! while the transport is open; inbound text frames are analysis JSON
//! relayed to the caller. Stop performs a final flush, then the
//! end-of-stream control message, then a normal close, before any media
//! teardown.

use crate::batch::{PendingBatch, DEFAULT_MAX_FRAMES, FLUSH_INTERVAL};
use crate::capture::{start_capture, CaptureConfig, CaptureError, CaptureHandle};
use crate::pcm::AudioFrame;
use crate::protocol::{self, RecordingControl};
use crate::rtc::PeerSignaling;
use crate::state::{transition, SessionState};
use crate::transport::{send_json, TransportError, TransportEvent, Wire, WsTransport};
use crate::visual::LevelMeter;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct RecordingConfig {
    /// Backend base URL, e.g. `wss://backend.example/api`.
    pub base_url: String,
    pub username: String,
    pub token: String,
    /// Correlation id linking the stream to a generated essay.
    pub essay_id: Option<String>,
    pub capture: CaptureConfig,
    pub flush_interval: Duration,
    pub max_pending_frames: usize,
}

impl RecordingConfig {
    pub fn new(base_url: &str, username: &str, token: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            username: username.to_string(),
            token: token.to_string(),
            essay_id: None,
            capture: CaptureConfig::default(),
            flush_interval: FLUSH_INTERVAL,
            max_pending_frames: DEFAULT_MAX_FRAMES,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("bad endpoint url: {0}")]
    Url(#[from] url::ParseError),
}

/// Events reported to the caller over the session's lifetime.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    State(SessionState),
    /// Scoring/analysis payload from the backend, passed through as-is.
    Analysis(serde_json::Value),
    Closed { clean: bool },
}

/// Handle to a running recording session.
pub struct RecordingSession {
    events: mpsc::Receiver<SessionEvent>,
    level: watch::Receiver<f32>,
    stop: mpsc::Sender<()>,
}

impl RecordingSession {
    /// Acquire the microphone, connect the scoring socket, and start the
    /// session driver. Permission and connection failures surface here and
    /// abort the start.
    pub async fn start(config: RecordingConfig) -> Result<Self, SessionError> {
        let url = protocol::recording_url(
            &config.base_url,
            &config.username,
            &config.token,
            config.essay_id.as_deref(),
        )?;

        let cap_cfg = config.capture.clone();
        let (cap_rx, cap_handle) = tokio::task::spawn_blocking(move || start_capture(&cap_cfg))
            .await
            .map_err(|e| CaptureError::Stream(format!("capture init task failed: {}", e)))??;

        let (wire, wire_events) = WsTransport::connect(&url).await?;
        Ok(Self::start_with_parts(
            config,
            cap_rx,
            Some(cap_handle),
            wire,
            wire_events,
        ))
    }

    fn start_with_parts<W: Wire + 'static>(
        config: RecordingConfig,
        cap_rx: mpsc::Receiver<Vec<f32>>,
        cap_handle: Option<CaptureHandle>,
        wire: W,
        wire_events: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        let (event_tx, events) = mpsc::channel(64);
        let (level_tx, level) = watch::channel(0.0f32);
        let (stop_tx, stop_rx) = mpsc::channel(1);

        tokio::spawn(run_recording(
            config,
            cap_rx,
            cap_handle,
            wire,
            wire_events,
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

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Live capture level for a UI meter.
    pub fn level(&self) -> watch::Receiver<f32> {
        self.level.clone()
    }

    /// Request an orderly stop. Safe to call more than once; repeats after
    /// the driver has exited are ignored.
    pub async fn stop(&self) {
        let _ = self.stop.send(()).await;
    }
}

/// Releases session resources in teardown order. Running it a second time
/// is a no-op, so the stop path and the socket-close path can both invoke
/// it safely.
pub(crate) struct Teardown {
    capture: Option<CaptureHandle>,
    peer: Option<PeerSignaling>,
    done: bool,
}

impl Teardown {
    pub(crate) fn new(capture: Option<CaptureHandle>, peer: Option<PeerSignaling>) -> Self {
        Self {
            capture,
            peer,
            done: false,
        }
    }

    pub(crate) fn run(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(mut peer) = self.peer.take() {
            peer.close();
        }
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        debug!("session resources released");
    }
}

fn set_state(state: &mut SessionState, to: SessionState, events: &mpsc::Sender<SessionEvent>) {
    match transition(state, to) {
        Ok(()) => {
            let _ = events.try_send(SessionEvent::State(to));
        }
        Err(e) => error!("{}", e),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_recording<W: Wire>(
    config: RecordingConfig,
    mut cap_rx: mpsc::Receiver<Vec<f32>>,
    cap_handle: Option<CaptureHandle>,
    mut wire: W,
    mut wire_events: mpsc::Receiver<TransportEvent>,
    events: mpsc::Sender<SessionEvent>,
    level_tx: watch::Sender<f32>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let mut state = SessionState::Idle;
    set_state(&mut state, SessionState::Connecting, &events);
    set_state(&mut state, SessionState::Open, &events);
    info!(username = %config.username, "recording session open");

    let mut meter = LevelMeter::new();
    let mut batch = PendingBatch::new(config.max_pending_frames);
    // First flush one full interval from now, not immediately.
    let mut flush = tokio::time::interval_at(
        tokio::time::Instant::now() + config.flush_interval,
        config.flush_interval,
    );
    let mut teardown = Teardown::new(cap_handle, None);
    let mut capture_live = true;

    loop {
        tokio::select! {
            chunk = cap_rx.recv(), if capture_live => match chunk {
                Some(chunk) => {
                    let _ = level_tx.send(meter.level(&chunk));
                    batch.push(AudioFrame::from_f32(&chunk));
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

            ev = wire_events.recv() => match ev {
                Some(TransportEvent::Text(text)) => {
                    match serde_json::from_str::<serde_json::Value>(&text) {
                        Ok(value) => {
                            debug!("analysis message received");
                            let _ = events.send(SessionEvent::Analysis(value)).await;
                        }
                        Err(e) => warn!("ignoring malformed analysis message: {}", e),
                    }
                }
                Some(TransportEvent::Binary(bytes)) => {
                    debug!(bytes = bytes.len(), "unexpected binary frame on scoring socket");
                }
                Some(TransportEvent::Closed { clean }) => {
                    if clean {
                        info!("scoring socket closed");
                    } else {
                        warn!("scoring socket closed abnormally");
                    }
                    teardown.run();
                    let to = if clean { SessionState::Closed } else { SessionState::Error };
                    set_state(&mut state, to, &events);
                    let _ = events.send(SessionEvent::Closed { clean }).await;
                    break;
                }
                None => {
                    teardown.run();
                    set_state(&mut state, SessionState::Error, &events);
                    let _ = events.send(SessionEvent::Closed { clean: false }).await;
                    break;
                }
            },

            _ = stop_rx.recv() => {
                set_state(&mut state, SessionState::Closing, &events);
                if wire.is_open() {
                    // Final flush, then end-of-stream, then normal close,
                    // all before media teardown.
                    if let Some(buf) = batch.flush() {
                        debug!(bytes = buf.len(), "final flush");
                        if let Err(e) = wire.send_binary(buf).await {
                            warn!("final flush failed: {}", e);
                        }
                    }
                    if let Err(e) = send_json(&mut wire, &RecordingControl::End).await {
                        warn!("end-of-stream message failed: {}", e);
                    }
                    if let Err(e) = wire.close_normal("recording complete").await {
                        warn!("close failed: {}", e);
                    }
                } else if let Err(e) = wire.close_normal("").await {
                    warn!("close failed: {}", e);
                }
                teardown.run();
                set_state(&mut state, SessionState::Closed, &events);
                let _ = events.send(SessionEvent::Closed { clean: true }).await;
                break;
            }
        }
    }
    info!("recording session finished");
}
