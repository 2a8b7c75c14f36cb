//! lingolive - voice client for the language-learning backend
//!
//! Client-side pipelines for the speaking-practice product: a recording
//! session that streams microphone PCM to the scoring service, a voice
//! assistant session that adds peer negotiation and synthesized speech
//! playback, and the REST client the surrounding flows use. The binary
//! runs the assistant against a live backend.

#![forbid(unsafe_code)]

/// REST boundary client
pub mod api;
/// Voice-assistant session
pub mod assistant;
/// Pending-batch accumulation for outbound audio
pub mod batch;
/// Microphone capture
pub mod capture;
/// PCM framing
pub mod pcm;
/// Playback sequencing for synthesized speech
pub mod playback;
/// Wire protocol for the audio WebSocket endpoints
pub mod protocol;
/// Signaling-side peer model
pub mod rtc;
/// Recording session for the practice flow
pub mod session;
/// Session lifecycle state machine
pub mod state;
/// WebSocket transport
pub mod transport;
/// Capture level metering
pub mod visual;

use anyhow::Context;
use assistant::{AssistantConfig, AssistantEvent, AssistantSession};
use protocol::AssistantOptions;
use tracing::info;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let base_url = env_or("LINGOLIVE_WS_URL", "wss://llm.edusmartai.com/api");
    let username =
        std::env::var("LINGOLIVE_USERNAME").context("LINGOLIVE_USERNAME is not set")?;
    let token = std::env::var("LINGOLIVE_TOKEN").context("LINGOLIVE_TOKEN is not set")?;

    let options = AssistantOptions {
        username,
        token,
        student_class: env_or("LINGOLIVE_CLASS", "Class 1"),
        accent: env_or("LINGOLIVE_ACCENT", "American"),
        topic: env_or("LINGOLIVE_TOPIC", ""),
        mood: env_or("LINGOLIVE_MOOD", "Neutral"),
    };

    info!("starting assistant session");
    let mut session = AssistantSession::start(AssistantConfig::new(&base_url, options)).await?;
    println!("Assistant running. Ctrl-C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("stopping...");
                session.stop().await;
            }
            ev = session.next_event() => match ev {
                Some(AssistantEvent::State(state)) => {
                    info!("session state: {}", state.as_str());
                }
                Some(AssistantEvent::Transcript(text)) => {
                    if !text.is_empty() {
                        println!("assistant: {}", text);
                    }
                }
                Some(AssistantEvent::Closed { clean }) => {
                    info!(clean, "session closed");
                    break;
                }
                None => break,
            }
        }
    }

    Ok(())
}
