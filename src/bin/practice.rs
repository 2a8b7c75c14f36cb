//! Practice flow demo
//!
//! Signs in, generates a practice paragraph, streams the microphone to the
//! scoring service until Ctrl-C, then fetches the overall results.

use anyhow::Context;
use lingolive::api::{ApiClient, ApiConfig, ParagraphRequest};
use lingolive::session::{RecordingConfig, RecordingSession, SessionEvent};
use tracing::info;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let api_base = env_or("LINGOLIVE_API_URL", "https://llm.edusmartai.com/api");
    let ws_base = env_or("LINGOLIVE_WS_URL", "wss://llm.edusmartai.com/api");
    let username =
        std::env::var("LINGOLIVE_USERNAME").context("LINGOLIVE_USERNAME is not set")?;
    let password =
        std::env::var("LINGOLIVE_PASSWORD").context("LINGOLIVE_PASSWORD is not set")?;

    let api = ApiClient::new(ApiConfig::new(&api_base))?;
    let tokens = api.login(&username, &password).await?;

    let paragraph = api
        .generate_paragraph(&ParagraphRequest {
            student_class: env_or("LINGOLIVE_CLASS", "Class 5"),
            accent: env_or("LINGOLIVE_ACCENT", "American"),
            topic: env_or("LINGOLIVE_TOPIC", "daily life"),
            mood: env_or("LINGOLIVE_MOOD", "Neutral"),
        })
        .await?;
    println!("Read this paragraph aloud:\n\n{}\n", paragraph.response);

    let mut config = RecordingConfig::new(&ws_base, &username, &tokens.access);
    config.essay_id = Some(paragraph.essay_id.clone());
    let mut session = RecordingSession::start(config).await?;
    println!("Recording... Ctrl-C to finish.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("finishing...");
                session.stop().await;
            }
            ev = session.next_event() => match ev {
                Some(SessionEvent::Analysis(value)) => {
                    println!("analysis: {}", value);
                }
                Some(SessionEvent::State(state)) => {
                    info!("session state: {}", state.as_str());
                }
                Some(SessionEvent::Closed { clean }) => {
                    info!(clean, "session closed");
                    break;
                }
                None => break,
            }
        }
    }

    let scoring = api.overall_scoring(&paragraph.essay_id).await?;
    println!("overall scoring:\n{}", serde_json::to_string_pretty(&scoring)?);
    Ok(())
}
