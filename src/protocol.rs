//! Wire protocol for the audio WebSocket endpoints
//!
//! Both pipelines speak JSON text frames for control and raw binary frames
//! for audio. The recording endpoint takes little-endian 16-bit PCM batches
//! up and sends scoring/analysis JSON down; the assistant endpoint carries
//! signaling on top of that and sends synthesized speech buffers down.

use serde::{Deserialize, Serialize};
use url::Url;

/// Control message ending a recording stream: `{"action":"end"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum RecordingControl {
    End,
}

/// An ICE candidate as exchanged with the signaling endpoint. Field names
/// follow the browser's `RTCIceCandidate` JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

/// Text messages on the assistant socket, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: IceCandidate },
    Transcript { text: String },
    Ping,
}

/// Options carried in the assistant connection's query string, mirroring
/// the settings the user picks before starting a conversation.
#[derive(Debug, Clone)]
pub struct AssistantOptions {
    pub username: String,
    pub token: String,
    pub student_class: String,
    pub accent: String,
    pub topic: String,
    pub mood: String,
}

/// Endpoint URL for the recording (practice scoring) socket.
pub fn recording_url(
    base: &str,
    username: &str,
    token: &str,
    essay_id: Option<&str>,
) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(&format!("{}/ws/audio", base.trim_end_matches('/')))?;
    {
        let mut q = url.query_pairs_mut();
        q.append_pair("username", username);
        q.append_pair("token", token);
        if let Some(id) = essay_id {
            q.append_pair("essay_id", id);
        }
    }
    Ok(url)
}

/// Endpoint URL for the voice-assistant socket.
pub fn assistant_url(base: &str, opts: &AssistantOptions) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(&format!("{}/ws/assistant", base.trim_end_matches('/')))?;
    {
        let mut q = url.query_pairs_mut();
        q.append_pair("username", &opts.username);
        q.append_pair("token", &opts.token);
        q.append_pair("student_class", &opts.student_class);
        q.append_pair("accent", &opts.accent);
        q.append_pair("topic", &opts.topic);
        q.append_pair("mood", &opts.mood);
    }
    Ok(url)
}
