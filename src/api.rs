//! REST boundary client
//!
//! Typed client for the backend's JSON endpoints: authentication,
//! paragraph generation, OCR upload, chat, scoring retrieval, and the
//! practice TTS audio. A bearer token is attached when present; any 401 is
//! treated uniformly as an expired session, clearing the stored
//! credentials. Requests run under a fixed long timeout and report hitting
//! it distinctly from other failures.

use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Fixed deadline for backend requests; OCR and generation can be slow.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Backend base URL, e.g. `https://backend.example/api`.
    pub base_url: String,
    pub timeout: Duration,
}

impl ApiConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            timeout: REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// The backend rejected our credentials; stored tokens are cleared and
    /// the user must sign in again.
    #[error("session expired")]
    SessionExpired,

    #[error("request timed out")]
    Timeout,

    #[error("api error {status}: {message}")]
    Status { status: u16, message: String },

    #[error("http error: {0}")]
    Http(reqwest::Error),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Http(e)
        }
    }
}

/// Access/refresh token pair issued at login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokens {
    pub access: String,
    pub refresh: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParagraphRequest {
    pub student_class: String,
    pub accent: String,
    pub topic: String,
    pub mood: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParagraphResponse {
    /// The generated practice paragraph.
    pub response: String,
    pub essay_id: String,
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Mutex<Option<Tokens>>,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            tokens: Mutex::new(None),
        })
    }

    pub fn set_tokens(&self, tokens: Tokens) {
        *self.tokens.lock().unwrap() = Some(tokens);
    }

    pub fn clear_tokens(&self) {
        *self.tokens.lock().unwrap() = None;
    }

    pub fn tokens(&self) -> Option<Tokens> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.tokens.lock().unwrap().is_some()
    }

    /// Bearer token for the audio sockets' query strings.
    pub fn access_token(&self) -> Option<String> {
        self.tokens.lock().unwrap().as_ref().map(|t| t.access.clone())
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Tokens, ApiError> {
        #[derive(Serialize)]
        struct Credentials<'a> {
            username: &'a str,
            password: &'a str,
        }

        let resp = self
            .post("/login")
            .json(&Credentials { username, password })
            .send()
            .await?;
        let tokens: Tokens = self.handle(resp).await?.json().await?;
        self.set_tokens(tokens.clone());
        info!(username, "signed in");
        Ok(tokens)
    }

    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<serde_json::Value, ApiError> {
        #[derive(Serialize)]
        struct Registration<'a> {
            email: &'a str,
            password: &'a str,
            confirm_password: &'a str,
            username: &'a str,
        }

        let resp = self
            .post("/register")
            .json(&Registration {
                email,
                password,
                confirm_password: password,
                username,
            })
            .send()
            .await?;
        Ok(self.handle(resp).await?.json().await?)
    }

    /// Sign out server-side and drop local credentials either way.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let resp = self.post("/logout").send().await;
        self.clear_tokens();
        match resp {
            Ok(resp) => {
                self.handle(resp).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn request_password_reset(&self, email: &str) -> Result<(), ApiError> {
        let resp = self
            .post("/forgot-password")
            .json(&serde_json::json!({ "email": email }))
            .send()
            .await?;
        self.handle(resp).await?;
        Ok(())
    }

    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<(), ApiError> {
        let resp = self
            .post("/reset-password")
            .json(&serde_json::json!({
                "token": token,
                "new_password": new_password,
                "confirm_password": new_password,
            }))
            .send()
            .await?;
        self.handle(resp).await?;
        Ok(())
    }

    /// Generate a practice paragraph for the given settings.
    pub async fn generate_paragraph(
        &self,
        request: &ParagraphRequest,
    ) -> Result<ParagraphResponse, ApiError> {
        let resp = self.post("/generate-prompt").json(request).send().await?;
        Ok(self.handle(resp).await?.json().await?)
    }

    /// Upload a document for OCR extraction.
    pub async fn upload_for_ocr(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<serde_json::Value, ApiError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = self.post("/upload/").multipart(form).send().await?;
        Ok(self.handle(resp).await?.json().await?)
    }

    pub async fn chat(
        &self,
        question: &str,
        subject: &str,
        curriculum: &str,
    ) -> Result<serde_json::Value, ApiError> {
        let resp = self
            .post("/chat/")
            .json(&serde_json::json!({
                "question": question,
                "subject": subject,
                "curriculum": curriculum,
            }))
            .send()
            .await?;
        Ok(self.handle(resp).await?.json().await?)
    }

    /// Retrieve the overall scoring for a finished practice stream.
    pub async fn overall_scoring(&self, essay_id: &str) -> Result<serde_json::Value, ApiError> {
        let resp = self
            .get("/overall-scoring-by-id")
            .query(&[("essay_id", essay_id)])
            .send()
            .await?;
        Ok(self.handle(resp).await?.json().await?)
    }

    /// Fetch the synthesized reading of the practice paragraph.
    pub async fn tts_audio(&self, username: &str) -> Result<Vec<u8>, ApiError> {
        let resp = self
            .get("/get-tts-audio")
            .query(&[("username", username)])
            .send()
            .await?;
        let bytes = self.handle(resp).await?.bytes().await?;
        debug!(bytes = bytes.len(), "tts audio fetched");
        Ok(bytes.to_vec())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorized(self.http.post(self.url(path)))
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorized(self.http.get(self.url(path)))
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.tokens.lock().unwrap().as_ref() {
            Some(t) => builder.header(AUTHORIZATION, format!("Bearer {}", t.access)),
            None => builder,
        }
    }

    async fn handle(&self, resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if resp.status() == StatusCode::UNAUTHORIZED {
            self.clear_tokens();
            return Err(ApiError::SessionExpired);
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| extract_message(&v))
                .unwrap_or_else(|| "request failed".to_string());
            return Err(ApiError::Status { status, message });
        }
        Ok(resp)
    }
}

/// Pull the human-readable error out of a backend error body.
fn extract_message(body: &serde_json::Value) -> Option<String> {
    body.get("detail")
        .or_else(|| body.get("message"))
        .and_then(|m| m.as_str())
        .map(String::from)
}
