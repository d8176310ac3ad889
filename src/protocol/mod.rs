//! Two-stage remote transcription protocol client.
//!
//! Stage 1 uploads the recording as `multipart/form-data` to a
//! speech-to-text endpoint and extracts the raw transcript. Stage 2
//! optionally pushes that transcript through a chat-completion endpoint with
//! a system instruction to clean it up for the journal. The client is
//! stateless; every call validates, uploads and parses from scratch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Hard upload limit; larger recordings are rejected before any network call.
pub const MAX_UPLOAD_BYTES: u64 = 25 * 1024 * 1024;

pub const DEFAULT_TRANSCRIPTION_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
pub const DEFAULT_REFINEMENT_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";
pub const DEFAULT_REFINEMENT_MODEL: &str = "gpt-4o-mini";

/// Errors produced by the transcription protocol.
///
/// Transport failures (timeout, DNS, connection loss) are reported as
/// `Network` separately from credential/config problems (`ApiError`), so the
/// queue can retry the former and drop jobs on the latter.
#[derive(Error, Debug)]
pub enum TranscribeError {
    #[error("invalid endpoint URL: {0}")]
    InvalidEndpoint(String),

    #[error("response could not be decoded")]
    InvalidResponse,

    #[error("network error: {0}")]
    Network(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("server returned status {0}")]
    ServerError(u16),

    #[error("server returned an empty body")]
    NoData,

    #[error("failed to parse server response")]
    ParsingFailed,

    #[error("file error: {0}")]
    FileError(String),
}

impl TranscribeError {
    /// Whether a later retry could plausibly succeed without intervention.
    ///
    /// Transport and non-auth server trouble is transient; bad input or bad
    /// credentials would fail identically next time. Auth statuses (401/403)
    /// and bad-request 4xx are dropped, 408/429 and 5xx are retried.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Network(_) | Self::InvalidResponse | Self::NoData | Self::ParsingFailed => true,
            Self::ServerError(status) => match status {
                401 | 403 => false,
                408 | 429 => true,
                s if *s >= 500 => true,
                _ => false,
            },
            Self::InvalidEndpoint(_) | Self::ApiError(_) | Self::FileError(_) => false,
        }
    }
}

fn map_transport(err: reqwest::Error) -> TranscribeError {
    if err.is_builder() {
        TranscribeError::InvalidEndpoint(err.to_string())
    } else if err.is_decode() {
        TranscribeError::InvalidResponse
    } else {
        TranscribeError::Network(err.to_string())
    }
}

/// Human-readable milestones reported through the progress callback.
///
/// Purely observational; skipping or dropping them has no effect on the
/// transcription itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptionPhase {
    Preparing,
    Uploading,
    Received,
    Refining,
    Complete,
}

impl std::fmt::Display for TranscriptionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preparing => write!(f, "preparing recording"),
            Self::Uploading => write!(f, "uploading audio"),
            Self::Received => write!(f, "transcript received"),
            Self::Refining => write!(f, "refining transcript"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(TranscriptionPhase) + Send + Sync>;

/// One transcription job handed to the client.
#[derive(Clone)]
pub struct TranscriptionRequest {
    /// Audio file to transcribe
    pub recording: PathBuf,
    /// Run the stage-2 refinement pass
    pub requires_refinement: bool,
    /// System instruction for the refinement pass
    pub refinement_prompt: String,
    /// Optional seed prompt for the speech-to-text model
    pub prompt: Option<String>,
    /// Optional progress observer
    pub on_progress: Option<ProgressCallback>,
}

impl TranscriptionRequest {
    pub fn new(recording: impl Into<PathBuf>) -> Self {
        Self {
            recording: recording.into(),
            requires_refinement: false,
            refinement_prompt: String::new(),
            prompt: None,
            on_progress: None,
        }
    }

    /// Enable the stage-2 refinement pass with the given system instruction.
    pub fn with_refinement(mut self, prompt: impl Into<String>) -> Self {
        self.requires_refinement = true;
        self.refinement_prompt = prompt.into();
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    fn report(&self, phase: TranscriptionPhase) {
        debug!(recording = %self.recording.display(), %phase, "transcription progress");
        if let Some(callback) = &self.on_progress {
            callback(phase);
        }
    }
}

/// Finished transcription output; immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionResult {
    /// Raw stage-1 transcript, present only when refinement ran
    pub original: Option<String>,
    /// Refined text, or the stage-1 transcript when refinement was skipped
    pub final_text: String,
    /// Timestamp when the result was produced
    pub created_at: DateTime<Utc>,
}

impl TranscriptionResult {
    /// Result of a stage-1-only transcription.
    pub fn raw(text: impl Into<String>) -> Self {
        Self {
            original: None,
            final_text: text.into(),
            created_at: Utc::now(),
        }
    }

    /// Result of a full two-stage transcription.
    pub fn refined(original: impl Into<String>, final_text: impl Into<String>) -> Self {
        Self {
            original: Some(original.into()),
            final_text: final_text.into(),
            created_at: Utc::now(),
        }
    }
}

/// Anything that can turn a recording into text. Implemented by
/// [`TranscriptionClient`]; tests substitute scripted fakes.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        request: TranscriptionRequest,
    ) -> Result<TranscriptionResult, TranscribeError>;
}

/// Configuration for the protocol client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bearer credential for both endpoints
    pub api_key: String,
    pub transcription_url: String,
    pub refinement_url: String,
    pub transcription_model: String,
    pub refinement_model: String,
    /// Hard upload size limit in bytes
    pub max_upload_bytes: u64,
    /// Stage-1 timeout; generous because audio uploads can be large
    pub transcription_timeout: Duration,
    /// Stage-2 timeout
    pub refinement_timeout: Duration,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            transcription_url: DEFAULT_TRANSCRIPTION_URL.to_string(),
            refinement_url: DEFAULT_REFINEMENT_URL.to_string(),
            transcription_model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
            refinement_model: DEFAULT_REFINEMENT_MODEL.to_string(),
            max_upload_bytes: MAX_UPLOAD_BYTES,
            transcription_timeout: Duration::from_secs(300),
            refinement_timeout: Duration::from_secs(180),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SpeechToTextResponse {
    text: String,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

/// Stateless client for the two remote transcription calls.
pub struct TranscriptionClient {
    config: ClientConfig,
    http: reqwest::Client,
}

impl TranscriptionClient {
    pub fn new(config: ClientConfig) -> Self {
        // Timeouts are set per request; stage 1 and stage 2 differ.
        let http = reqwest::Client::builder()
            .user_agent(format!("{}/{}", crate::NAME, crate::VERSION))
            .build()
            .expect("Failed to create HTTP client");

        Self { config, http }
    }

    /// Run the full two-stage protocol for one recording.
    pub async fn transcribe(
        &self,
        request: TranscriptionRequest,
    ) -> Result<TranscriptionResult, TranscribeError> {
        request.report(TranscriptionPhase::Preparing);
        self.validate_recording(&request.recording).await?;

        if self.config.api_key.trim().is_empty() {
            return Err(TranscribeError::ApiError(
                "no API key configured".to_string(),
            ));
        }

        request.report(TranscriptionPhase::Uploading);
        let raw = self.speech_to_text(&request).await?;
        request.report(TranscriptionPhase::Received);

        if !request.requires_refinement {
            request.report(TranscriptionPhase::Complete);
            return Ok(TranscriptionResult::raw(raw));
        }

        request.report(TranscriptionPhase::Refining);
        let refined = self.refine(&raw, &request.refinement_prompt).await?;
        request.report(TranscriptionPhase::Complete);
        Ok(TranscriptionResult::refined(raw, refined))
    }

    async fn validate_recording(&self, recording: &Path) -> Result<(), TranscribeError> {
        let meta = tokio::fs::metadata(recording).await.map_err(|_| {
            TranscribeError::FileError(format!("recording not found: {}", recording.display()))
        })?;

        if meta.len() == 0 {
            warn!(recording = %recording.display(), "recording is empty, attempting anyway");
        }
        if meta.len() > self.config.max_upload_bytes {
            return Err(TranscribeError::FileError(format!(
                "recording is {} bytes, over the {} byte upload limit",
                meta.len(),
                self.config.max_upload_bytes
            )));
        }
        Ok(())
    }

    async fn speech_to_text(&self, request: &TranscriptionRequest) -> Result<String, TranscribeError> {
        let audio = tokio::fs::read(&request.recording).await.map_err(|err| {
            TranscribeError::FileError(format!(
                "failed to read {}: {}",
                request.recording.display(),
                err
            ))
        })?;

        let file_name = request
            .recording
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "recording".to_string());
        let content_type = mime_for_extension(&request.recording);

        let audio_part = multipart::Part::bytes(audio)
            .file_name(file_name)
            .mime_str(content_type)
            .map_err(|err| TranscribeError::FileError(err.to_string()))?;

        let mut form = multipart::Form::new()
            .text("model", self.config.transcription_model.clone())
            .part("file", audio_part);
        if let Some(prompt) = &request.prompt {
            form = form.text("prompt", prompt.clone());
        }

        let response = self
            .http
            .post(&self.config.transcription_url)
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .timeout(self.config.transcription_timeout)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TranscribeError::ServerError(status.as_u16()));
        }

        let body = response.text().await.map_err(map_transport)?;
        if body.is_empty() {
            return Err(TranscribeError::NoData);
        }

        let parsed: SpeechToTextResponse =
            serde_json::from_str(&body).map_err(|_| TranscribeError::ParsingFailed)?;
        Ok(parsed.text)
    }

    async fn refine(&self, transcript: &str, prompt: &str) -> Result<String, TranscribeError> {
        let body = ChatRequest {
            model: self.config.refinement_model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: prompt.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: transcript.to_string(),
                },
            ],
        };

        let response = self
            .http
            .post(&self.config.refinement_url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .timeout(self.config.refinement_timeout)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TranscribeError::ServerError(status.as_u16()));
        }

        let body = response.text().await.map_err(map_transport)?;
        if body.is_empty() {
            return Err(TranscribeError::NoData);
        }

        let parsed: ChatResponse =
            serde_json::from_str(&body).map_err(|_| TranscribeError::ParsingFailed)?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or(TranscribeError::ParsingFailed)
    }
}

#[async_trait]
impl Transcriber for TranscriptionClient {
    async fn transcribe(
        &self,
        request: TranscriptionRequest,
    ) -> Result<TranscriptionResult, TranscribeError> {
        TranscriptionClient::transcribe(self, request).await
    }
}

/// Content type for the multipart file part, derived from the extension.
fn mime_for_extension(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("m4a") => "audio/m4a",
        Some("mp4") => "audio/mp4",
        Some("mp3") | Some("mpga") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("flac") => "audio/flac",
        Some("ogg") | Some("oga") => "audio/ogg",
        Some("webm") => "audio/webm",
        Some("aac") => "audio/aac",
        _ => "audio/mpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn test_client(api_key: &str) -> TranscriptionClient {
        let mut config = ClientConfig::new(api_key);
        // Unroutable endpoints: any network attempt would surface as a
        // Network error, which the assertions below would catch.
        config.transcription_url = "http://127.0.0.1:9/v1/audio/transcriptions".to_string();
        config.refinement_url = "http://127.0.0.1:9/v1/chat/completions".to_string();
        TranscriptionClient::new(config)
    }

    #[test]
    fn test_mime_for_extension() {
        assert_eq!(mime_for_extension(Path::new("a.m4a")), "audio/m4a");
        assert_eq!(mime_for_extension(Path::new("a.MP3")), "audio/mpeg");
        assert_eq!(mime_for_extension(Path::new("a.wav")), "audio/wav");
        assert_eq!(mime_for_extension(Path::new("a.ogg")), "audio/ogg");
        assert_eq!(mime_for_extension(Path::new("mystery")), "audio/mpeg");
    }

    #[test]
    fn test_recoverability_classification() {
        assert!(TranscribeError::Network("timeout".into()).is_recoverable());
        assert!(TranscribeError::InvalidResponse.is_recoverable());
        assert!(TranscribeError::NoData.is_recoverable());
        assert!(TranscribeError::ParsingFailed.is_recoverable());
        assert!(TranscribeError::ServerError(500).is_recoverable());
        assert!(TranscribeError::ServerError(429).is_recoverable());
        assert!(TranscribeError::ServerError(408).is_recoverable());

        assert!(!TranscribeError::ServerError(401).is_recoverable());
        assert!(!TranscribeError::ServerError(403).is_recoverable());
        assert!(!TranscribeError::ServerError(400).is_recoverable());
        assert!(!TranscribeError::ApiError("no key".into()).is_recoverable());
        assert!(!TranscribeError::FileError("missing".into()).is_recoverable());
        assert!(!TranscribeError::InvalidEndpoint("bad".into()).is_recoverable());
    }

    #[tokio::test]
    async fn test_missing_file_is_rejected() {
        let client = test_client("sk-test");
        let request = TranscriptionRequest::new("/nonexistent/recording.m4a");

        let err = client.transcribe(request).await.unwrap_err();
        assert!(matches!(err, TranscribeError::FileError(_)));
    }

    #[tokio::test]
    async fn test_oversized_file_is_rejected_before_upload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("huge.m4a");
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(MAX_UPLOAD_BYTES + 1).unwrap();

        let client = test_client("sk-test");
        let progress_calls = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&progress_calls);
        let request = TranscriptionRequest::new(&path).with_progress(Arc::new(move |phase| {
            // Only the preparing milestone may fire before rejection.
            assert_eq!(phase, TranscriptionPhase::Preparing);
            calls.fetch_add(1, Ordering::SeqCst);
        }));

        let err = client.transcribe(request).await.unwrap_err();
        assert!(matches!(err, TranscribeError::FileError(_)));
        assert_eq!(progress_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_api_key_is_rejected_before_upload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("note.m4a");
        std::fs::write(&path, b"fake audio").unwrap();

        let client = test_client("   ");
        let err = client
            .transcribe(TranscriptionRequest::new(&path))
            .await
            .unwrap_err();
        // ApiError, not Network: the credential check must run first.
        assert!(matches!(err, TranscribeError::ApiError(_)));
    }

    #[test]
    fn test_result_constructors() {
        let raw = TranscriptionResult::raw("hello");
        assert_eq!(raw.final_text, "hello");
        assert!(raw.original.is_none());

        let refined = TranscriptionResult::refined("helo", "hello");
        assert_eq!(refined.final_text, "hello");
        assert_eq!(refined.original.as_deref(), Some("helo"));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(TranscriptionPhase::Uploading.to_string(), "uploading audio");
        assert_eq!(TranscriptionPhase::Complete.to_string(), "complete");
    }
}
