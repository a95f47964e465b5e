//! Speech-to-text via the hosted Whisper API

use crate::config::OpenAiSettings;
use crate::retry::{with_backoff, RetryPolicy};
use crate::{Error, Result};

/// Response from the Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Transcribes speech to text
pub struct Transcriber {
    client: reqwest::Client,
    settings: OpenAiSettings,
    retry: RetryPolicy,
}

impl Transcriber {
    /// Create a transcriber
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(settings: OpenAiSettings) -> Result<Self> {
        if settings.api_key.is_empty() {
            return Err(Error::Config(
                "OPENAI_API_KEY required for transcription".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            settings,
            retry: RetryPolicy::default(),
        })
    }

    /// Override the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Transcribe WAV audio to text
    ///
    /// Transient API failures are retried with backoff; exhausted retries
    /// surface the last error.
    ///
    /// # Errors
    ///
    /// Returns error if transcription fails after retries
    pub async fn transcribe(&self, audio: &[u8]) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), "starting transcription");

        let text = with_backoff(&self.retry, "stt", || self.request(audio)).await?;

        tracing::info!(transcript = %text, "transcription complete");
        Ok(text)
    }

    /// One transcription round trip
    async fn request(&self, audio: &[u8]) -> Result<String> {
        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.settings.whisper_model.clone());

        let response = self
            .client
            .post(&self.settings.stt_url)
            .bearer_auth(&self.settings.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "transcription API error");
            return Err(Error::Status {
                service: "stt",
                status: status.as_u16(),
                body,
            });
        }

        let result: WhisperResponse = response.json().await?;
        Ok(result.text.trim().to_string())
    }
}
