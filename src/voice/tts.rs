//! Text-to-speech via the hosted synthesis API
//!
//! Returns MP3 bytes; repeated phrases (greetings, apologies) are served
//! from a TTL cache keyed by voice and text.

use std::time::Duration;

use mini_moka::sync::Cache;

use crate::config::OpenAiSettings;
use crate::retry::{with_backoff, RetryPolicy};
use crate::{Error, Result};

/// Cache lifetime for synthesized audio
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Cached entries cap
const CACHE_CAPACITY: u64 = 64;

/// Synthesizes speech from text
pub struct Synthesizer {
    client: reqwest::Client,
    settings: OpenAiSettings,
    retry: RetryPolicy,
    cache: Cache<String, Vec<u8>>,
}

impl Synthesizer {
    /// Create a synthesizer
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(settings: OpenAiSettings) -> Result<Self> {
        if settings.api_key.is_empty() {
            return Err(Error::Config(
                "OPENAI_API_KEY required for speech synthesis".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            settings,
            retry: RetryPolicy::default(),
            cache: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(CACHE_TTL)
                .build(),
        })
    }

    /// Override the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Synthesize text to MP3 bytes, serving repeats from the cache
    ///
    /// # Errors
    ///
    /// Returns error if synthesis fails after retries
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let key = self.cache_key(text);
        if let Some(audio) = self.cache.get(&key) {
            tracing::debug!(chars = text.len(), "synthesized audio cache hit");
            return Ok(audio);
        }

        tracing::debug!(chars = text.len(), "synthesizing speech");
        let audio = with_backoff(&self.retry, "tts", || self.request(text)).await?;

        self.cache.insert(key, audio.clone());
        Ok(audio)
    }

    /// One synthesis round trip
    async fn request(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct SpeechRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let request = SpeechRequest {
            model: &self.settings.tts_model,
            input: text,
            voice: &self.settings.tts_voice,
            speed: self.settings.tts_speed,
        };

        let response = self
            .client
            .post(&self.settings.tts_url)
            .bearer_auth(&self.settings.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "synthesis API error");
            return Err(Error::Status {
                service: "tts",
                status: status.as_u16(),
                body,
            });
        }

        let audio = response.bytes().await?;
        Ok(audio.to_vec())
    }

    /// Cache key: voice-qualified text prefix
    fn cache_key(&self, text: &str) -> String {
        let prefix: String = text.chars().take(100).collect();
        format!("{}:{prefix}", self.settings.tts_voice)
    }
}
