//! Configuration management for the murmur daemon
//!
//! All settings come from environment variables with sensible defaults. The
//! resulting [`Settings`] object is constructed once at startup and handed to
//! each component's constructor; nothing reads the environment after that.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Default chat-completions endpoint
const DEFAULT_LLM_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Default transcription endpoint
const DEFAULT_STT_URL: &str = "https://api.openai.com/v1/audio/transcriptions";

/// Default speech-synthesis endpoint
const DEFAULT_TTS_URL: &str = "https://api.openai.com/v1/audio/speech";

/// Top-level daemon configuration
#[derive(Debug, Clone)]
pub struct Settings {
    /// Hosted AI service configuration
    pub openai: OpenAiSettings,

    /// Microphone and silence-detection configuration
    pub audio: AudioSettings,

    /// Conversation memory configuration
    pub context: ContextSettings,

    /// Wake-phrase gating configuration
    pub wake: WakeSettings,

    /// Language-model prompting configuration
    pub nlu: NluSettings,

    /// HTTP API server port
    pub api_port: u16,

    /// Feature toggles
    pub features: FeatureToggles,

    /// Log filter directive (e.g. "info", "murmur=debug")
    pub log_level: String,
}

/// Hosted AI service configuration (OpenAI-compatible endpoints)
#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    /// API key, required for all hosted calls
    pub api_key: String,

    /// Chat-completions endpoint URL
    pub llm_url: String,

    /// Chat model identifier
    pub llm_model: String,

    /// Transcription endpoint URL
    pub stt_url: String,

    /// Whisper model identifier
    pub whisper_model: String,

    /// Synthesis endpoint URL
    pub tts_url: String,

    /// TTS model identifier
    pub tts_model: String,

    /// TTS voice identifier
    pub tts_voice: String,

    /// TTS speed multiplier (0.25 to 4.0)
    pub tts_speed: f32,
}

/// Microphone and silence-detection configuration
#[derive(Debug, Clone)]
pub struct AudioSettings {
    /// Capture sample rate in Hz
    pub sample_rate: u32,

    /// Capture chunk size in samples
    pub chunk_size: usize,

    /// RMS energy below which a chunk counts as silence
    pub silence_threshold: f32,

    /// Trailing silence that ends an utterance
    pub silence_duration: Duration,

    /// Hard wall-clock bound on a single listen
    pub listen_timeout: Duration,
}

/// Conversation memory configuration
#[derive(Debug, Clone)]
pub struct ContextSettings {
    /// Messages included in the prompt window
    pub max_context_messages: usize,

    /// Hours of history retained before trimming
    pub retention_hours: i64,

    /// Whether history and preferences are mirrored to disk
    pub persistent: bool,

    /// Path to the SQLite store
    pub db_path: PathBuf,
}

/// Wake-phrase gating configuration
#[derive(Debug, Clone)]
pub struct WakeSettings {
    /// Whether capture is gated on the wake phrase
    pub enabled: bool,

    /// The phrase that activates the assistant
    pub phrase: String,
}

/// Language-model prompting configuration
#[derive(Debug, Clone)]
pub struct NluSettings {
    /// Sampling temperature
    pub temperature: f32,

    /// Response token cap
    pub max_tokens: u32,

    /// System prompt override; None uses the built-in prompt
    pub system_prompt: Option<String>,
}

/// Feature toggles for optional subsystems
#[derive(Debug, Clone, Default)]
pub struct FeatureToggles {
    /// Environmental sensor integration (not implemented; reserved)
    pub sensors: bool,

    /// Spatial audio output (not implemented; reserved)
    pub spatial_audio: bool,
}

impl Settings {
    /// Load settings from the environment
    ///
    /// # Errors
    ///
    /// Returns error if a variable fails to parse or validation fails
    pub fn from_env() -> Result<Self> {
        let settings = Self {
            openai: OpenAiSettings {
                api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
                llm_url: env_or("MURMUR_LLM_URL", DEFAULT_LLM_URL),
                llm_model: env_or("MURMUR_LLM_MODEL", "gpt-4o-mini"),
                stt_url: env_or("MURMUR_STT_URL", DEFAULT_STT_URL),
                whisper_model: env_or("MURMUR_STT_MODEL", "whisper-1"),
                tts_url: env_or("MURMUR_TTS_URL", DEFAULT_TTS_URL),
                tts_model: env_or("MURMUR_TTS_MODEL", "tts-1"),
                tts_voice: env_or("MURMUR_TTS_VOICE", "alloy"),
                tts_speed: env_parse("MURMUR_TTS_SPEED", 1.0)?,
            },
            audio: AudioSettings {
                sample_rate: env_parse("MURMUR_SAMPLE_RATE", 16_000)?,
                chunk_size: env_parse("MURMUR_CHUNK_SIZE", 1024)?,
                silence_threshold: env_parse("MURMUR_SILENCE_THRESHOLD", 0.015)?,
                silence_duration: Duration::from_secs_f64(env_parse(
                    "MURMUR_SILENCE_DURATION",
                    2.0,
                )?),
                listen_timeout: Duration::from_secs_f64(env_parse(
                    "MURMUR_LISTEN_TIMEOUT",
                    30.0,
                )?),
            },
            context: ContextSettings {
                max_context_messages: env_parse("MURMUR_CONTEXT_MESSAGES", 10)?,
                retention_hours: env_parse("MURMUR_RETENTION_HOURS", 24)?,
                persistent: env_bool("MURMUR_PERSISTENT_MEMORY", true),
                db_path: std::env::var("MURMUR_DB_PATH")
                    .map_or_else(|_| default_db_path(), PathBuf::from),
            },
            wake: WakeSettings {
                enabled: env_bool("MURMUR_WAKE_WORD_ENABLED", true),
                phrase: env_or("MURMUR_WAKE_WORD", "hey murmur"),
            },
            nlu: NluSettings {
                temperature: env_parse("MURMUR_NLU_TEMPERATURE", 0.7)?,
                max_tokens: env_parse("MURMUR_NLU_MAX_TOKENS", 500)?,
                system_prompt: std::env::var("MURMUR_SYSTEM_PROMPT").ok(),
            },
            api_port: env_parse("MURMUR_PORT", 8080)?,
            features: FeatureToggles {
                sensors: env_bool("MURMUR_ENABLE_SENSORS", false),
                spatial_audio: env_bool("MURMUR_ENABLE_SPATIAL_AUDIO", false),
            },
            log_level: env_or("MURMUR_LOG_LEVEL", "info"),
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Validate cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns error if any value is out of its supported range
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate < 8_000 || self.audio.sample_rate > 48_000 {
            return Err(Error::Config(format!(
                "sample rate {} outside supported range 8000..=48000",
                self.audio.sample_rate
            )));
        }
        if !(0.25..=4.0).contains(&self.openai.tts_speed) {
            return Err(Error::Config(format!(
                "TTS speed {} outside supported range 0.25..=4.0",
                self.openai.tts_speed
            )));
        }
        if !(0.0..=2.0).contains(&self.nlu.temperature) {
            return Err(Error::Config(format!(
                "NLU temperature {} outside supported range 0.0..=2.0",
                self.nlu.temperature
            )));
        }
        if self.context.max_context_messages == 0 {
            return Err(Error::Config(
                "context window must hold at least one message".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings suitable for tests: in-memory context, no wake word,
    /// placeholder credentials
    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            openai: OpenAiSettings {
                api_key: "test-key".to_string(),
                llm_url: DEFAULT_LLM_URL.to_string(),
                llm_model: "gpt-4o-mini".to_string(),
                stt_url: DEFAULT_STT_URL.to_string(),
                whisper_model: "whisper-1".to_string(),
                tts_url: DEFAULT_TTS_URL.to_string(),
                tts_model: "tts-1".to_string(),
                tts_voice: "alloy".to_string(),
                tts_speed: 1.0,
            },
            audio: AudioSettings {
                sample_rate: 16_000,
                chunk_size: 1024,
                silence_threshold: 0.015,
                silence_duration: Duration::from_millis(200),
                listen_timeout: Duration::from_millis(500),
            },
            context: ContextSettings {
                max_context_messages: 10,
                retention_hours: 24,
                persistent: false,
                db_path: PathBuf::from(":memory:"),
            },
            wake: WakeSettings {
                enabled: false,
                phrase: "hey murmur".to_string(),
            },
            nlu: NluSettings {
                temperature: 0.7,
                max_tokens: 500,
                system_prompt: None,
            },
            api_port: 0,
            features: FeatureToggles::default(),
            log_level: "debug".to_string(),
        }
    }
}

/// Default database location under the platform data directory
fn default_db_path() -> PathBuf {
    directories::ProjectDirs::from("dev", "murmur", "murmur").map_or_else(
        || PathBuf::from("./data/context.db"),
        |dirs| dirs.data_dir().join("context.db"),
    )
}

/// Read an env var with a string default
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read a boolean env var ("true"/"1" are truthy)
fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).map_or(default, |v| {
        matches!(v.to_lowercase().as_str(), "true" | "1" | "yes")
    })
}

/// Read and parse an env var, falling back to a default when unset
fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("invalid {key}: {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let settings = Settings::for_tests();
        settings.validate().unwrap();
    }

    #[test]
    fn test_sample_rate_bounds() {
        let mut settings = Settings::for_tests();
        settings.audio.sample_rate = 4_000;
        assert!(settings.validate().is_err());

        settings.audio.sample_rate = 48_000;
        settings.validate().unwrap();
    }

    #[test]
    fn test_tts_speed_bounds() {
        let mut settings = Settings::for_tests();
        settings.openai.tts_speed = 5.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_empty_context_window_rejected() {
        let mut settings = Settings::for_tests();
        settings.context.max_context_messages = 0;
        assert!(settings.validate().is_err());
    }
}
