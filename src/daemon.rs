//! The murmur daemon
//!
//! Wires voice capture, wake-phrase gating, STT, understanding, action
//! dispatch, TTS, and playback into a single control loop, and serves the
//! health/metrics API alongside it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::actions::{ActionExecutor, ActionResult};
use crate::api::{self, metrics, ApiState, Stage};
use crate::config::Settings;
use crate::context::{ContextManager, Role};
use crate::nlu::NluCore;
use crate::state::{StateMachine, SystemState, TurnEvent};
use crate::store::{self, DbPool};
use crate::voice::{
    samples_to_wav, AudioCapture, AudioPlayback, Chime, Synthesizer, Transcriber,
    WakeWordDetector,
};
use crate::{Error, Result};

/// Poll interval for the wake-gating loop
const WAKE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pause after a failed turn before listening again
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Spoken when a turn fails non-fatally
const APOLOGY: &str = "I'm sorry, I ran into a problem. Please try again.";

/// Spoken once at startup
const GREETING: &str = "Hello! Murmur is listening.";

/// Voice pipeline components, absent in text-only mode
struct VoicePipeline {
    capture: AudioCapture,
    playback: AudioPlayback,
    transcriber: Transcriber,
    synthesizer: Synthesizer,
    wake: WakeWordDetector,
}

/// The murmur daemon
pub struct Daemon {
    settings: Settings,
    state: StateMachine,
    context: ContextManager,
    nlu: NluCore,
    executor: ActionExecutor,
    voice: Option<VoicePipeline>,
    db: Option<DbPool>,
}

impl Daemon {
    /// Construct the daemon and all its components
    ///
    /// Audio hardware that fails to open here is fatal, per the
    /// error-handling design; run with voice disabled on headless hosts.
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid, the store cannot be
    /// opened, or (with voice enabled) no audio devices are available
    pub fn new(settings: Settings, disable_voice: bool) -> Result<Self> {
        let db = if settings.context.persistent {
            Some(store::init(&settings.context.db_path)?)
        } else {
            None
        };

        let context = match db.clone() {
            Some(pool) => ContextManager::with_pool(settings.context.clone(), pool)?,
            None => ContextManager::new(settings.context.clone())?,
        };

        let nlu = NluCore::new(settings.openai.clone(), settings.nlu.clone())?;
        let executor = ActionExecutor::new();

        let voice = if disable_voice {
            tracing::info!("voice disabled, running in text-only mode");
            None
        } else {
            Some(VoicePipeline {
                capture: AudioCapture::new(&settings.audio)?,
                playback: AudioPlayback::new()?,
                transcriber: Transcriber::new(settings.openai.clone())?,
                synthesizer: Synthesizer::new(settings.openai.clone())?,
                wake: WakeWordDetector::new(
                    &settings.wake.phrase,
                    settings.audio.sample_rate,
                    settings.audio.silence_threshold,
                ),
            })
        };

        Ok(Self {
            settings,
            state: StateMachine::new(),
            context,
            nlu,
            executor,
            voice,
            db,
        })
    }

    /// Run until interrupted
    ///
    /// # Errors
    ///
    /// Returns error only on fatal startup failures (API port, metrics
    /// recorder); per-turn failures are handled in the loop
    pub async fn run(mut self) -> Result<()> {
        let handle = metrics::install_recorder()?;
        let api_state = Arc::new(ApiState {
            db: self.db.clone(),
            voice_enabled: self.voice.is_some(),
            metrics: handle,
        });
        let port = self.settings.api_port;
        tokio::spawn(async move {
            if let Err(e) = api::serve(api_state, port).await {
                tracing::error!(error = %e, "api server exited");
            }
        });

        metrics::set_conversations_active(0.0);

        if self.voice.is_some() {
            self.speak_best_effort(GREETING).await;
            if self.settings.wake.enabled {
                tracing::info!(phrase = %self.settings.wake.phrase, "daemon ready - say the wake phrase");
            } else {
                tracing::info!("daemon ready (no wake phrase configured)");
            }
        } else {
            tracing::info!("daemon ready (voice disabled; api only)");
        }

        loop {
            if self.voice.is_none() {
                // Nothing to drive; park until interrupted
                tokio::signal::ctrl_c().await?;
                break;
            }

            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                result = self.turn() => {
                    if let Err(e) = result {
                        self.recover(&e).await;
                    }
                }
            }
        }

        tracing::info!("shutting down");
        Ok(())
    }

    /// One full conversational turn
    async fn turn(&mut self) -> Result<()> {
        if self.settings.wake.enabled {
            self.await_wake().await?;
        }
        self.state.transition(TurnEvent::WakeDetected);

        let Some(voice) = self.voice.as_mut() else {
            return Err(Error::Audio("voice pipeline unavailable".to_string()));
        };

        // Capture the command utterance
        let samples = voice.capture.listen_until_silence().await?;
        if samples.is_empty() {
            self.state.transition(TurnEvent::CaptureAbandoned);
            return Ok(());
        }

        // Transcribe
        let started = Instant::now();
        let wav = samples_to_wav(&samples, voice.capture.sample_rate())?;
        let text = match voice.transcriber.transcribe(&wav).await {
            Ok(text) => {
                metrics::record_stage(Stage::Stt, started.elapsed().as_secs_f64());
                text
            }
            Err(e) => {
                metrics::record_stage_error(Stage::Stt);
                return Err(e);
            }
        };

        if text.trim().is_empty() {
            self.state.transition(TurnEvent::CaptureAbandoned);
            return Ok(());
        }

        tracing::info!(text = %text, "user said");

        // Built-in commands skip the language model entirely
        let lower = text.to_lowercase();
        if lower.contains("stop") || lower.contains("cancel") {
            self.state.transition(TurnEvent::CaptureAbandoned);
            self.speak_best_effort("Okay.").await;
            return Ok(());
        }

        self.state.transition(TurnEvent::UtteranceCaptured);
        metrics::set_conversations_active(1.0);
        self.state
            .set_data("last_input", serde_json::Value::String(text.clone()));

        let reply = self.understand_and_act(&text).await?;

        // Speak the reply
        let started = Instant::now();
        let audio = {
            let voice = self
                .voice
                .as_mut()
                .ok_or_else(|| Error::Audio("voice pipeline unavailable".to_string()))?;
            match voice.synthesizer.synthesize(&reply).await {
                Ok(audio) => {
                    metrics::record_stage(Stage::Tts, started.elapsed().as_secs_f64());
                    audio
                }
                Err(e) => {
                    metrics::record_stage_error(Stage::Tts);
                    return Err(e);
                }
            }
        };

        let started = Instant::now();
        if let Some(voice) = self.voice.as_mut() {
            match voice.playback.play_mp3(&audio).await {
                Ok(()) => metrics::record_stage(Stage::Playback, started.elapsed().as_secs_f64()),
                Err(e) => {
                    metrics::record_stage_error(Stage::Playback);
                    return Err(e);
                }
            }
        }

        self.state.transition(TurnEvent::ReplyDelivered);
        metrics::set_conversations_active(0.0);
        metrics::record_turn();
        Ok(())
    }

    /// Understand one utterance and run its actions; shared by the voice
    /// loop and the text-only path
    async fn understand_and_act(&mut self, text: &str) -> Result<String> {
        self.context.add_message(Role::User, text)?;

        let started = Instant::now();
        let understanding = {
            let snapshot = self.state.snapshot();
            match self
                .nlu
                .process(text, self.context.prompt_window(), Some(&snapshot))
                .await
            {
                Ok(u) => {
                    metrics::record_stage(Stage::Nlu, started.elapsed().as_secs_f64());
                    u
                }
                Err(e) => {
                    metrics::record_stage_error(Stage::Nlu);
                    return Err(e);
                }
            }
        };

        tracing::info!(
            intent = %understanding.intent,
            actions = understanding.actions.len(),
            confidence = understanding.confidence,
            "understood"
        );

        let mut reply = understanding.reply.clone();

        if understanding.actions.is_empty() {
            self.state.transition(TurnEvent::ReplyReady);
        } else {
            self.state.transition(TurnEvent::ActionsRequested);

            let started = Instant::now();
            let results = self.executor.execute_batch_async(&understanding.actions).await;
            metrics::record_stage(Stage::Action, started.elapsed().as_secs_f64());

            for result in &results {
                metrics::record_action(result.success);
            }

            reply = enhance_reply(reply, &results);
            self.state.transition(TurnEvent::ActionsSettled);
        }

        self.context.add_message(Role::Assistant, &reply)?;
        Ok(reply)
    }

    /// Process a single text utterance without audio (the `--once` path)
    ///
    /// # Errors
    ///
    /// Returns error if understanding fails
    pub async fn process_text(&mut self, text: &str) -> Result<String> {
        self.state.transition(TurnEvent::WakeDetected);
        self.state.transition(TurnEvent::UtteranceCaptured);

        let reply = match self.understand_and_act(text).await {
            Ok(reply) => reply,
            Err(e) => {
                self.state.fail(e.to_string());
                self.state.transition(TurnEvent::Reset);
                return Err(e);
            }
        };

        self.state.transition(TurnEvent::ReplyDelivered);
        Ok(reply)
    }

    /// Block until the wake phrase is confirmed
    async fn await_wake(&mut self) -> Result<()> {
        let voice = self
            .voice
            .as_mut()
            .ok_or_else(|| Error::Audio("voice pipeline unavailable".to_string()))?;

        voice.wake.reset();
        voice.capture.clear_buffer();
        voice.capture.start()?;

        loop {
            tokio::time::sleep(WAKE_POLL_INTERVAL).await;

            let chunk = voice.capture.take_buffer();
            if chunk.is_empty() {
                continue;
            }

            if !voice.wake.process(&chunk) {
                continue;
            }

            // Candidate segment complete; verify against the transcript
            let candidate = voice.wake.take_speech_buffer();
            let wav = samples_to_wav(&candidate, voice.capture.sample_rate())?;
            match voice.transcriber.transcribe(&wav).await {
                Ok(transcript) => {
                    if voice.wake.check_wake_word(&transcript) {
                        voice.capture.stop();
                        let _ = voice.playback.play_chime(Chime::Wake).await;
                        return Ok(());
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "wake verification failed, still listening");
                    voice.wake.reset();
                }
            }
        }
    }

    /// Non-fatal failure handling: log, apologize, return to idle
    async fn recover(&mut self, error: &Error) {
        tracing::error!(error = %error, "turn failed");

        self.state.fail(error.to_string());
        if let Some(voice) = self.voice.as_mut() {
            let _ = voice.playback.play_chime(Chime::Error).await;
        }
        self.speak_best_effort(APOLOGY).await;

        self.state.transition(TurnEvent::Reset);
        self.state.clear_data();
        metrics::set_conversations_active(0.0);

        tokio::time::sleep(ERROR_BACKOFF).await;
    }

    /// Synthesize and play a phrase, swallowing failures
    async fn speak_best_effort(&mut self, text: &str) {
        let Some(voice) = self.voice.as_mut() else {
            return;
        };

        match voice.synthesizer.synthesize(text).await {
            Ok(audio) => {
                if let Err(e) = voice.playback.play_mp3(&audio).await {
                    tracing::warn!(error = %e, "playback failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "synthesis failed"),
        }
    }

    /// Current state (for status reporting and tests)
    #[must_use]
    pub const fn state(&self) -> SystemState {
        self.state.current()
    }

    /// Context statistics (for status reporting and tests)
    #[must_use]
    pub fn context_stats(&self) -> crate::context::ContextStats {
        self.context.stats()
    }
}

/// Append failed-action details to the reply
fn enhance_reply(reply: String, results: &[ActionResult]) -> String {
    let errors: Vec<&str> = results
        .iter()
        .filter(|r| !r.success)
        .filter_map(|r| r.error.as_deref())
        .collect();

    if errors.is_empty() {
        reply
    } else {
        format!(
            "{reply} However, I ran into some issues: {}",
            errors.join(", ")
        )
    }
}
