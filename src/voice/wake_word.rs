//! Wake-phrase gating
//!
//! Hybrid detection: local energy-based speech segmentation finds candidate
//! utterances cheaply; the transcript from STT is then checked for the
//! configured wake phrase before the assistant activates.

use super::capture::rms;

/// Detector phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Waiting for speech energy
    Idle,
    /// Accumulating a candidate segment
    Listening,
    /// Wake phrase confirmed; capturing the command
    Activated,
}

/// Detects the wake phrase in an audio stream
pub struct WakeWordDetector {
    phrase: String,
    energy_threshold: f32,
    min_speech_samples: usize,
    silence_samples: usize,
    state: DetectorState,
    speech_buffer: Vec<f32>,
    silence_run: usize,
}

impl WakeWordDetector {
    /// Create a detector for one wake phrase
    ///
    /// `sample_rate` sizes the minimum-speech and trailing-silence windows
    /// (0.3s of speech, 0.5s of silence).
    #[must_use]
    pub fn new(phrase: &str, sample_rate: u32, energy_threshold: f32) -> Self {
        let phrase = phrase.to_lowercase().trim().to_string();
        let rate = sample_rate as usize;

        tracing::debug!(phrase = %phrase, "wake word detector initialized");

        Self {
            phrase,
            energy_threshold,
            min_speech_samples: rate * 3 / 10,
            silence_samples: rate / 2,
            state: DetectorState::Idle,
            speech_buffer: Vec::new(),
            silence_run: 0,
        }
    }

    /// Feed samples; returns true when a candidate segment is complete and
    /// ready for transcription
    pub fn process(&mut self, samples: &[f32]) -> bool {
        let is_speech = rms(samples) > self.energy_threshold;

        match self.state {
            DetectorState::Idle => {
                if is_speech {
                    self.state = DetectorState::Listening;
                    self.speech_buffer.clear();
                    self.speech_buffer.extend_from_slice(samples);
                    self.silence_run = 0;
                    tracing::trace!("speech energy detected");
                }
            }
            DetectorState::Listening => {
                self.speech_buffer.extend_from_slice(samples);

                if is_speech {
                    self.silence_run = 0;
                } else {
                    self.silence_run += samples.len();
                }

                if self.silence_run > self.silence_samples
                    && self.speech_buffer.len() > self.min_speech_samples
                {
                    tracing::debug!(
                        samples = self.speech_buffer.len(),
                        "candidate segment complete"
                    );
                    return true;
                }

                // Too much silence without enough speech
                if self.silence_run > self.silence_samples * 2 {
                    self.reset();
                }
            }
            DetectorState::Activated => {
                self.speech_buffer.extend_from_slice(samples);

                if is_speech {
                    self.silence_run = 0;
                } else {
                    self.silence_run += samples.len();
                }
            }
        }

        false
    }

    /// Check a transcript for the wake phrase
    ///
    /// Activates the detector when the phrase is present; otherwise resets
    /// back to idle.
    pub fn check_wake_word(&mut self, transcript: &str) -> bool {
        if transcript.to_lowercase().contains(&self.phrase) {
            tracing::info!(phrase = %self.phrase, transcript, "wake phrase detected");
            self.state = DetectorState::Activated;
            return true;
        }

        self.reset();
        false
    }

    /// Accumulated candidate samples
    #[must_use]
    pub fn speech_buffer(&self) -> &[f32] {
        &self.speech_buffer
    }

    /// Take the candidate samples, clearing the buffer
    pub fn take_speech_buffer(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.speech_buffer)
    }

    /// Whether the wake phrase has been confirmed
    #[must_use]
    pub fn is_activated(&self) -> bool {
        self.state == DetectorState::Activated
    }

    /// Return to idle, discarding any candidate
    pub fn reset(&mut self) {
        self.state = DetectorState::Idle;
        self.speech_buffer.clear();
        self.silence_run = 0;
    }

    /// Skip detection entirely (wake gating disabled)
    pub const fn activate(&mut self) {
        self.state = DetectorState::Activated;
        self.silence_run = 0;
    }

    /// Current detector phase
    #[must_use]
    pub const fn state(&self) -> DetectorState {
        self.state
    }

    /// The configured wake phrase
    #[must_use]
    pub fn phrase(&self) -> &str {
        &self.phrase
    }
}
