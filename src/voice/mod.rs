//! Voice processing
//!
//! Audio capture with silence-bounded listening, wake-phrase gating,
//! hosted STT/TTS wrappers, and speaker playback.

mod capture;
mod playback;
mod stt;
mod tts;
mod wake_word;

pub use capture::{rms, samples_to_wav, AudioCapture, SilenceWatch};
pub use playback::{AudioPlayback, Chime};
pub use stt::Transcriber;
pub use tts::Synthesizer;
pub use wake_word::{DetectorState, WakeWordDetector};
