//! Microphone capture and silence-bounded listening

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};

use crate::config::AudioSettings;
use crate::{Error, Result};

/// Poll interval for the listen loop
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Tracks end-of-utterance conditions during a listen
///
/// An utterance is complete when speech has been heard and the configured
/// trailing silence follows it. Completion is additionally bounded by a
/// wall-clock deadline so the wait always terminates, even if every audio
/// callback fires before the wait loop starts observing.
#[derive(Debug)]
pub struct SilenceWatch {
    threshold: f32,
    required_silence: usize,
    deadline: Instant,
    heard_speech: bool,
    silence_run: usize,
}

impl SilenceWatch {
    /// Create a watch starting now
    #[must_use]
    pub fn new(settings: &AudioSettings, now: Instant) -> Self {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let required_silence = (settings.silence_duration.as_secs_f64()
            * f64::from(settings.sample_rate)) as usize;

        Self {
            threshold: settings.silence_threshold,
            required_silence,
            deadline: now + settings.listen_timeout,
            heard_speech: false,
            silence_run: 0,
        }
    }

    /// Feed a chunk of captured samples
    pub fn observe(&mut self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }

        if rms(samples) > self.threshold {
            self.heard_speech = true;
            self.silence_run = 0;
        } else {
            self.silence_run += samples.len();
        }
    }

    /// Whether the listen should stop at `now`
    ///
    /// True when trailing silence follows speech, or the deadline has
    /// passed. The deadline check never depends on how many chunks were
    /// observed.
    #[must_use]
    pub fn is_complete(&self, now: Instant) -> bool {
        if now >= self.deadline {
            return true;
        }
        self.heard_speech && self.silence_run >= self.required_silence
    }

    /// Whether completion was due to the deadline rather than silence
    #[must_use]
    pub fn deadline_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Whether any speech has been observed
    #[must_use]
    pub const fn heard_speech(&self) -> bool {
        self.heard_speech
    }
}

/// Captures audio from the default input device
pub struct AudioCapture {
    #[allow(dead_code)]
    device: Device,
    config: StreamConfig,
    settings: AudioSettings,
    buffer: Arc<Mutex<Vec<f32>>>,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Open the default input device at the configured sample rate
    ///
    /// # Errors
    ///
    /// Returns error if no suitable input device is available (fatal at
    /// startup per the error-handling design)
    pub fn new(settings: &AudioSettings) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let rate = settings.sample_rate;
        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(rate)
                    && c.max_sample_rate() >= SampleRate(rate)
            })
            .ok_or_else(|| Error::Audio("no suitable input config found".to_string()))?;

        let config = supported_config.with_sample_rate(SampleRate(rate)).config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = rate,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            config,
            settings: settings.clone(),
            buffer: Arc::new(Mutex::new(Vec::new())),
            stream: None,
        })
    }

    /// Start streaming into the capture buffer
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be built or started
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let buffer = Arc::clone(&self.buffer);
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device".to_string()))?;

        let config = self.config.clone();
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut buf) = buffer.lock() {
                        buf.extend_from_slice(data);
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    /// Stop capturing
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    /// Take and clear the captured samples
    #[must_use]
    pub fn take_buffer(&self) -> Vec<f32> {
        self.buffer
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }

    /// Clear the capture buffer
    pub fn clear_buffer(&self) {
        if let Ok(mut buf) = self.buffer.lock() {
            buf.clear();
        }
    }

    /// Whether a stream is active
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }

    /// Configured sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.settings.sample_rate
    }

    /// Record until trailing silence or the listen deadline
    ///
    /// Returns the captured utterance samples; an empty result means the
    /// deadline passed without any speech.
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be started
    pub async fn listen_until_silence(&mut self) -> Result<Vec<f32>> {
        self.clear_buffer();
        self.start()?;

        let mut watch = SilenceWatch::new(&self.settings, Instant::now());
        let mut utterance = Vec::new();

        tracing::debug!("listening");

        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            let chunk = self.take_buffer();
            watch.observe(&chunk);
            utterance.extend_from_slice(&chunk);

            let now = Instant::now();
            if watch.is_complete(now) {
                if watch.deadline_expired(now) {
                    tracing::debug!(samples = utterance.len(), "listen deadline reached");
                } else {
                    tracing::debug!(samples = utterance.len(), "utterance complete");
                }
                break;
            }
        }

        self.stop();

        if !watch.heard_speech() {
            tracing::debug!("no speech before deadline");
            return Ok(Vec::new());
        }

        Ok(utterance)
    }
}

/// RMS energy of a chunk
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Encode f32 samples as 16-bit PCM WAV for the transcription API
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
