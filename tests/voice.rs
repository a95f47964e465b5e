//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware.

mod common;

use std::io::Cursor;
use std::time::{Duration, Instant};

use murmur::voice::{samples_to_wav, DetectorState, SilenceWatch, WakeWordDetector};

const SAMPLE_RATE: u32 = 16_000;

/// Generate sine wave audio samples
fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Generate silence
fn generate_silence(duration_secs: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    vec![0.0; num_samples]
}

fn detector() -> WakeWordDetector {
    WakeWordDetector::new("hey murmur", SAMPLE_RATE, 0.03)
}

#[test]
fn test_detector_starts_idle() {
    let d = detector();
    assert_eq!(d.state(), DetectorState::Idle);
    assert!(!d.is_activated());
    assert_eq!(d.phrase(), "hey murmur");
}

#[test]
fn test_wake_phrase_verification() {
    let mut d = detector();

    assert!(!d.check_wake_word("hello world"));
    assert_eq!(d.state(), DetectorState::Idle);

    assert!(d.check_wake_word("Hey Murmur, what's the time?"));
    assert!(d.is_activated());
}

#[test]
fn test_wake_phrase_case_insensitive() {
    let mut d = detector();

    assert!(d.check_wake_word("HEY MURMUR"));
    d.reset();

    assert!(d.check_wake_word("hEy MuRmUr"));
    d.reset();

    assert!(d.check_wake_word("hey murmur"));
}

#[test]
fn test_speech_segmentation_cycle() {
    let mut d = detector();

    // Silence does nothing
    assert!(!d.process(&generate_silence(0.1)));
    assert_eq!(d.state(), DetectorState::Idle);

    // Speech starts a candidate segment
    d.process(&generate_sine_samples(440.0, 0.5, 0.3));
    assert_eq!(d.state(), DetectorState::Listening);

    // More speech, then enough trailing silence completes it
    d.process(&generate_sine_samples(440.0, 0.3, 0.3));
    assert!(d.process(&generate_silence(0.6)));
}

#[test]
fn test_candidate_buffer_accumulates_and_takes() {
    let mut d = detector();

    let chunk1 = generate_sine_samples(440.0, 0.1, 0.3);
    let chunk2 = generate_sine_samples(440.0, 0.1, 0.3);
    d.process(&chunk1);
    d.process(&chunk2);
    assert_eq!(d.speech_buffer().len(), chunk1.len() + chunk2.len());

    let taken = d.take_speech_buffer();
    assert_eq!(taken.len(), chunk1.len() + chunk2.len());
    assert!(d.speech_buffer().is_empty());
}

#[test]
fn test_silence_watch_ends_on_trailing_silence() {
    let mut settings = common::test_settings().audio;
    settings.silence_duration = Duration::from_millis(500);
    settings.listen_timeout = Duration::from_secs(30);

    let start = Instant::now();
    let mut watch = SilenceWatch::new(&settings, start);

    watch.observe(&generate_sine_samples(440.0, 0.5, 0.3));
    assert!(!watch.is_complete(start));

    watch.observe(&generate_silence(0.6));
    assert!(watch.is_complete(start));
    assert!(!watch.deadline_expired(start));
}

#[test]
fn test_silence_watch_deadline_regression() {
    // Regression for the infinite-wait defect: every audio callback fires
    // before the wait loop starts polling, and nothing arrives afterwards.
    // The watch must still complete once the wall-clock deadline passes.
    let mut settings = common::test_settings().audio;
    settings.listen_timeout = Duration::from_millis(50);

    let start = Instant::now();
    let mut watch = SilenceWatch::new(&settings, start);

    // All callbacks delivered up front: speech with no trailing silence
    watch.observe(&generate_sine_samples(440.0, 1.0, 0.3));
    assert!(!watch.is_complete(start));

    // Simulated wait loop driven purely by elapsed time
    let mut polls = 0u32;
    loop {
        std::thread::sleep(Duration::from_millis(10));
        polls += 1;
        if watch.is_complete(Instant::now()) {
            break;
        }
        assert!(polls < 100, "watch never completed");
    }

    assert!(watch.deadline_expired(Instant::now()));
}

#[test]
fn test_silence_watch_no_speech_times_out_empty() {
    let mut settings = common::test_settings().audio;
    settings.listen_timeout = Duration::from_millis(20);

    let start = Instant::now();
    let mut watch = SilenceWatch::new(&settings, start);
    watch.observe(&generate_silence(1.0));

    let past = start + Duration::from_millis(25);
    assert!(watch.is_complete(past));
    assert!(!watch.heard_speech());
}

#[test]
fn test_samples_to_wav_header() {
    let samples = generate_sine_samples(440.0, 0.1, 0.5);
    let wav = samples_to_wav(&samples, SAMPLE_RATE).unwrap();

    assert_eq!(&wav[0..4], b"RIFF");
    assert_eq!(&wav[8..12], b"WAVE");
    assert!(wav.len() > 44);
}

#[test]
fn test_wav_roundtrip() {
    let original: Vec<f32> = vec![0.0, 0.5, -0.5, 1.0, -1.0, 0.25];
    let wav = samples_to_wav(&original, SAMPLE_RATE).unwrap();

    let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.channels, 1);

    let read: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(read.len(), original.len());
}
