//! Audio pipeline integration tests
//!
//! Tests capture, framing and packaging without requiring audio hardware

use std::io::Cursor;

use parley_speech::voice::capture::CaptureSession;
use parley_speech::voice::endpoint::{DetectorState, EndpointConfig, EndpointDetector};
use parley_speech::voice::pcm::{decode_pcm16, samples_to_wav};
use parley_speech::voice::playback::{PLAYBACK_SAMPLE_RATE, decode_audio, resample};

mod common;
use common::{RATE, ScriptedMic, blocks, generate_silence, generate_sine_samples};

#[test]
fn test_recording_roundtrip() {
    let speech = generate_sine_samples(440.0, 0.3, 0.5);
    let mic = ScriptedMic::new(blocks(&speech, 1000));

    let capture = CaptureSession::start_block(mic.as_ref(), RATE, None).unwrap();
    assert!(capture.is_capturing());
    let recording = capture.finish();

    assert_eq!(recording.segment_count(), 5);
    assert_eq!(recording.sample_count(), speech.len());

    // Read WAV back
    let wav = recording.to_wav().unwrap();
    let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, RATE);
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.bits_per_sample, 16);

    let read: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(read.len(), speech.len());
}

#[test]
fn test_capture_releases_device_on_finish() {
    let mic = ScriptedMic::new(blocks(&generate_silence(0.1), 800));

    let capture = CaptureSession::start_block(mic.as_ref(), RATE, None).unwrap();
    assert_eq!(mic.live_handles(), 1);
    let _ = capture.finish();
    assert_eq!(mic.live_handles(), 0);

    // Dropping without finishing also releases
    let capture = CaptureSession::start_block(mic.as_ref(), RATE, None).unwrap();
    drop(capture);
    assert_eq!(mic.live_handles(), 0);
}

#[test]
fn test_capture_failure_leaves_nothing_open() {
    let mic = ScriptedMic::denied();
    let err = CaptureSession::start_block(mic.as_ref(), RATE, None).unwrap_err();
    assert!(err.to_string().contains("permission denied"));
    assert_eq!(mic.live_handles(), 0);
}

#[test]
fn test_streaming_frames_in_capture_order() {
    // Ramp so each frame's content reveals its position
    #[allow(clippy::cast_precision_loss)]
    let ramp: Vec<f32> = (0..10_000).map(|i| (i as f32 / 10_000.0) - 0.5).collect();
    let mic = ScriptedMic::new(blocks(&ramp, 1500));

    let (capture, mut frames) = CaptureSession::start_streaming(mic.as_ref(), RATE, 4096).unwrap();

    let mut decoded = Vec::new();
    while let Ok(frame) = frames.try_recv() {
        assert_eq!(frame.len(), 4096 * 2);
        decoded.extend(decode_pcm16(&frame));
    }
    // Two full frames; the remainder stays pending
    assert_eq!(decoded.len(), 8192);
    assert!(decoded.windows(2).all(|w| w[0] <= w[1]));

    let recording = capture.finish();
    assert_eq!(recording.sample_count(), ramp.len());
}

#[test]
fn test_block_capture_tap_sees_every_block() {
    let script = blocks(&generate_sine_samples(300.0, 0.25, 0.2), 1000);
    let mic = ScriptedMic::new(script.clone());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let capture = CaptureSession::start_block(mic.as_ref(), RATE, Some(tx)).unwrap();
    let mut tapped = 0;
    while let Ok(block) = rx.try_recv() {
        tapped += block.len();
    }
    assert_eq!(tapped, script.iter().map(Vec::len).sum::<usize>());
    assert_eq!(capture.snapshot().len(), tapped);
}

#[test]
fn test_endpoint_detection() {
    let mut detector = EndpointDetector::new(EndpointConfig::default());

    // Silent samples - should not trigger
    assert!(!detector.process(&generate_silence(0.1)));
    assert_eq!(detector.state(), DetectorState::Idle);

    // Loud samples - speech starts
    detector.process(&generate_sine_samples(440.0, 0.5, 0.3));
    assert_eq!(detector.state(), DetectorState::Speaking);

    // Not enough silence yet
    assert!(!detector.process(&generate_silence(0.3)));

    // Enough silence completes the utterance exactly once
    assert!(detector.process(&generate_silence(0.6)));
    assert!(!detector.process(&generate_silence(0.6)));
    assert_eq!(detector.state(), DetectorState::Complete);
}

#[test]
fn test_short_noise_is_not_an_utterance() {
    let mut detector = EndpointDetector::new(EndpointConfig::default());

    // A 0.1s click followed by silence resets instead of completing
    detector.process(&generate_sine_samples(440.0, 0.1, 0.5));
    assert!(!detector.process(&generate_silence(1.0)));
    assert_eq!(detector.state(), DetectorState::Idle);
    assert_eq!(detector.speech_samples(), 0);
}

#[test]
fn test_rendered_wav_decodes_and_resamples() {
    let samples = generate_sine_samples(440.0, 0.1, 0.5);
    let wav = samples_to_wav(&samples, RATE).unwrap();

    let clip = decode_audio(&wav).unwrap();
    assert_eq!(clip.sample_rate, RATE);
    assert_eq!(clip.samples.len(), samples.len());

    let resampled = resample(&clip.samples, RATE, PLAYBACK_SAMPLE_RATE).unwrap();
    // Upsampling 16k to 24k yields at least 1.5x the input (plus resampler padding)
    assert!(resampled.len() >= samples.len() * 3 / 2, "got {}", resampled.len());
}

#[test]
fn test_garbage_audio_is_a_render_error() {
    assert!(decode_audio(&[]).is_err());
    assert!(decode_audio(b"definitely not audio").is_err());
}
