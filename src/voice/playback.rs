//! Audio playback to speakers
//!
//! [`AudioSink`] is the rendering seam: whole clips for request/response
//! voices, and an open [`PcmStream`] for frames arriving from a live session.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, PlayStreamError, SampleRate, StreamConfig};
use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

/// Sample rate for playback (matches common TTS output)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Mono float audio at a known rate
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioClip {
    #[must_use]
    pub const fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// A short run of silence
    #[must_use]
    pub fn silence(sample_rate: u32, duration: Duration) -> Self {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let len = (f64::from(sample_rate) * duration.as_secs_f64()) as usize;
        Self::new(vec![0.0; len], sample_rate)
    }

    /// Playback length
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }
}

/// Live output for PCM frames streamed from a remote session
pub trait PcmStream: Send {
    /// Queue samples behind whatever is already playing
    fn push(&mut self, samples: &[f32]);

    /// Drop everything queued (interruption)
    fn flush(&mut self);

    /// Stop rendering and release the output device
    ///
    /// # Errors
    ///
    /// Returns error if the device could not be released cleanly
    fn close(&mut self) -> Result<()>;
}

/// Audio rendering backend
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play a clip to completion, or until [`AudioSink::halt`] is called
    ///
    /// # Errors
    ///
    /// Returns [`Error::PlaybackBlocked`] if the device refuses to start, or
    /// an audio error for any other failure
    async fn play(&self, clip: AudioClip) -> Result<()>;

    /// Stop whatever clip is playing right now
    fn halt(&self);

    /// Open a stream for incrementally pushed frames at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if the output device cannot be opened
    fn open_stream(&self, sample_rate: u32) -> Result<Box<dyn PcmStream>>;
}

/// Plays audio to the default output device
#[derive(Debug, Clone)]
pub struct CpalPlayback {
    config: StreamConfig,
    halt_generation: Arc<AtomicU64>,
}

impl CpalPlayback {
    /// Create a new audio playback instance
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
            })
            .or_else(|| {
                // Fallback: try stereo
                device.supported_output_configs().ok()?.find(|c| {
                    c.channels() == 2
                        && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                        && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
                })
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = PLAYBACK_SAMPLE_RATE,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self {
            config,
            halt_generation: Arc::new(AtomicU64::new(0)),
        })
    }
}

#[async_trait]
impl AudioSink for CpalPlayback {
    async fn play(&self, clip: AudioClip) -> Result<()> {
        let samples = resample(&clip.samples, clip.sample_rate, PLAYBACK_SAMPLE_RATE)?;
        let config = self.config.clone();
        let halt = Arc::clone(&self.halt_generation);
        let generation = halt.load(Ordering::SeqCst);

        tokio::task::spawn_blocking(move || {
            play_samples_blocking(&config, samples, &halt, generation)
        })
        .await
        .map_err(|e| Error::Audio(format!("playback task failed: {e}")))?
    }

    fn halt(&self) {
        self.halt_generation.fetch_add(1, Ordering::SeqCst);
    }

    fn open_stream(&self, sample_rate: u32) -> Result<Box<dyn PcmStream>> {
        Ok(Box::new(CpalStream::open(self.config.clone(), sample_rate)?))
    }
}

fn map_build_error(e: BuildStreamError) -> Error {
    match e {
        BuildStreamError::DeviceNotAvailable => Error::PlaybackBlocked(e.to_string()),
        other => Error::Audio(other.to_string()),
    }
}

fn map_play_error(e: PlayStreamError) -> Error {
    match e {
        PlayStreamError::DeviceNotAvailable => Error::PlaybackBlocked(e.to_string()),
        other => Error::Audio(other.to_string()),
    }
}

/// Play samples in a blocking manner until done or halted
fn play_samples_blocking(
    config: &StreamConfig,
    samples: Vec<f32>,
    halt: &AtomicU64,
    generation: u64,
) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::PlaybackBlocked("no output device".to_string()))?;

    let channels = config.channels as usize;
    let sample_count = samples.len();
    let samples = Arc::new(samples);
    let position = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicBool::new(false));

    let samples_clone = Arc::clone(&samples);
    let position_clone = Arc::clone(&position);
    let finished_clone = Arc::clone(&finished);

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let pos = position_clone.load(Ordering::Relaxed);
                    let sample = if pos < samples_clone.len() {
                        position_clone.store(pos + 1, Ordering::Relaxed);
                        samples_clone[pos]
                    } else {
                        finished_clone.store(true, Ordering::Release);
                        0.0
                    };

                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(map_build_error)?;

    stream.play().map_err(map_play_error)?;

    // Poll for completion with timeout
    let duration_ms = (sample_count as u64 * 1000) / u64::from(PLAYBACK_SAMPLE_RATE);
    let start = Instant::now();
    let timeout = Duration::from_millis(duration_ms + 500);

    while !finished.load(Ordering::Acquire) {
        if halt.load(Ordering::SeqCst) != generation {
            tracing::debug!("playback halted");
            break;
        }
        if start.elapsed() > timeout {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    drop(stream);
    tracing::debug!(samples = sample_count, "playback complete");

    Ok(())
}

/// Output stream fed by [`PcmStream::push`]
struct CpalStream {
    queue: Arc<Mutex<VecDeque<f32>>>,
    resampler: StreamResampler,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalStream {
    fn open(config: StreamConfig, source_rate: u32) -> Result<Self> {
        let resampler = StreamResampler::new(source_rate, PLAYBACK_SAMPLE_RATE, STREAM_CHUNK)?;
        let queue = Arc::new(Mutex::new(VecDeque::<f32>::new()));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let reader = Arc::clone(&queue);

        let thread = std::thread::Builder::new()
            .name("parley-output".to_string())
            .spawn(move || {
                let opened = open_output_stream(&config, reader);
                match opened {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                queue,
                resampler,
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Audio("output thread exited".to_string()))
            }
        }
    }
}

fn open_output_stream(
    config: &StreamConfig,
    queue: Arc<Mutex<VecDeque<f32>>>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::PlaybackBlocked("no output device".to_string()))?;
    let channels = config.channels as usize;

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut pending = queue.lock().ok();
                for frame in data.chunks_mut(channels) {
                    let sample = pending
                        .as_mut()
                        .and_then(|q| q.pop_front())
                        .unwrap_or(0.0);
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio stream error");
            },
            None,
        )
        .map_err(map_build_error)?;

    stream.play().map_err(map_play_error)?;
    Ok(stream)
}

impl PcmStream for CpalStream {
    fn push(&mut self, samples: &[f32]) {
        let samples = match self.resampler.push(samples) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "dropping frame that failed to resample");
                return;
            }
        };
        if let Ok(mut queue) = self.queue.lock() {
            queue.extend(samples);
        }
    }

    fn flush(&mut self) {
        self.resampler.reset();
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }

    fn close(&mut self) -> Result<()> {
        self.flush();
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| Error::Audio("output thread panicked".to_string()))?;
        }
        Ok(())
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Input frames per resampler pass on a live stream
const STREAM_CHUNK: usize = 256;

/// Resample mono audio between rates
///
/// # Errors
///
/// Returns error if the resampler cannot be built for these rates
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let mut resampler = StreamResampler::new(from, to, 1024)?;
    let mut output = resampler.push(samples)?;
    output.extend(resampler.finish()?);
    Ok(output)
}

/// Resampler that keeps its filter state across pushed blocks
///
/// Input short of a full chunk is held until the next push, so consecutive
/// frames join without padding at their edges.
pub struct StreamResampler {
    resampler: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    /// # Errors
    ///
    /// Returns error if the resampler cannot be built for these rates
    pub fn new(from: u32, to: u32, chunk_size: usize) -> Result<Self> {
        let resampler = if from == to || from == 0 || to == 0 {
            None
        } else {
            let resampler = FftFixedIn::<f32>::new(from as usize, to as usize, chunk_size, 2, 1)
                .map_err(|e| Error::Audio(format!("resampler: {e}")))?;
            Some(resampler)
        };
        Ok(Self {
            resampler,
            pending: Vec::new(),
        })
    }

    /// Feed samples; returns the output that is ready
    ///
    /// # Errors
    ///
    /// Returns error if a resampler pass fails
    pub fn push(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(samples.to_vec());
        };
        self.pending.extend_from_slice(samples);

        let mut output = Vec::new();
        let mut pos = 0;
        while self.pending.len() - pos >= resampler.input_frames_next() {
            let needed = resampler.input_frames_next();
            let input = [&self.pending[pos..pos + needed]];
            let chunk = resampler
                .process(&input[..], None)
                .map_err(|e| Error::Audio(format!("resample: {e}")))?;
            output.extend_from_slice(&chunk[0]);
            pos += needed;
        }
        self.pending.drain(..pos);
        Ok(output)
    }

    /// Resample whatever is still held back
    ///
    /// # Errors
    ///
    /// Returns error if the final pass fails
    pub fn finish(&mut self) -> Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(Vec::new());
        };
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        let input = [self.pending.as_slice()];
        let chunk = resampler
            .process_partial(Some(&input[..]), None)
            .map_err(|e| Error::Audio(format!("resample: {e}")))?;
        self.pending.clear();
        Ok(chunk.into_iter().next().unwrap_or_default())
    }

    /// Drop held-back input and filter history
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

/// Decode a rendered audio asset (WAV or MP3) into a mono clip
///
/// # Errors
///
/// Returns a render error if the bytes are empty or cannot be decoded
pub fn decode_audio(bytes: &[u8]) -> Result<AudioClip> {
    if bytes.is_empty() {
        return Err(Error::Render("empty audio payload".to_string()));
    }
    if bytes.starts_with(b"RIFF") {
        decode_wav(bytes)
    } else {
        decode_mp3(bytes)
    }
}

/// Decode WAV bytes, averaging channels down to mono
#[allow(clippy::cast_precision_loss)]
fn decode_wav(bytes: &[u8]) -> Result<AudioClip> {
    let mut reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| Error::Render(e.to_string()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Render(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Render(e.to_string()))?
        }
    };

    Ok(AudioClip::new(
        downmix(&interleaved, channels),
        spec.sample_rate,
    ))
}

/// Decode MP3 bytes to f32 samples
fn decode_mp3(mp3_data: &[u8]) -> Result<AudioClip> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0_u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(PLAYBACK_SAMPLE_RATE);
                let normalized: Vec<f32> =
                    frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                samples.extend(downmix(&normalized, frame.channels.max(1)));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Render(format!("MP3 decode error: {e}"))),
        }
    }

    if samples.is_empty() {
        return Err(Error::Render("no audio frames decoded".to_string()));
    }

    Ok(AudioClip::new(samples, sample_rate))
}

/// Average interleaved channels into mono
#[allow(clippy::cast_precision_loss)]
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// One-time, user-gesture-gated output unlock
///
/// Priming the device with a short silent clip is done at most once; later
/// calls return immediately.
pub struct AudioUnlock {
    sink: Arc<dyn AudioSink>,
    unlocked: AtomicBool,
    gate: tokio::sync::Mutex<()>,
}

impl AudioUnlock {
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self {
            sink,
            unlocked: AtomicBool::new(false),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Unlock output if not already done
    ///
    /// # Errors
    ///
    /// Returns the sink's error if priming fails; a later call retries
    pub async fn ensure_unlocked(&self) -> Result<()> {
        if self.is_unlocked() {
            return Ok(());
        }
        let _gate = self.gate.lock().await;
        if self.is_unlocked() {
            return Ok(());
        }

        self.sink
            .play(AudioClip::silence(
                PLAYBACK_SAMPLE_RATE,
                Duration::from_millis(20),
            ))
            .await?;
        self.unlocked.store(true, Ordering::Release);
        tracing::debug!("audio output unlocked");
        Ok(())
    }

    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.unlocked.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for AudioUnlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioUnlock")
            .field("unlocked", &self.is_unlocked())
            .finish_non_exhaustive()
    }
}
