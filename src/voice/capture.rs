//! Audio capture from microphone
//!
//! A [`Microphone`] hands raw float blocks to a callback until its
//! [`CaptureHandle`] is released. On top of that sit the two capture modes:
//! block capture (keep everything for one recording) and streaming capture
//! (fixed-size PCM16 frames pushed to a channel as they fill).

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::mpsc;

use super::pcm::{PcmFramer, Recording};
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per streamed frame
pub const FRAME_SAMPLES: usize = 4096;

/// Callback receiving captured float blocks on the audio thread
pub type BlockCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Source of microphone audio
pub trait Microphone: Send + Sync {
    /// Acquire the device and start delivering blocks to `on_block`
    ///
    /// # Errors
    ///
    /// Returns a capture error if the device is missing or access is denied.
    /// No device handle outlives a failed call.
    fn open(&self, sample_rate: u32, on_block: BlockCallback) -> Result<CaptureHandle>;
}

/// Ownership of an open capture stream
///
/// Releasing (or dropping) the handle stops the device before returning.
pub struct CaptureHandle {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl CaptureHandle {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Stop the device and wait until no more callbacks can run
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("open", &self.release.is_some())
            .finish()
    }
}

/// Captures audio from the default input device
///
/// cpal streams are not `Send`, so each open stream lives on its own thread
/// which drops it when the handle is released.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalMicrophone;

impl CpalMicrophone {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn input_config(device: &cpal::Device, sample_rate: u32) -> Result<StreamConfig> {
        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Capture(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
            .ok_or_else(|| Error::Capture("no suitable audio config found".to_string()))?;

        Ok(supported_config
            .with_sample_rate(SampleRate(sample_rate))
            .config())
    }

    fn build_stream(sample_rate: u32, mut on_block: BlockCallback) -> Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Capture("no input device available".to_string()))?;
        let config = Self::input_config(&device, sample_rate)?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            "audio capture initialized"
        );

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| on_block(data),
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::Capture(e.to_string()))?;

        stream.play().map_err(|e| Error::Capture(e.to_string()))?;
        Ok(stream)
    }

    fn run_stream(
        sample_rate: u32,
        on_block: BlockCallback,
        ready: &std::sync::mpsc::Sender<Result<()>>,
        stop: &std::sync::mpsc::Receiver<()>,
    ) {
        match Self::build_stream(sample_rate, on_block) {
            Ok(stream) => {
                let _ = ready.send(Ok(()));
                // Blocks until the handle is released or dropped
                let _ = stop.recv();
                drop(stream);
                tracing::debug!("audio capture stopped");
            }
            Err(e) => {
                let _ = ready.send(Err(e));
            }
        }
    }
}

impl Microphone for CpalMicrophone {
    fn open(&self, sample_rate: u32, on_block: BlockCallback) -> Result<CaptureHandle> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let thread: JoinHandle<()> = std::thread::Builder::new()
            .name("parley-capture".to_string())
            .spawn(move || Self::run_stream(sample_rate, on_block, &ready_tx, &stop_rx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                tracing::debug!("audio capture started");
                Ok(CaptureHandle::new(move || {
                    let _ = stop_tx.send(());
                    if thread.join().is_err() {
                        tracing::warn!("capture thread panicked");
                    }
                }))
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Capture("capture thread exited".to_string()))
            }
        }
    }
}

/// Framing state of a streaming capture, shared with the audio callback
struct FrameTail {
    framer: PcmFramer,
    frames: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl FrameTail {
    fn push(&mut self, block: &[f32]) {
        let Some(frames) = &self.frames else {
            return;
        };
        for frame in self.framer.push(block) {
            let _ = frames.send(frame);
        }
    }

    /// Send the partial last frame and close the channel
    fn close(&mut self) {
        let Some(frames) = self.frames.take() else {
            return;
        };
        if let Some(frame) = self.framer.flush() {
            let _ = frames.send(frame);
        }
    }
}

/// One in-flight capture: the device handle plus the audio it accumulated
pub struct CaptureSession {
    handle: Option<CaptureHandle>,
    recording: Arc<Mutex<Recording>>,
    tail: Option<Arc<Mutex<FrameTail>>>,
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("handle", &self.handle)
            .field("streaming", &self.tail.is_some())
            .finish_non_exhaustive()
    }
}

impl CaptureSession {
    /// Block capture: every block is kept; optionally tapped for analysis
    ///
    /// # Errors
    ///
    /// Returns a capture error if the microphone cannot be opened
    pub fn start_block(
        mic: &dyn Microphone,
        sample_rate: u32,
        tap: Option<mpsc::UnboundedSender<Vec<f32>>>,
    ) -> Result<Self> {
        let recording = Arc::new(Mutex::new(Recording::new(sample_rate)));
        let sink = Arc::clone(&recording);

        let handle = mic.open(
            sample_rate,
            Box::new(move |block: &[f32]| {
                if let Ok(mut rec) = sink.lock() {
                    rec.push(block);
                }
                if let Some(tap) = &tap {
                    let _ = tap.send(block.to_vec());
                }
            }),
        )?;

        Ok(Self {
            handle: Some(handle),
            recording,
            tail: None,
        })
    }

    /// Streaming capture: blocks are re-framed into PCM16 frames of
    /// `frame_samples` and sent in capture order; raw audio is kept as well
    ///
    /// [`finish`](Self::finish) sends the partial last frame, then closes the
    /// channel, so the frames add up to the whole recording.
    ///
    /// # Errors
    ///
    /// Returns a capture error if the microphone cannot be opened
    pub fn start_streaming(
        mic: &dyn Microphone,
        sample_rate: u32,
        frame_samples: usize,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Vec<u8>>)> {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let recording = Arc::new(Mutex::new(Recording::new(sample_rate)));
        let sink = Arc::clone(&recording);
        let tail = Arc::new(Mutex::new(FrameTail {
            framer: PcmFramer::new(frame_samples),
            frames: Some(frame_tx),
        }));
        let framing = Arc::clone(&tail);

        let handle = mic.open(
            sample_rate,
            Box::new(move |block: &[f32]| {
                if let Ok(mut rec) = sink.lock() {
                    rec.push(block);
                }
                if let Ok(mut tail) = framing.lock() {
                    tail.push(block);
                }
            }),
        )?;

        Ok((
            Self {
                handle: Some(handle),
                recording,
                tail: Some(tail),
            },
            frame_rx,
        ))
    }

    /// Whether the device is still held
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.handle.is_some()
    }

    /// Samples captured so far
    #[must_use]
    pub fn snapshot(&self) -> Vec<f32> {
        self.recording
            .lock()
            .map(|rec| rec.samples())
            .unwrap_or_default()
    }

    /// Release the device, flush any partial frame, then hand over
    /// everything captured
    #[must_use]
    pub fn finish(mut self) -> Recording {
        if let Some(handle) = self.handle.take() {
            handle.release();
        }
        if let Some(tail) = self.tail.take() {
            if let Ok(mut tail) = tail.lock() {
                tail.close();
            }
        }
        self.recording
            .lock()
            .map(|mut rec| std::mem::take(&mut *rec))
            .unwrap_or_default()
    }
}
