//! Shared test utilities
//!
//! Fakes for every hardware and network seam so the speech layer can be
//! driven without audio devices or vendor accounts.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use parley_speech::voice::capture::{BlockCallback, CaptureHandle, Microphone};
use parley_speech::voice::events::ToolCall;
use parley_speech::voice::pcm::samples_to_wav;
use parley_speech::voice::playback::{AudioClip, AudioSink, PLAYBACK_SAMPLE_RATE, PcmStream};
use parley_speech::voice::stt::Recognizer;
use parley_speech::voice::tts::ChunkRenderer;
use parley_speech::{Error, FinishedTurn, InputLanguage, Result, SpeechChunk, SpeechEvents};
use tokio::sync::Notify;

pub const RATE: u32 = 16_000;

/// Generate sine wave audio samples
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Generate silence
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn generate_silence(duration_secs: f32) -> Vec<f32> {
    vec![0.0; (RATE as f32 * duration_secs) as usize]
}

/// Split audio into capture-sized blocks
pub fn blocks(samples: &[f32], size: usize) -> Vec<Vec<f32>> {
    samples.chunks(size).map(<[f32]>::to_vec).collect()
}

/// A spoken utterance followed by enough silence to end it
pub fn utterance_blocks() -> Vec<Vec<f32>> {
    let mut samples = generate_sine_samples(220.0, 0.6, 0.4);
    samples.extend(generate_silence(1.0));
    blocks(&samples, 1600)
}

/// Speech that never ends on its own
pub fn open_speech_blocks() -> Vec<Vec<f32>> {
    blocks(&generate_sine_samples(220.0, 0.2, 0.4), 1600)
}

/// Microphone that delivers a fixed script of blocks as soon as it opens
#[derive(Default)]
pub struct ScriptedMic {
    script: Mutex<Vec<Vec<f32>>>,
    fail: AtomicBool,
    pub opened: AtomicUsize,
    pub released: Arc<AtomicUsize>,
}

impl ScriptedMic {
    pub fn new(script: Vec<Vec<f32>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            ..Self::default()
        })
    }

    /// Every open fails with a capture error
    pub fn denied() -> Arc<Self> {
        let mic = Self::default();
        mic.fail.store(true, Ordering::SeqCst);
        Arc::new(mic)
    }

    pub fn set_script(&self, script: Vec<Vec<f32>>) {
        *self.script.lock().unwrap() = script;
    }

    /// Handles opened and not yet released
    pub fn live_handles(&self) -> usize {
        self.opened.load(Ordering::SeqCst) - self.released.load(Ordering::SeqCst)
    }
}

impl Microphone for ScriptedMic {
    fn open(&self, _sample_rate: u32, mut on_block: BlockCallback) -> Result<CaptureHandle> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Capture("permission denied".to_string()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        for block in self.script.lock().unwrap().iter() {
            on_block(block);
        }
        let released = Arc::clone(&self.released);
        Ok(CaptureHandle::new(move || {
            released.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

/// Output device that records what it was asked to play
pub struct FakeSink {
    play_time: Duration,
    halted: Notify,
    blocked: AtomicUsize,
    pub plays: AtomicUsize,
    pub halts: AtomicUsize,
    pub streamed: Arc<Mutex<Vec<usize>>>,
    pub flushes: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
}

impl FakeSink {
    pub fn new(play_time: Duration) -> Arc<Self> {
        Arc::new(Self {
            play_time,
            halted: Notify::new(),
            blocked: AtomicUsize::new(0),
            plays: AtomicUsize::new(0),
            halts: AtomicUsize::new(0),
            streamed: Arc::new(Mutex::new(Vec::new())),
            flushes: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The next `count` plays are refused as needing interaction
    pub fn block_next(&self, count: usize) {
        self.blocked.store(count, Ordering::SeqCst);
    }

    pub fn streamed_samples(&self) -> usize {
        self.streamed.lock().unwrap().iter().sum()
    }
}

#[async_trait]
impl AudioSink for FakeSink {
    async fn play(&self, _clip: AudioClip) -> Result<()> {
        let refused = self
            .blocked
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::PlaybackBlocked("autoplay refused".to_string()));
        }
        self.plays.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            () = tokio::time::sleep(self.play_time) => {}
            () = self.halted.notified() => {}
        }
        Ok(())
    }

    fn halt(&self) {
        self.halts.fetch_add(1, Ordering::SeqCst);
        self.halted.notify_waiters();
    }

    fn open_stream(&self, _sample_rate: u32) -> Result<Box<dyn PcmStream>> {
        Ok(Box::new(FakeStream {
            pushed: Arc::clone(&self.streamed),
            flushes: Arc::clone(&self.flushes),
            closes: Arc::clone(&self.closes),
        }))
    }
}

struct FakeStream {
    pushed: Arc<Mutex<Vec<usize>>>,
    flushes: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl PcmStream for FakeStream {
    fn push(&mut self, samples: &[f32]) {
        self.pushed.lock().unwrap().push(samples.len());
    }

    fn flush(&mut self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Recognizer returning a canned transcript
pub struct FakeRecognizer {
    transcript: String,
    delay: Duration,
    pub languages: Mutex<Vec<Option<String>>>,
}

impl FakeRecognizer {
    pub fn new(transcript: &str) -> Arc<Self> {
        Self::slow(transcript, Duration::ZERO)
    }

    pub fn slow(transcript: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            transcript: transcript.to_string(),
            delay,
            languages: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Recognizer for FakeRecognizer {
    async fn transcribe(&self, wav: &[u8], language: Option<&str>) -> Result<String> {
        assert!(wav.starts_with(b"RIFF"));
        self.languages
            .lock()
            .unwrap()
            .push(language.map(ToString::to_string));
        tokio::time::sleep(self.delay).await;
        Ok(self.transcript.clone())
    }
}

/// Renderer producing a short WAV clip; chunks whose text contains "broken" fail
#[derive(Default)]
pub struct FakeRenderer {
    pub rendered: Mutex<Vec<String>>,
}

#[async_trait]
impl ChunkRenderer for FakeRenderer {
    async fn render(&self, chunk: &SpeechChunk) -> Result<Vec<u8>> {
        self.rendered.lock().unwrap().push(chunk.text.clone());
        if chunk.text.contains("broken") {
            return Err(Error::Render("synthesizer exited with status 1".to_string()));
        }
        samples_to_wav(&[0.0; 240], PLAYBACK_SAMPLE_RATE)
    }
}

/// Everything the caller-facing callbacks reported
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    UserStart(String, InputLanguage),
    UserTranscript(String, bool),
    UserComplete(FinishedTurn),
    AgentStart(String),
    AgentEnd(String),
    AgentComplete,
    AgentTranscript(String),
    Error(String, Option<String>),
    ToolCall(String),
}

/// Event recorder with async waiting
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    changed: Notify,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
        self.changed.notify_waiters();
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    pub fn completed_turns(&self) -> Vec<FinishedTurn> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::UserComplete(turn) => Some(turn.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn agent_trail(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                Event::AgentStart(id) => Some(format!("start:{id}")),
                Event::AgentEnd(id) => Some(format!("end:{id}")),
                Event::AgentComplete => Some("complete".to_string()),
                _ => None,
            })
            .collect()
    }

    /// Wait up to two seconds for `pred` to hold
    pub async fn wait_for(&self, pred: impl Fn(&[Event]) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let changed = self.changed.notified();
            if pred(&self.events.lock().unwrap()) {
                return true;
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return pred(&self.events.lock().unwrap());
            }
        }
    }

    pub async fn wait_for_turns(&self, n: usize) -> bool {
        self.wait_for(|events| {
            events
                .iter()
                .filter(|e| matches!(e, Event::UserComplete(_)))
                .count()
                >= n
        })
        .await
    }
}

impl SpeechEvents for Recorder {
    fn on_user_speak_start(&self, message_id: &str, language: InputLanguage) {
        self.push(Event::UserStart(message_id.to_string(), language));
    }

    fn on_user_transcript(&self, text: &str, is_final: bool) {
        self.push(Event::UserTranscript(text.to_string(), is_final));
    }

    fn on_user_speak_complete(&self, turn: FinishedTurn) {
        self.push(Event::UserComplete(turn));
    }

    fn on_agent_speak_start(&self, message_id: &str) {
        self.push(Event::AgentStart(message_id.to_string()));
    }

    fn on_agent_speak_end(&self, message_id: &str) {
        self.push(Event::AgentEnd(message_id.to_string()));
    }

    fn on_agent_speak_complete(&self) {
        self.push(Event::AgentComplete);
    }

    fn on_agent_transcript(&self, text: &str) {
        self.push(Event::AgentTranscript(text.to_string()));
    }

    fn on_error(&self, error: &Error, context: Option<&str>) {
        self.push(Event::Error(error.to_string(), context.map(ToString::to_string)));
    }

    fn on_tool_call(&self, call: &ToolCall) {
        self.push(Event::ToolCall(call.name.clone()));
    }
}
