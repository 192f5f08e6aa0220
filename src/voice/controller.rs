//! Speech session controller
//!
//! The controller is what a caller talks to. It owns one router per side,
//! keeps the full-duplex provider coupled across both, and derives a single
//! composite state from the two sides plus the caller-set processing flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::capture::{CpalMicrophone, Microphone};
use super::duplex::{DuplexClient, DuplexInput, DuplexOutput};
use super::events::{InputEvents, OutputEvents, SpeechEvents, ToolCall};
use super::playback::{AudioSink, AudioUnlock, CpalPlayback};
use super::router::{SttRouter, TtsRouter};
use super::stt::{ManualInput, Recognizer, SpeechToText, StreamingInput};
use super::tts::{ChunkRenderer, DeviceSynthesizer, RemoteSpeech, SequencedOutput};
use super::types::{
    FinishedTurn, InputLanguage, SequenceOutcome, SpeechChunk, SpeechState, SttProviderId,
    SttState, TtsProviderId,
};
use crate::config::{Config, RecognizerBackend};
use crate::{Error, Result};

/// Adapts provider-level events onto the caller's [`SpeechEvents`]
pub struct EventBridge {
    events: Arc<dyn SpeechEvents>,
}

impl EventBridge {
    pub fn new(events: Arc<dyn SpeechEvents>) -> Self {
        Self { events }
    }

    /// Bridge ready to hand to providers of both sides
    pub fn shared(events: Arc<dyn SpeechEvents>) -> Arc<Self> {
        Arc::new(Self::new(events))
    }
}

impl std::fmt::Debug for EventBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBridge").finish_non_exhaustive()
    }
}

impl InputEvents for EventBridge {
    fn on_start(&self, message_id: &str, language: InputLanguage) {
        self.events.on_user_speak_start(message_id, language);
    }

    fn on_transcript(&self, text: &str, is_final: bool) {
        self.events.on_user_transcript(text, is_final);
    }

    fn on_stop(&self, turn: FinishedTurn) {
        self.events.on_user_speak_complete(turn);
    }

    fn on_error(&self, error: &Error) {
        self.events.on_error(error, Some("listening"));
    }
}

impl OutputEvents for EventBridge {
    fn on_speak_start(&self, message_id: &str) {
        self.events.on_agent_speak_start(message_id);
    }

    fn on_speak_end(&self, message_id: &str) {
        self.events.on_agent_speak_end(message_id);
    }

    fn on_sequence_complete(&self) {
        self.events.on_agent_speak_complete();
    }

    fn on_error(&self, error: &Error, context: Option<&str>) {
        self.events.on_error(error, context);
    }

    fn on_transcript(&self, text: &str) {
        self.events.on_agent_transcript(text);
    }

    fn on_tool_call(&self, call: &ToolCall) {
        self.events.on_tool_call(call);
    }
}

/// Top-level speech state machine
pub struct SpeechController {
    events: Arc<dyn SpeechEvents>,
    stt: SttRouter,
    tts: TtsRouter,
    duplex: Option<DuplexClient>,
    unlock: Option<Arc<AudioUnlock>>,
    processing: AtomicBool,
}

impl std::fmt::Debug for SpeechController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechController")
            .field("stt", &self.stt.active_id())
            .field("tts", &self.tts.active_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SpeechController {
    pub fn new(events: Arc<dyn SpeechEvents>, stt: SttRouter, tts: TtsRouter) -> Self {
        Self {
            events,
            stt,
            tts,
            duplex: None,
            unlock: None,
            processing: AtomicBool::new(false),
        }
    }

    /// Shared unlock used by [`SpeechController::unlock_audio`]
    #[must_use]
    pub fn with_unlock(mut self, unlock: Arc<AudioUnlock>) -> Self {
        self.unlock = Some(unlock);
        self
    }

    /// Full-duplex session used for typed text turns
    #[must_use]
    pub fn with_duplex(mut self, client: DuplexClient) -> Self {
        self.duplex = Some(client);
        self
    }

    /// Build a controller on the default microphone and speakers
    ///
    /// # Errors
    ///
    /// Returns error if the output device cannot be opened
    pub fn from_config(config: &Config, events: Arc<dyn SpeechEvents>) -> Result<Self> {
        let mic: Arc<dyn Microphone> = Arc::new(CpalMicrophone::new());
        let sink: Arc<dyn AudioSink> = Arc::new(CpalPlayback::new()?);
        Ok(Self::with_devices(config, events, mic, sink))
    }

    /// Build every provider the configuration allows on the given devices
    ///
    /// Providers whose credentials or binaries are missing are left out and
    /// selecting them later fails with a config error.
    pub fn with_devices(
        config: &Config,
        events: Arc<dyn SpeechEvents>,
        mic: Arc<dyn Microphone>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        let bridge = EventBridge::shared(Arc::clone(&events));
        let input_events: Arc<dyn InputEvents> = bridge.clone();
        let output_events: Arc<dyn OutputEvents> = bridge;
        let unlock = Arc::new(AudioUnlock::new(Arc::clone(&sink)));
        let learning = config.languages.learning.clone();

        let mut stt = SttRouter::new(config.stt_provider);
        let mut tts = TtsRouter::new(config.tts_provider);

        match build_recognizer(config) {
            Ok(recognizer) => stt.register(Arc::new(ManualInput::new(
                Arc::clone(&mic),
                recognizer,
                Arc::clone(&input_events),
                config.languages.clone(),
                config.manual.recognition.clone(),
            ))),
            Err(e) => tracing::warn!(error = %e, "manual recognition unavailable"),
        }

        stt.register(Arc::new(StreamingInput::new(
            Arc::clone(&mic),
            Arc::clone(&input_events),
            config.streaming.clone(),
        )));

        let duplex = DuplexClient::new(
            config.duplex.clone(),
            Arc::clone(&mic),
            Arc::clone(&sink),
            Arc::clone(&input_events),
            Arc::clone(&output_events),
        );
        stt.register(Arc::new(DuplexInput::new(
            duplex.clone(),
            Arc::clone(&input_events),
        )));
        tts.register(Arc::new(DuplexOutput::new(duplex.clone())));

        let synthesizer = config.device_tts.command.as_ref().map_or_else(
            || DeviceSynthesizer::locate(learning.clone()),
            |command| Ok(DeviceSynthesizer::new(command, learning.clone())),
        );
        match synthesizer {
            Ok(synthesizer) => tts.register(sequenced(
                TtsProviderId::Device,
                synthesizer.with_words_per_minute(config.device_tts.words_per_minute),
                &sink,
                &output_events,
                &unlock,
            )),
            Err(e) => tracing::warn!(error = %e, "on-device speech unavailable"),
        }

        for id in [TtsProviderId::Openai, TtsProviderId::Elevenlabs] {
            match build_remote(config, id) {
                Ok(renderer) => tts.register(sequenced(
                    renderer.provider(),
                    renderer,
                    &sink,
                    &output_events,
                    &unlock,
                )),
                Err(e) => tracing::warn!(provider = %id, error = %e, "remote speech unavailable"),
            }
        }

        Self::new(events, stt, tts)
            .with_unlock(unlock)
            .with_duplex(duplex)
    }

    #[must_use]
    pub fn stt_provider(&self) -> SttProviderId {
        self.stt.active_id()
    }

    #[must_use]
    pub fn tts_provider(&self) -> TtsProviderId {
        self.tts.active_id()
    }

    #[must_use]
    pub fn stt_state(&self) -> SttState {
        self.stt.state()
    }

    /// Composite state: listening > processing > speaking > idle
    #[must_use]
    pub fn state(&self) -> SpeechState {
        SpeechState::derive(
            self.stt.state(),
            self.tts.state(),
            self.processing.load(Ordering::Acquire),
        )
    }

    /// Mark that the caller is working on a reply
    pub fn set_processing(&self, processing: bool) {
        self.processing.store(processing, Ordering::Release);
    }

    /// Start a listening session, stopping a live one first
    ///
    /// # Errors
    ///
    /// Returns the provider's start error; it has already been reported
    /// through `on_error` by the provider when it failed mid-start.
    pub async fn start_listening(&self, language: Option<InputLanguage>) -> Result<()> {
        let language = language.unwrap_or_default();
        if self.stt.state() != SttState::Idle {
            tracing::debug!(provider = %self.stt.active_id(), "listening session still live, stopping it first");
            self.stt.stop(true).await;
        }
        tracing::debug!(provider = %self.stt.active_id(), ?language, "start listening");
        self.stt.start(language).await
    }

    /// End the listening session; safe to call when nothing is listening
    pub async fn stop_listening(&self, trigger_callback: bool) {
        self.stt.stop(trigger_callback).await;
    }

    /// Speak the chunks in order through the active output provider
    pub async fn speak(&self, chunks: Vec<SpeechChunk>) -> SequenceOutcome {
        let outcome = self.tts.speak_with(self.tts.active_id(), chunks).await;
        if outcome == SequenceOutcome::AlreadySpeaking {
            tracing::warn!("already speaking, new sequence ignored");
        }
        outcome
    }

    pub fn stop_speaking(&self) {
        self.tts.stop();
    }

    pub fn cancel_speaking(&self) {
        self.tts.cancel();
    }

    /// Select the input provider
    ///
    /// Full-duplex is selected on both sides or neither.
    ///
    /// # Errors
    ///
    /// Returns a config error if the provider (or its coupled counterpart)
    /// is not available
    pub async fn set_stt_provider(&self, id: SttProviderId) -> Result<()> {
        if id == SttProviderId::FullDuplex {
            self.select_duplex().await;
            return self.ensure_duplex();
        }

        self.stt.set_provider(id).await?;
        if self.tts.active_id() == TtsProviderId::FullDuplex {
            let fallback = self.fallback_tts()?;
            self.tts.set_provider(fallback)?;
        }
        Ok(())
    }

    /// Select the output provider
    ///
    /// Full-duplex is selected on both sides or neither.
    ///
    /// # Errors
    ///
    /// Returns a config error if the provider (or its coupled counterpart)
    /// is not available
    pub async fn set_tts_provider(&self, id: TtsProviderId) -> Result<()> {
        if id == TtsProviderId::FullDuplex {
            self.select_duplex().await;
            return self.ensure_duplex();
        }

        self.tts.set_provider(id)?;
        if self.stt.active_id() == SttProviderId::FullDuplex {
            let fallback = self.fallback_stt()?;
            self.stt.set_provider(fallback).await?;
        }
        Ok(())
    }

    async fn select_duplex(&self) {
        if let Err(e) = self.stt.set_provider(SttProviderId::FullDuplex).await {
            tracing::warn!(error = %e, "cannot select full-duplex input");
        }
        if let Err(e) = self.tts.set_provider(TtsProviderId::FullDuplex) {
            tracing::warn!(error = %e, "cannot select full-duplex output");
        }
    }

    fn ensure_duplex(&self) -> Result<()> {
        if self.stt.active_id() == SttProviderId::FullDuplex
            && self.tts.active_id() == TtsProviderId::FullDuplex
        {
            Ok(())
        } else {
            Err(Error::Config("full-duplex provider is not available".to_string()))
        }
    }

    fn fallback_tts(&self) -> Result<TtsProviderId> {
        [TtsProviderId::Openai, TtsProviderId::Elevenlabs, TtsProviderId::Device]
            .into_iter()
            .find(|id| self.tts.has(*id))
            .ok_or_else(|| Error::Config("no speech output provider besides full-duplex".to_string()))
    }

    fn fallback_stt(&self) -> Result<SttProviderId> {
        [SttProviderId::Manual, SttProviderId::Streaming]
            .into_iter()
            .find(|id| self.stt.has(*id))
            .ok_or_else(|| Error::Config("no speech input provider besides full-duplex".to_string()))
    }

    /// Unlock remote playback after a user gesture
    ///
    /// # Errors
    ///
    /// Returns error if the output device refuses to start
    pub async fn unlock_audio(&self) -> Result<()> {
        match &self.unlock {
            Some(unlock) => unlock.ensure_unlocked().await,
            None => Ok(()),
        }
    }

    /// Send a typed turn into the live full-duplex session
    ///
    /// # Errors
    ///
    /// Returns error if full-duplex is not selected or the session is not
    /// active yet
    pub fn send_text(&self, text: &str) -> Result<()> {
        if self.stt.active_id() != SttProviderId::FullDuplex {
            return Err(Error::Config(
                "typed turns need the full-duplex provider".to_string(),
            ));
        }
        let client = self
            .duplex
            .as_ref()
            .ok_or_else(|| Error::Config("full-duplex provider is not available".to_string()))?;
        client.send_text(text)
    }

    /// Stop everything without emitting turn events
    pub async fn shutdown(&self) {
        self.stt.stop(false).await;
        self.tts.stop();
        if let Some(client) = &self.duplex {
            client.disconnect(false);
        }
        tracing::debug!("speech controller shut down");
    }

    /// Report an error raised outside of any provider
    pub fn report(&self, error: &Error, context: Option<&str>) {
        self.events.on_error(error, context);
    }
}

/// Put a renderer behind the chunk sequencer; voices that play remote audio
/// unlock the output first
fn sequenced<R: ChunkRenderer + 'static>(
    id: TtsProviderId,
    renderer: R,
    sink: &Arc<dyn AudioSink>,
    events: &Arc<dyn OutputEvents>,
    unlock: &Arc<AudioUnlock>,
) -> Arc<SequencedOutput<R>> {
    let output = SequencedOutput::new(id, renderer, Arc::clone(sink), Arc::clone(events));
    if id.requires_unlock() {
        Arc::new(output.with_unlock(Arc::clone(unlock)))
    } else {
        Arc::new(output)
    }
}

fn build_recognizer(config: &Config) -> Result<Arc<dyn Recognizer>> {
    let model = config.manual.model.clone();
    let recognizer = match config.manual.backend {
        RecognizerBackend::Whisper => {
            let key = config.api_keys.openai.clone().ok_or_else(|| {
                Error::Config("OPENAI_API_KEY is required for whisper recognition".to_string())
            })?;
            SpeechToText::new_whisper(key, model)?
        }
        RecognizerBackend::Deepgram => {
            let key = config.api_keys.deepgram.clone().ok_or_else(|| {
                Error::Config("DEEPGRAM_API_KEY is required for deepgram recognition".to_string())
            })?;
            SpeechToText::new_deepgram(key, model)?
        }
    };
    Ok(Arc::new(recognizer))
}

fn build_remote(config: &Config, id: TtsProviderId) -> Result<RemoteSpeech> {
    let remote = &config.remote_tts;
    let learning = config.languages.learning.clone();
    if let Some(url) = &remote.endpoint {
        return Ok(RemoteSpeech::endpoint(url.clone(), id, learning));
    }

    match id {
        TtsProviderId::Elevenlabs => {
            let key = config.api_keys.elevenlabs.clone().ok_or_else(|| {
                Error::Config("ELEVENLABS_API_KEY or a rendering endpoint is required".to_string())
            })?;
            RemoteSpeech::elevenlabs(
                key,
                remote.elevenlabs_voice.clone(),
                remote.elevenlabs_model.clone(),
                learning,
            )
        }
        _ => {
            let key = config.api_keys.openai.clone().ok_or_else(|| {
                Error::Config("OPENAI_API_KEY or a rendering endpoint is required".to_string())
            })?;
            RemoteSpeech::openai(
                key,
                remote.openai_voice.clone(),
                remote.openai_speed,
                remote.openai_model.clone(),
                learning,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::voice::pcm::samples_to_wav;
    use crate::voice::playback::{AudioClip, PLAYBACK_SAMPLE_RATE, PcmStream};
    use crate::voice::tts::SpeechOutput;

    /// Refuses the first play as needing interaction
    #[derive(Default)]
    struct RefusingSink {
        refused: AtomicBool,
        plays: AtomicUsize,
    }

    #[async_trait]
    impl AudioSink for RefusingSink {
        async fn play(&self, _clip: AudioClip) -> Result<()> {
            if !self.refused.swap(true, Ordering::SeqCst) {
                return Err(Error::PlaybackBlocked("needs a gesture".to_string()));
            }
            self.plays.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn halt(&self) {}

        fn open_stream(&self, _sample_rate: u32) -> Result<Box<dyn PcmStream>> {
            Err(Error::Audio("no stream".to_string()))
        }
    }

    struct QuietRenderer;

    #[async_trait]
    impl ChunkRenderer for QuietRenderer {
        async fn render(&self, _chunk: &SpeechChunk) -> Result<Vec<u8>> {
            samples_to_wav(&[0.0; 240], PLAYBACK_SAMPLE_RATE)
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl SpeechEvents for Recorder {
        fn on_user_speak_start(&self, message_id: &str, _language: InputLanguage) {
            self.calls.lock().unwrap().push(format!("user-start:{message_id}"));
        }

        fn on_agent_speak_end(&self, message_id: &str) {
            self.calls.lock().unwrap().push(format!("agent-end:{message_id}"));
        }

        fn on_error(&self, _error: &Error, context: Option<&str>) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("error:{}", context.unwrap_or("-")));
        }
    }

    #[test]
    fn bridge_maps_both_sides() {
        let recorder = Arc::new(Recorder::default());
        let bridge = EventBridge::new(recorder.clone());
        InputEvents::on_start(&bridge, "m1", InputLanguage::Learning);
        OutputEvents::on_speak_end(&bridge, "a1");
        InputEvents::on_error(&bridge, &Error::Capture("denied".to_string()));
        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec!["user-start:m1", "agent-end:a1", "error:listening"]
        );
    }

    #[test]
    fn empty_controller_is_idle() {
        let controller = SpeechController::new(
            Arc::new(Recorder::default()),
            SttRouter::new(SttProviderId::Manual),
            TtsRouter::new(TtsProviderId::Openai),
        );
        assert_eq!(controller.state(), SpeechState::Idle);
        controller.set_processing(true);
        assert_eq!(controller.state(), SpeechState::Processing);
    }

    async fn speak_once(id: TtsProviderId) -> (usize, Vec<String>) {
        let recorder = Arc::new(Recorder::default());
        let events: Arc<dyn OutputEvents> = EventBridge::shared(recorder.clone());
        let sink = Arc::new(RefusingSink::default());
        let device: Arc<dyn AudioSink> = sink.clone();
        let unlock = Arc::new(AudioUnlock::new(Arc::clone(&device)));

        let output = sequenced(id, QuietRenderer, &device, &events, &unlock);
        let outcome = output
            .speak(vec![SpeechChunk::new("Bonjour.", None, "1")])
            .await;
        assert_eq!(outcome, SequenceOutcome::Completed);
        let calls = recorder.calls.lock().unwrap().clone();
        (sink.plays.load(Ordering::SeqCst), calls)
    }

    #[tokio::test]
    async fn remote_voices_retry_after_unlock() {
        for id in [TtsProviderId::Openai, TtsProviderId::Elevenlabs] {
            // The priming clip and the retried chunk both play
            let (plays, calls) = speak_once(id).await;
            assert_eq!(plays, 2, "{id}");
            assert_eq!(calls, vec!["agent-end:1"], "{id}");
        }
    }

    #[tokio::test]
    async fn device_voice_skips_refused_chunk() {
        let (plays, calls) = speak_once(TtsProviderId::Device).await;
        assert_eq!(plays, 0);
        assert_eq!(calls, vec!["error:1", "agent-end:1"]);
    }

    #[test]
    fn report_reaches_caller_with_context() {
        let recorder = Arc::new(Recorder::default());
        let controller = SpeechController::new(
            recorder.clone(),
            SttRouter::new(SttProviderId::Manual),
            TtsRouter::new(TtsProviderId::Openai),
        );
        controller.report(&Error::Transport("closed".to_string()), Some("text turn"));
        assert_eq!(*recorder.calls.lock().unwrap(), vec!["error:text turn"]);
    }

    #[test]
    fn typed_text_requires_duplex() {
        let controller = SpeechController::new(
            Arc::new(Recorder::default()),
            SttRouter::new(SttProviderId::Manual),
            TtsRouter::new(TtsProviderId::Openai),
        );
        assert!(matches!(controller.send_text("salut"), Err(Error::Config(_))));
    }
}
