//! Discrete recognition
//!
//! The caller picks the input language. Audio is block-captured while a local
//! endpoint detector watches for the end of the utterance; when it fires the
//! recording is transcribed and the turn stops itself. An explicit stop from
//! the caller always wins: if it lands while an automatic stop is still being
//! transcribed, the turn is reported as user-initiated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{LanguagePair, Recognizer, SpeechInput};
use crate::Result;
use crate::voice::capture::{CaptureSession, Microphone, SAMPLE_RATE};
use crate::voice::endpoint::{EndpointConfig, EndpointDetector};
use crate::voice::events::InputEvents;
use crate::voice::pcm::samples_to_wav;
use crate::voice::session::{SessionGuard, SessionToken};
use crate::voice::types::{FinishedTurn, InputLanguage, SttProviderId, SttState};

/// Settings for discrete recognition
#[derive(Debug, Clone, PartialEq)]
pub struct ManualConfig {
    pub sample_rate: u32,
    pub endpoint: EndpointConfig,
    /// Re-transcribe for an interim result every this many speech samples
    pub interim_samples: Option<usize>,
}

impl Default for ManualConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            endpoint: EndpointConfig::default(),
            interim_samples: Some(SAMPLE_RATE as usize * 2),
        }
    }
}

struct Active {
    token: SessionToken,
    language: InputLanguage,
    capture: CaptureSession,
    monitor: Option<JoinHandle<()>>,
}

struct Inner {
    mic: Arc<dyn Microphone>,
    recognizer: Arc<dyn Recognizer>,
    events: Arc<dyn InputEvents>,
    languages: LanguagePair,
    config: ManualConfig,
    guard: SessionGuard,
    active: Mutex<Option<Active>>,
    user_stop: AtomicBool,
    suppress_callback: AtomicBool,
}

/// Discrete recognition provider
pub struct ManualInput {
    inner: Arc<Inner>,
}

impl ManualInput {
    pub fn new(
        mic: Arc<dyn Microphone>,
        recognizer: Arc<dyn Recognizer>,
        events: Arc<dyn InputEvents>,
        languages: LanguagePair,
        config: ManualConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                mic,
                recognizer,
                events,
                languages,
                config,
                guard: SessionGuard::new(),
                active: Mutex::new(None),
                user_stop: AtomicBool::new(false),
                suppress_callback: AtomicBool::new(false),
            }),
        }
    }
}

impl Inner {
    fn take_active(&self, token: &SessionToken) -> Option<Active> {
        let mut active = self.active.lock().ok()?;
        if active.as_ref().is_some_and(|a| a.token == *token) {
            active.take()
        } else {
            None
        }
    }

    fn snapshot(&self) -> Vec<f32> {
        self.active
            .lock()
            .ok()
            .and_then(|active| active.as_ref().map(|a| a.capture.snapshot()))
            .unwrap_or_default()
    }

    /// Watches captured blocks for end-of-utterance and interim updates
    async fn monitor(
        self: Arc<Self>,
        token: SessionToken,
        language: InputLanguage,
        mut blocks: mpsc::UnboundedReceiver<Vec<f32>>,
    ) {
        let mut detector = EndpointDetector::new(self.config.endpoint);
        let mut next_interim = self.config.interim_samples;

        while let Some(block) = blocks.recv().await {
            if !self.guard.is_current(&token) {
                return;
            }

            if detector.process(&block) {
                tracing::debug!(session = %token, "recognizer finalized utterance");
                self.finish(token, false, true).await;
                return;
            }

            if let Some(threshold) = next_interim {
                if detector.speech_samples() >= threshold {
                    next_interim = self.config.interim_samples.map(|step| threshold + step);
                    self.interim(&token, language).await;
                }
            }
        }
    }

    async fn interim(&self, token: &SessionToken, language: InputLanguage) {
        let samples = self.snapshot();
        let wav = match samples_to_wav(&samples, self.config.sample_rate) {
            Ok(wav) => wav,
            Err(e) => {
                tracing::debug!(error = %e, "skipping interim result");
                return;
            }
        };
        let code = self.languages.code_for(language);

        match self.recognizer.transcribe(&wav, Some(code)).await {
            Ok(text) if self.guard.is_current(token) && !text.trim().is_empty() => {
                self.events.on_transcript(text.trim(), false);
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "interim transcription failed"),
        }
    }

    /// Finalize the turn if `token` is still live
    async fn finish(&self, token: SessionToken, user_initiated: bool, trigger_callback: bool) {
        if !self.guard.claim(&token) {
            return;
        }
        let Some(active) = self.take_active(&token) else {
            return;
        };

        if user_initiated {
            if let Some(monitor) = &active.monitor {
                monitor.abort();
            }
        }

        let language = active.language;
        let recording = active.capture.finish();
        tracing::debug!(
            session = %token,
            samples = recording.sample_count(),
            user_initiated,
            "manual session finished"
        );

        let audio = match recording.to_wav() {
            Ok(audio) => audio,
            Err(e) => {
                self.events.on_error(&e);
                return;
            }
        };

        let transcript = if recording.is_empty() {
            String::new()
        } else {
            let code = self.languages.code_for(language);
            match self.recognizer.transcribe(&audio, Some(code)).await {
                Ok(text) => text.trim().to_string(),
                Err(e) => {
                    tracing::warn!(error = %e, "recognition failed");
                    self.events.on_error(&e);
                    return;
                }
            }
        };

        let user_initiated = user_initiated || self.user_stop.load(Ordering::SeqCst);
        let emit = trigger_callback && !self.suppress_callback.load(Ordering::SeqCst);
        if !emit {
            return;
        }

        if !transcript.is_empty() {
            self.events.on_transcript(&transcript, true);
        }
        self.events.on_stop(FinishedTurn {
            transcript,
            message_id: token.id(),
            language,
            audio,
            user_initiated,
        });
    }
}

#[async_trait]
impl SpeechInput for ManualInput {
    fn id(&self) -> SttProviderId {
        SttProviderId::Manual
    }

    fn state(&self) -> SttState {
        if self.inner.guard.current().is_some() {
            SttState::Listening
        } else {
            SttState::Idle
        }
    }

    async fn start(&self, language: InputLanguage) -> Result<()> {
        let inner = &self.inner;
        if inner.guard.current().is_some() {
            tracing::warn!("manual recognition already listening");
            return Ok(());
        }

        inner.user_stop.store(false, Ordering::SeqCst);
        inner.suppress_callback.store(false, Ordering::SeqCst);
        let token = inner.guard.mint();

        let (tap_tx, tap_rx) = mpsc::unbounded_channel();
        let capture = match CaptureSession::start_block(
            inner.mic.as_ref(),
            inner.config.sample_rate,
            Some(tap_tx),
        ) {
            Ok(capture) => capture,
            Err(e) => {
                inner.guard.invalidate();
                tracing::warn!(error = %e, "microphone unavailable");
                inner.events.on_error(&e);
                return Err(e);
            }
        };

        if let Ok(mut active) = inner.active.lock() {
            *active = Some(Active {
                token,
                language,
                capture,
                monitor: None,
            });
        }

        // A stop that landed while the device was opening already claimed the token
        if !inner.guard.is_current(&token) {
            if let Some(stale) = inner.take_active(&token) {
                let recording = stale.capture.finish();
                tracing::debug!(
                    session = %token,
                    samples = recording.sample_count(),
                    "manual recognition stopped before it started"
                );
            }
            return Ok(());
        }

        tracing::info!(session = %token, ?language, "manual recognition started");
        inner.events.on_start(&token.id(), language);

        let monitor = tokio::spawn(Arc::clone(inner).monitor(token, language, tap_rx));
        if let Ok(mut active) = inner.active.lock() {
            match active.as_mut() {
                Some(a) if a.token == token => a.monitor = Some(monitor),
                _ => monitor.abort(),
            }
        }

        Ok(())
    }

    async fn stop(&self, trigger_callback: bool) {
        let inner = &self.inner;
        inner.user_stop.store(true, Ordering::SeqCst);
        if !trigger_callback {
            inner.suppress_callback.store(true, Ordering::SeqCst);
        }

        let Some(token) = inner.guard.current() else {
            return;
        };
        inner.finish(token, true, trigger_callback).await;
    }
}
