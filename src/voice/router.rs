//! Provider routers
//!
//! Each router holds every provider of its side, built up front, and forwards
//! control calls to the one that is active. The active id is read at call
//! time, never captured.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::stt::SpeechInput;
use super::tts::SpeechOutput;
use super::types::{
    InputLanguage, SequenceOutcome, SpeechChunk, SttProviderId, SttState, TtsProviderId, TtsState,
};
use crate::{Error, Result};

/// Routes speech input to the active provider
pub struct SttRouter {
    providers: HashMap<SttProviderId, Arc<dyn SpeechInput>>,
    active: Mutex<SttProviderId>,
    switching: tokio::sync::Mutex<()>,
}

impl SttRouter {
    pub fn new(initial: SttProviderId) -> Self {
        Self {
            providers: HashMap::new(),
            active: Mutex::new(initial),
            switching: tokio::sync::Mutex::new(()),
        }
    }

    /// Add a provider, replacing any with the same id
    pub fn register(&mut self, provider: Arc<dyn SpeechInput>) {
        self.providers.insert(provider.id(), provider);
    }

    #[must_use]
    pub fn has(&self, id: SttProviderId) -> bool {
        self.providers.contains_key(&id)
    }

    #[must_use]
    pub fn active_id(&self) -> SttProviderId {
        self.active
            .lock()
            .map(|id| *id)
            .unwrap_or(SttProviderId::Manual)
    }

    fn active(&self) -> Option<Arc<dyn SpeechInput>> {
        self.providers.get(&self.active_id()).cloned()
    }

    #[must_use]
    pub fn state(&self) -> SttState {
        self.active().map_or(SttState::Idle, |p| p.state())
    }

    /// Make `id` the active provider, stopping a live session on the old one first
    ///
    /// # Errors
    ///
    /// Returns a config error if no provider with `id` is registered
    pub async fn set_provider(&self, id: SttProviderId) -> Result<()> {
        if !self.has(id) {
            return Err(Error::Config(format!("speech input provider {id} is not available")));
        }
        let _switching = self.switching.lock().await;
        let previous = self.active_id();
        if previous == id {
            return Ok(());
        }

        if let Some(current) = self.active() {
            if current.state() != SttState::Idle {
                tracing::debug!(from = %previous, to = %id, "stopping active session before switch");
                current.stop(true).await;
            }
        }
        if let Ok(mut active) = self.active.lock() {
            *active = id;
        }
        tracing::info!(from = %previous, to = %id, "speech input provider switched");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns the provider's start error
    pub async fn start(&self, language: InputLanguage) -> Result<()> {
        let _switching = self.switching.lock().await;
        let id = self.active_id();
        let provider = self.providers.get(&id).cloned().ok_or_else(|| {
            Error::Config(format!("speech input provider {id} is not available"))
        })?;
        provider.start(language).await
    }

    pub async fn stop(&self, trigger_callback: bool) {
        if let Some(provider) = self.active() {
            provider.stop(trigger_callback).await;
        }
    }
}

/// Routes speech output to the active provider
pub struct TtsRouter {
    providers: HashMap<TtsProviderId, Arc<dyn SpeechOutput>>,
    active: Mutex<TtsProviderId>,
}

impl TtsRouter {
    pub fn new(initial: TtsProviderId) -> Self {
        Self {
            providers: HashMap::new(),
            active: Mutex::new(initial),
        }
    }

    /// Add a provider, replacing any with the same id
    pub fn register(&mut self, provider: Arc<dyn SpeechOutput>) {
        self.providers.insert(provider.id(), provider);
    }

    #[must_use]
    pub fn has(&self, id: TtsProviderId) -> bool {
        self.providers.contains_key(&id)
    }

    #[must_use]
    pub fn active_id(&self) -> TtsProviderId {
        self.active
            .lock()
            .map(|id| *id)
            .unwrap_or(TtsProviderId::Openai)
    }

    fn active(&self) -> Option<Arc<dyn SpeechOutput>> {
        self.providers.get(&self.active_id()).cloned()
    }

    #[must_use]
    pub fn state(&self) -> TtsState {
        self.active().map_or(TtsState::Idle, |p| p.state())
    }

    /// Make `id` the active provider, halting the old one if it is playing
    ///
    /// # Errors
    ///
    /// Returns a config error if no provider with `id` is registered
    pub fn set_provider(&self, id: TtsProviderId) -> Result<()> {
        if !self.has(id) {
            return Err(Error::Config(format!("speech output provider {id} is not available")));
        }
        let previous = self.active_id();
        if previous == id {
            return Ok(());
        }

        if let Some(current) = self.active() {
            if current.state() != TtsState::Idle {
                tracing::debug!(from = %previous, to = %id, "stopping playback before switch");
                current.stop();
            }
        }
        if let Ok(mut active) = self.active.lock() {
            *active = id;
        }
        tracing::info!(from = %previous, to = %id, "speech output provider switched");
        Ok(())
    }

    pub async fn speak(&self, chunks: Vec<SpeechChunk>) -> SequenceOutcome {
        self.speak_with(self.active_id(), chunks).await
    }

    /// Speak through the provider the caller believes is active
    ///
    /// If the active provider changed since the caller looked, the current one
    /// is used instead.
    pub async fn speak_with(
        &self,
        expected: TtsProviderId,
        chunks: Vec<SpeechChunk>,
    ) -> SequenceOutcome {
        let actual = self.active_id();
        if actual != expected {
            tracing::warn!(expected = %expected, actual = %actual, "provider changed before speak, using active one");
        }
        match self.providers.get(&actual).cloned() {
            Some(provider) => provider.speak(chunks).await,
            None => {
                tracing::warn!(provider = %actual, "no speech output provider registered");
                SequenceOutcome::Completed
            }
        }
    }

    pub fn stop(&self) {
        if let Some(provider) = self.active() {
            provider.stop();
        }
    }

    pub fn cancel(&self) {
        if let Some(provider) = self.active() {
            provider.cancel();
        }
    }
}
