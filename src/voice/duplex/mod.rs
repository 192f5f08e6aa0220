//! Full-duplex audio-to-audio provider
//!
//! The same session is both the input and the output provider; the
//! [`DuplexInput`] and [`DuplexOutput`] adapters expose its two halves
//! through the ordinary provider traits.

mod client;
pub mod protocol;

use std::sync::Arc;

use async_trait::async_trait;

pub use client::{DuplexClient, DuplexConfig, DuplexState, TurnTracker};

use super::events::InputEvents;
use super::stt::SpeechInput;
use super::tts::SpeechOutput;
use super::types::{
    InputLanguage, SequenceOutcome, SpeechChunk, SttProviderId, SttState, TtsProviderId, TtsState,
};
use crate::Result;

/// Inbound half: microphone into the session
pub struct DuplexInput {
    client: DuplexClient,
    events: Arc<dyn InputEvents>,
}

impl DuplexInput {
    pub fn new(client: DuplexClient, events: Arc<dyn InputEvents>) -> Self {
        Self { client, events }
    }
}

#[async_trait]
impl SpeechInput for DuplexInput {
    fn id(&self) -> SttProviderId {
        SttProviderId::FullDuplex
    }

    fn state(&self) -> SttState {
        if self.client.is_capturing() {
            SttState::Listening
        } else {
            SttState::Idle
        }
    }

    async fn start(&self, language: InputLanguage) -> Result<()> {
        if let Err(e) = self.client.start_capture(language).await {
            tracing::warn!(error = %e, "full-duplex session failed to start");
            self.events.on_error(&e);
            return Err(e);
        }
        Ok(())
    }

    async fn stop(&self, trigger_callback: bool) {
        self.client.disconnect(trigger_callback);
    }
}

/// Outbound half: model audio out of the session
///
/// Output follows the remote turn boundary, so `speak` has nothing to do.
pub struct DuplexOutput {
    client: DuplexClient,
}

impl DuplexOutput {
    pub const fn new(client: DuplexClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SpeechOutput for DuplexOutput {
    fn id(&self) -> TtsProviderId {
        TtsProviderId::FullDuplex
    }

    fn state(&self) -> TtsState {
        if self.client.is_speaking() {
            TtsState::Speaking
        } else {
            TtsState::Idle
        }
    }

    async fn speak(&self, chunks: Vec<SpeechChunk>) -> SequenceOutcome {
        tracing::debug!(
            chunks = chunks.len(),
            "full-duplex output is driven by the remote turn; ignoring chunks"
        );
        SequenceOutcome::Completed
    }

    fn stop(&self) {
        self.client.interrupt_playback();
    }

    fn cancel(&self) {
        self.client.interrupt_playback();
    }
}
