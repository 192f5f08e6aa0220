//! Speech-to-text providers
//!
//! Every provider runs the same `idle -> listening -> idle` cycle and reports
//! through the [`InputEvents`](super::events::InputEvents) sink it was built
//! with. Finalization is guarded by a single-use session token, so a turn is
//! reported at most once whichever trigger fires first.

mod manual;
mod recognizer;
mod streaming;

use async_trait::async_trait;

pub use manual::{ManualConfig, ManualInput};
pub use recognizer::{Recognizer, SpeechToText};
pub use streaming::{
    ListenEvent, StreamAction, StreamingConfig, StreamingInput, TranscriptAccumulator,
};

use super::types::{InputLanguage, SttProviderId, SttState};
use crate::Result;

/// Provider-agnostic control surface for speech input
#[async_trait]
pub trait SpeechInput: Send + Sync {
    /// Which provider this is
    fn id(&self) -> SttProviderId;

    /// Current session state
    fn state(&self) -> SttState;

    /// Acquire the microphone and begin a turn
    ///
    /// Starting while already listening is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the capture or transport error that prevented the start; it has
    /// already been reported through `on_error` and the provider is idle again
    async fn start(&self, language: InputLanguage) -> Result<()>;

    /// End the current turn; safe to call in any state
    ///
    /// With `trigger_callback` false the turn ends without `on_stop`.
    async fn stop(&self, trigger_callback: bool);
}

/// ISO codes for the two input languages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguagePair {
    pub native: String,
    pub learning: String,
}

impl LanguagePair {
    pub fn new(native: impl Into<String>, learning: impl Into<String>) -> Self {
        Self {
            native: native.into(),
            learning: learning.into(),
        }
    }

    /// ISO 639-1 code for an input language
    #[must_use]
    pub fn code_for(&self, language: InputLanguage) -> &str {
        match language {
            InputLanguage::English => &self.native,
            InputLanguage::Learning => &self.learning,
        }
    }
}

impl Default for LanguagePair {
    fn default() -> Self {
        Self::new("en", "fr")
    }
}
