//! Text-to-speech providers
//!
//! Request/response voices share one [`SequencedOutput`] that plays chunks
//! strictly in order; they differ only in the [`ChunkRenderer`] that turns a
//! chunk into an audio asset.

mod device;
mod remote;
mod sequencer;

use async_trait::async_trait;

pub use device::DeviceSynthesizer;
pub use remote::{RemoteBackend, RemoteSpeech};
pub use sequencer::SequencedOutput;

use super::types::{SequenceOutcome, SpeechChunk, TtsProviderId, TtsState};
use crate::Result;

/// Provider-agnostic control surface for speech output
#[async_trait]
pub trait SpeechOutput: Send + Sync {
    /// Which provider this is
    fn id(&self) -> TtsProviderId;

    /// Current playback state
    fn state(&self) -> TtsState;

    /// Play every chunk with text, in order
    ///
    /// Returns [`SequenceOutcome::AlreadySpeaking`] without touching the
    /// running sequence if one is in progress.
    async fn speak(&self, chunks: Vec<SpeechChunk>) -> SequenceOutcome;

    /// Halt audio now; the sequence ends without sequence-complete
    fn stop(&self);

    /// Halt audio and end the sequence; sequence-complete still fires
    fn cancel(&self);
}

/// Turns one chunk into a playable asset (WAV or MP3 bytes)
#[async_trait]
pub trait ChunkRenderer: Send + Sync {
    /// # Errors
    ///
    /// Returns a render error if the asset could not be produced
    async fn render(&self, chunk: &SpeechChunk) -> Result<Vec<u8>>;
}

/// On-device voice
pub type DeviceOutput = SequencedOutput<DeviceSynthesizer>;

/// Server-rendered voice
pub type RemoteOutput = SequencedOutput<RemoteSpeech>;
