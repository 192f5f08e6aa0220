//! Speech input and output
//!
//! Capture and playback sit at the bottom, the swappable providers above
//! them, the routers above those, and the [`SpeechController`] on top.

pub mod capture;
pub mod controller;
pub mod duplex;
pub mod endpoint;
pub mod events;
pub mod pcm;
pub mod playback;
pub mod router;
pub mod session;
pub mod stt;
pub mod tts;
pub mod types;

pub use capture::{CpalMicrophone, Microphone, SAMPLE_RATE};
pub use controller::{EventBridge, SpeechController};
pub use events::{InputEvents, LoggingEvents, OutputEvents, SpeechEvents, ToolCall};
pub use playback::{AudioSink, CpalPlayback};
pub use router::{SttRouter, TtsRouter};
pub use types::{
    FinishedTurn, InputLanguage, SequenceOutcome, SpeechChunk, SpeechState, SttProviderId,
    SttState, TtsProviderId, TtsState,
};
