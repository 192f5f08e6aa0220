//! Parley Speech - speech orchestration for spoken AI tutoring
//!
//! This library sits between a conversational tutor and the audio hardware:
//! - Speech input through swappable recognizers (discrete, streaming, full-duplex)
//! - Speech output through swappable voices (on-device, remote, full-duplex)
//! - Routers that switch providers without tearing down a conversation
//! - A controller that derives one conversational state and forwards events
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      Caller                          │
//! │   transcript in  │  reply chunks out  │  callbacks  │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │               SpeechController                       │
//! │        SttRouter        │        TtsRouter           │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Providers                           │
//! │  manual │ streaming │ device │ remote │ full-duplex  │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │        Microphone capture  │  Audio playback         │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod voice;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use voice::{
    FinishedTurn, InputLanguage, LoggingEvents, SequenceOutcome, SpeechChunk, SpeechController,
    SpeechEvents, SpeechState, SttProviderId, TtsProviderId,
};
