//! Shared speech types: chunks, provider identifiers, states

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// One unit of output speech
///
/// Order within a sequence is significant and preserved through playback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechChunk {
    /// Text to render
    pub text: String,

    /// Two-letter language tag (e.g. "FR"); falls back to the learning language
    #[serde(default)]
    pub language: Option<String>,

    /// Caller-assigned identifier echoed in speak-start/speak-end events
    pub message_id: String,
}

impl SpeechChunk {
    /// Create a chunk
    pub fn new(
        text: impl Into<String>,
        language: Option<&str>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            language: language.map(ToString::to_string),
            message_id: message_id.into(),
        }
    }

    /// Whether there is anything to render
    #[must_use]
    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }

    /// One chunk per sentence of `text`, ids `{prefix}-1`, `{prefix}-2`, ...
    pub fn sentences(text: &str, language: Option<&str>, prefix: &str) -> Vec<Self> {
        split_sentences(text)
            .into_iter()
            .enumerate()
            .map(|(i, sentence)| Self::new(sentence, language, format!("{prefix}-{}", i + 1)))
            .collect()
    }
}

/// Split text after sentence-ending punctuation followed by whitespace
#[must_use]
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        let at_boundary = matches!(c, '.' | '!' | '?' | '…')
            && chars.peek().is_none_or(|next| next.is_whitespace());
        if at_boundary {
            let sentence = current.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            current.clear();
        }
    }
    let rest = current.trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }
    sentences
}

/// Speech-to-text provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SttProviderId {
    /// Discrete recognition; caller picks the language, recognizer ends the turn
    Manual,
    /// Continuous multilingual streaming with server-side end-of-turn
    Streaming,
    /// Input half of a full-duplex session
    FullDuplex,
}

/// Text-to-speech provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TtsProviderId {
    /// Local voice synthesis
    Device,
    /// Request/response rendering, `OpenAI`-style voices
    Openai,
    /// Request/response rendering, ElevenLabs-style voices
    Elevenlabs,
    /// Output half of a full-duplex session
    FullDuplex,
}

/// Relative output/recognition quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityTier {
    Basic,
    Standard,
    Premium,
}

/// Static description of what a provider can do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCapabilities {
    pub supports_auto_turn_detection: bool,
    pub is_multilingual: bool,
    pub requires_api_key: bool,
    pub quality: QualityTier,
}

impl SttProviderId {
    /// All STT providers, in preference order
    pub const ALL: [Self; 3] = [Self::Manual, Self::Streaming, Self::FullDuplex];

    /// Capability descriptor
    #[must_use]
    pub const fn capabilities(self) -> ProviderCapabilities {
        match self {
            Self::Manual => ProviderCapabilities {
                supports_auto_turn_detection: false,
                is_multilingual: false,
                requires_api_key: true,
                quality: QualityTier::Standard,
            },
            Self::Streaming => ProviderCapabilities {
                supports_auto_turn_detection: true,
                is_multilingual: true,
                requires_api_key: true,
                quality: QualityTier::Premium,
            },
            Self::FullDuplex => ProviderCapabilities {
                supports_auto_turn_detection: true,
                is_multilingual: true,
                requires_api_key: true,
                quality: QualityTier::Premium,
            },
        }
    }

    /// Stable name used in config files and on the command line
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Streaming => "streaming",
            Self::FullDuplex => "full-duplex",
        }
    }
}

impl TtsProviderId {
    /// All TTS providers, in preference order
    pub const ALL: [Self; 4] = [Self::Device, Self::Openai, Self::Elevenlabs, Self::FullDuplex];

    /// Capability descriptor
    #[must_use]
    pub const fn capabilities(self) -> ProviderCapabilities {
        match self {
            Self::Device => ProviderCapabilities {
                supports_auto_turn_detection: false,
                is_multilingual: true,
                requires_api_key: false,
                quality: QualityTier::Basic,
            },
            Self::Openai => ProviderCapabilities {
                supports_auto_turn_detection: false,
                is_multilingual: true,
                requires_api_key: true,
                quality: QualityTier::Standard,
            },
            Self::Elevenlabs => ProviderCapabilities {
                supports_auto_turn_detection: false,
                is_multilingual: true,
                requires_api_key: true,
                quality: QualityTier::Premium,
            },
            Self::FullDuplex => ProviderCapabilities {
                supports_auto_turn_detection: true,
                is_multilingual: true,
                requires_api_key: true,
                quality: QualityTier::Premium,
            },
        }
    }

    /// Whether the first playback must follow a user gesture
    #[must_use]
    pub const fn requires_unlock(self) -> bool {
        matches!(self, Self::Openai | Self::Elevenlabs)
    }

    /// Stable name used in config files and on the command line
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Openai => "openai",
            Self::Elevenlabs => "elevenlabs",
            Self::FullDuplex => "full-duplex",
        }
    }
}

impl fmt::Display for SttProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for TtsProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SttProviderId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "manual" | "browser" => Ok(Self::Manual),
            "streaming" | "deepgram" => Ok(Self::Streaming),
            "full-duplex" | "duplex" | "gemini" => Ok(Self::FullDuplex),
            other => Err(Error::Config(format!("unknown STT provider: {other}"))),
        }
    }
}

impl FromStr for TtsProviderId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "device" | "browser" | "system" => Ok(Self::Device),
            "openai" => Ok(Self::Openai),
            "elevenlabs" => Ok(Self::Elevenlabs),
            "full-duplex" | "duplex" | "gemini" => Ok(Self::FullDuplex),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

/// Which recognition grammar/voice the user is speaking in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputLanguage {
    #[default]
    English,
    Learning,
}

/// STT-side session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SttState {
    #[default]
    Idle,
    Listening,
    Processing,
}

/// TTS-side session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TtsState {
    #[default]
    Idle,
    Loading,
    Speaking,
}

/// Composite controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpeechState {
    #[default]
    Idle,
    Listening,
    Processing,
    Speaking,
}

impl SpeechState {
    /// Derive the overall state: listening > processing > speaking > idle
    #[must_use]
    pub fn derive(stt: SttState, tts: TtsState, processing: bool) -> Self {
        if stt == SttState::Listening {
            Self::Listening
        } else if processing || stt == SttState::Processing {
            Self::Processing
        } else if tts != TtsState::Idle {
            Self::Speaking
        } else {
            Self::Idle
        }
    }
}

/// A finished user turn handed to the caller
///
/// The orchestration layer keeps no copy of the audio after handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedTurn {
    /// Final transcript (may be empty for an explicit stop)
    pub transcript: String,

    /// Session identifier minted when listening started
    pub message_id: String,

    /// Language the turn was started with
    pub language: InputLanguage,

    /// Captured audio packaged as a 16-bit mono WAV file
    pub audio: Vec<u8>,

    /// Whether the caller ended the turn explicitly
    pub user_initiated: bool,
}

/// How a `speak` call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// All chunks were consumed
    Completed,
    /// `cancel()` ended the sequence early
    Cancelled,
    /// `stop()` halted audio; no sequence-complete was emitted
    Stopped,
    /// Another sequence was already playing; nothing changed
    AlreadySpeaking,
}

/// Map a two-letter language tag to the locale used for voice selection
#[must_use]
pub fn locale_for(tag: &str) -> String {
    let lower = tag.trim().to_lowercase();
    let locale = match lower.as_str() {
        "en" => "en-US",
        "fr" => "fr-FR",
        "es" => "es-ES",
        "de" => "de-DE",
        "it" => "it-IT",
        "pt" => "pt-BR",
        "nl" => "nl-NL",
        "ru" => "ru-RU",
        "ja" => "ja-JP",
        "zh" => "zh-CN",
        "ko" => "ko-KR",
        "ar" => "ar-SA",
        "hi" => "hi-IN",
        "sv" => "sv-SE",
        "pl" => "pl-PL",
        "tr" => "tr-TR",
        _ if lower.contains('-') => return tag.trim().to_string(),
        _ => return format!("{lower}-{}", lower.to_uppercase()),
    };
    locale.to_string()
}
