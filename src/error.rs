//! Error types for the speech orchestration layer

use thiserror::Error;

/// Result type alias for speech operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while capturing, recognizing, or rendering speech
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device or codec error
    #[error("audio error: {0}")]
    Audio(String),

    /// Microphone could not be acquired (missing device, permission denied)
    #[error("capture failed: {0}")]
    Capture(String),

    /// Provider-reported transcription error
    #[error("recognition failed: {0}")]
    Recognition(String),

    /// A single chunk failed to synthesize or play
    #[error("render failed: {0}")]
    Render(String),

    /// Output device refused to start until the user interacts
    #[error("playback requires interaction: {0}")]
    PlaybackBlocked(String),

    /// Persistent connection failed or closed unexpectedly
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or unrecognized inbound message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

/// Failure bucket an [`Error`] belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Device unavailable or denied; fatal to the session
    CaptureFailure,
    /// Transcription failed; session ends
    RecognitionFailure,
    /// One chunk failed; the sequence continues
    RenderFailure,
    /// Autoplay-style rejection that survived the unlock retry
    PlaybackBlocked,
    /// Connection error or unexpected close; session ends
    TransportFailure,
    /// Bad inbound message; logged and dropped
    ProtocolViolation,
    /// Configuration, IO, and everything else
    Other,
}

impl Error {
    /// Classify this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Capture(_) => ErrorKind::CaptureFailure,
            Self::Recognition(_) => ErrorKind::RecognitionFailure,
            Self::Render(_) | Self::Http(_) => ErrorKind::RenderFailure,
            Self::PlaybackBlocked(_) => ErrorKind::PlaybackBlocked,
            Self::Transport(_) | Self::WebSocket(_) => ErrorKind::TransportFailure,
            Self::Protocol(_) | Self::Serialization(_) => ErrorKind::ProtocolViolation,
            Self::Config(_) | Self::Audio(_) | Self::Io(_) | Self::Toml(_) => ErrorKind::Other,
        }
    }
}
