//! Event sinks
//!
//! Providers receive their sink once at construction. The controller bridges
//! the provider-level sinks onto the caller-facing [`SpeechEvents`].

use serde_json::Value;

use super::types::{FinishedTurn, InputLanguage};
use crate::Error;

/// Events emitted by a speech-input provider
pub trait InputEvents: Send + Sync {
    /// Capture started; `message_id` identifies the turn
    fn on_start(&self, message_id: &str, language: InputLanguage);

    /// Interim or final transcript text (the full text so far)
    fn on_transcript(&self, text: &str, is_final: bool);

    /// The turn was finalized
    fn on_stop(&self, turn: FinishedTurn);

    /// The session failed and returned to idle
    fn on_error(&self, error: &Error);
}

/// Events emitted by a speech-output provider
pub trait OutputEvents: Send + Sync {
    /// A chunk is about to render
    fn on_speak_start(&self, message_id: &str);

    /// A chunk finished rendering (successfully or not)
    fn on_speak_end(&self, message_id: &str);

    /// The whole sequence finished or was cancelled
    fn on_sequence_complete(&self);

    /// A chunk-level or session-level failure worth surfacing
    fn on_error(&self, error: &Error, context: Option<&str>);

    /// Text of what the agent is saying, when the provider knows it
    fn on_transcript(&self, _text: &str) {}

    /// Tool invocation requested by the remote model
    fn on_tool_call(&self, _call: &ToolCall) {}
}

/// A function call requested by a full-duplex model
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: Option<String>,
    pub name: String,
    pub args: Value,
}

/// Caller-facing callbacks of the speech controller
///
/// Every method has an empty default so callers implement only what they use.
#[allow(unused_variables)]
pub trait SpeechEvents: Send + Sync {
    fn on_user_speak_start(&self, message_id: &str, language: InputLanguage) {}

    fn on_user_transcript(&self, text: &str, is_final: bool) {}

    fn on_user_speak_complete(&self, turn: FinishedTurn) {}

    fn on_agent_speak_start(&self, message_id: &str) {}

    fn on_agent_speak_end(&self, message_id: &str) {}

    fn on_agent_speak_complete(&self) {}

    /// Agent speech as text, for full-duplex sessions that transcribe output
    fn on_agent_transcript(&self, text: &str) {}

    fn on_error(&self, error: &Error, context: Option<&str>) {}

    /// Tool invocation from a full-duplex model; execution is up to the caller
    fn on_tool_call(&self, call: &ToolCall) {}
}

/// Sink that only logs; useful before a caller is wired up
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEvents;

impl SpeechEvents for LoggingEvents {
    fn on_user_speak_start(&self, message_id: &str, language: InputLanguage) {
        tracing::debug!(message_id, ?language, "user speak start");
    }

    fn on_user_transcript(&self, text: &str, is_final: bool) {
        tracing::trace!(text, is_final, "user transcript");
    }

    fn on_user_speak_complete(&self, turn: FinishedTurn) {
        tracing::info!(
            message_id = %turn.message_id,
            transcript = %turn.transcript,
            audio_bytes = turn.audio.len(),
            "user speak complete"
        );
    }

    fn on_agent_speak_start(&self, message_id: &str) {
        tracing::debug!(message_id, "agent speak start");
    }

    fn on_agent_speak_end(&self, message_id: &str) {
        tracing::debug!(message_id, "agent speak end");
    }

    fn on_agent_speak_complete(&self) {
        tracing::debug!("agent speak complete");
    }

    fn on_agent_transcript(&self, text: &str) {
        tracing::trace!(text, "agent transcript");
    }

    fn on_error(&self, error: &Error, context: Option<&str>) {
        tracing::warn!(error = %error, context, "speech error");
    }

    fn on_tool_call(&self, call: &ToolCall) {
        tracing::info!(name = %call.name, "tool call ignored");
    }
}
