//! Wire format of the full-duplex session
//!
//! Outbound control frames are JSON text. Inbound frames are demultiplexed:
//! binary payloads carry PCM16 audio unless they hold a JSON object, text
//! payloads are always JSON control messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::voice::events::ToolCall;
use crate::voice::pcm::{from_base64, to_base64};
use crate::{Error, Result};

/// Session parameters sent in the first frame
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    pub input_audio_transcription: Empty,
    pub output_audio_transcription: Empty,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Empty {}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoice,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoice {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

impl Setup {
    pub fn new(model: &str, voice: Option<&str>, instruction: Option<&str>) -> Self {
        Self {
            model: model.to_string(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: voice.map(|name| SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoice {
                            voice_name: name.to_string(),
                        },
                    },
                }),
            },
            system_instruction: instruction.map(|text| Content {
                role: None,
                parts: vec![Part {
                    text: Some(text.to_string()),
                    inline_data: None,
                }],
            }),
            input_audio_transcription: Empty {},
            output_audio_transcription: Empty {},
        }
    }
}

#[derive(Serialize)]
struct SetupFrame<'a> {
    setup: &'a Setup,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputFrame {
    realtime_input: RealtimeInput,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<Blob>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientContentFrame {
    client_content: ClientContent,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientContent {
    turns: Vec<Content>,
    turn_complete: bool,
}

/// First frame of every session
///
/// # Errors
///
/// Returns a serialization error if encoding fails
pub fn setup_frame(setup: &Setup) -> Result<String> {
    Ok(serde_json::to_string(&SetupFrame { setup })?)
}

/// One captured PCM16 frame, base64-encoded
///
/// # Errors
///
/// Returns a serialization error if encoding fails
pub fn audio_frame(pcm: &[u8], sample_rate: u32) -> Result<String> {
    let frame = RealtimeInputFrame {
        realtime_input: RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: format!("audio/pcm;rate={sample_rate}"),
                data: to_base64(pcm),
            }],
        },
    };
    Ok(serde_json::to_string(&frame)?)
}

/// A typed user turn
///
/// # Errors
///
/// Returns a serialization error if encoding fails
pub fn text_frame(text: &str) -> Result<String> {
    let frame = ClientContentFrame {
        client_content: ClientContent {
            turns: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: Some(text.to_string()),
                    inline_data: None,
                }],
            }],
            turn_complete: true,
        },
    };
    Ok(serde_json::to_string(&frame)?)
}

/// Inbound control message, before classification
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
    tool_call: Option<ToolCallMessage>,
    error: Option<Value>,
}

/// Model output for the current turn
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<InboundPart>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundPart {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub inline_data: Option<InboundBlob>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundBlob {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallMessage {
    #[serde(default)]
    function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

impl ServerContent {
    /// Decoded PCM16 payloads of every inline audio part, in order
    ///
    /// Parts that fail to decode are skipped and logged.
    #[must_use]
    pub fn audio(&self) -> Vec<Vec<u8>> {
        self.parts()
            .filter_map(|part| part.inline_data.as_ref())
            .filter(|blob| blob.mime_type.is_empty() || blob.mime_type.starts_with("audio/pcm"))
            .filter_map(|blob| match from_base64(&blob.data) {
                Ok(pcm) => Some(pcm),
                Err(e) => {
                    tracing::debug!(error = %e, "dropping undecodable inline audio");
                    None
                }
            })
            .collect()
    }

    /// Text parts of the model turn, concatenated
    #[must_use]
    pub fn text(&self) -> Option<String> {
        let text: String = self.parts().filter_map(|part| part.text.as_deref()).collect();
        (!text.is_empty()).then_some(text)
    }

    /// Whether the model produced any output in this message
    #[must_use]
    pub fn has_model_output(&self) -> bool {
        self.parts()
            .any(|part| part.text.is_some() || part.inline_data.is_some())
            || self
                .output_transcription
                .as_ref()
                .is_some_and(|t| !t.text.is_empty())
    }

    fn parts(&self) -> impl Iterator<Item = &InboundPart> {
        self.model_turn.iter().flat_map(|turn| turn.parts.iter())
    }
}

/// A classified inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Raw PCM16 at the output sample rate
    Audio(Vec<u8>),
    SetupComplete,
    Content(ServerContent),
    ToolCalls(Vec<ToolCall>),
    Error(String),
}

/// Classify a JSON control message
///
/// # Errors
///
/// Returns a protocol error for malformed or unrecognized messages
pub fn parse_control(text: &str) -> Result<Inbound> {
    let message: ServerMessage = serde_json::from_str(text)
        .map_err(|e| Error::Protocol(format!("malformed control message: {e}")))?;

    if message.setup_complete.is_some() {
        return Ok(Inbound::SetupComplete);
    }
    if let Some(content) = message.server_content {
        return Ok(Inbound::Content(content));
    }
    if let Some(tool_call) = message.tool_call {
        let calls = tool_call
            .function_calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.name,
                args: call.args,
            })
            .collect();
        return Ok(Inbound::ToolCalls(calls));
    }
    if let Some(error) = message.error {
        let detail = error
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), ToString::to_string);
        return Ok(Inbound::Error(detail));
    }

    Err(Error::Protocol("unrecognized control message".to_string()))
}

/// Classify a binary frame: JSON objects are control messages, anything else is audio
///
/// # Errors
///
/// Returns a protocol error if a JSON object frame is unrecognized
pub fn parse_binary(bytes: Vec<u8>) -> Result<Inbound> {
    let looks_like_json = bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{');
    if looks_like_json {
        if let Ok(text) = std::str::from_utf8(&bytes) {
            if serde_json::from_str::<serde::de::IgnoredAny>(text).is_ok() {
                return parse_control(text);
            }
        }
    }
    Ok(Inbound::Audio(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::pcm::encode_pcm16;

    #[test]
    fn setup_frame_shape() {
        let setup = Setup::new("models/live", Some("Puck"), Some("Be a tutor"));
        let json: Value = serde_json::from_str(&setup_frame(&setup).unwrap()).unwrap();
        assert_eq!(json["setup"]["model"], "models/live");
        assert_eq!(
            json["setup"]["generationConfig"]["responseModalities"][0],
            "AUDIO"
        );
        assert_eq!(
            json["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]
                ["voiceName"],
            "Puck"
        );
        assert_eq!(
            json["setup"]["systemInstruction"]["parts"][0]["text"],
            "Be a tutor"
        );
    }

    #[test]
    fn audio_frame_is_base64_pcm() {
        let pcm = encode_pcm16(&[0.0, 0.5]);
        let json: Value = serde_json::from_str(&audio_frame(&pcm, 16000).unwrap()).unwrap();
        let chunk = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(from_base64(chunk["data"].as_str().unwrap()).unwrap(), pcm);
    }

    #[test]
    fn text_frame_completes_turn() {
        let json: Value = serde_json::from_str(&text_frame("salut").unwrap()).unwrap();
        assert_eq!(json["clientContent"]["turnComplete"], true);
        assert_eq!(json["clientContent"]["turns"][0]["role"], "user");
    }

    #[test]
    fn classifies_control_messages() {
        assert_eq!(
            parse_control(r#"{"setupComplete":{}}"#).unwrap(),
            Inbound::SetupComplete
        );

        let Inbound::Content(content) = parse_control(
            r#"{"serverContent":{"modelTurn":{"parts":[{"text":"Bon"},{"text":"jour"}]},"turnComplete":true}}"#,
        )
        .unwrap() else {
            panic!("expected content");
        };
        assert!(content.turn_complete);
        assert_eq!(content.text().as_deref(), Some("Bonjour"));

        let Inbound::ToolCalls(calls) = parse_control(
            r#"{"toolCall":{"functionCalls":[{"id":"c1","name":"next_topic","args":{"level":2}}]}}"#,
        )
        .unwrap() else {
            panic!("expected tool call");
        };
        assert_eq!(calls[0].name, "next_topic");
        assert_eq!(calls[0].args["level"], 2);

        assert_eq!(
            parse_control(r#"{"error":{"code":400,"message":"bad setup"}}"#).unwrap(),
            Inbound::Error("bad setup".to_string())
        );
    }

    #[test]
    fn malformed_and_unknown_are_protocol_errors() {
        assert!(matches!(parse_control("not json"), Err(Error::Protocol(_))));
        assert!(matches!(
            parse_control(r#"{"usageMetadata":{}}"#),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn inline_audio_decodes_in_order() {
        let first = encode_pcm16(&[0.1]);
        let second = encode_pcm16(&[0.2]);
        let json = format!(
            r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"mimeType":"audio/pcm;rate=24000","data":"{}"}}}},{{"inlineData":{{"mimeType":"audio/pcm;rate=24000","data":"{}"}}}}]}}}}}}"#,
            to_base64(&first),
            to_base64(&second)
        );
        let Inbound::Content(content) = parse_control(&json).unwrap() else {
            panic!("expected content");
        };
        assert_eq!(content.audio(), vec![first, second]);
        assert!(content.has_model_output());
    }

    #[test]
    fn binary_frames_demux() {
        let pcm = encode_pcm16(&[0.25, -0.25]);
        assert_eq!(parse_binary(pcm.clone()).unwrap(), Inbound::Audio(pcm));
        assert_eq!(
            parse_binary(br#"{"setupComplete":{}}"#.to_vec()).unwrap(),
            Inbound::SetupComplete
        );
    }
}
