//! Server-rendered voices
//!
//! One request per chunk. Either a rendering endpoint that fronts the voice
//! vendors, or the vendor APIs called directly.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use super::ChunkRenderer;
use crate::voice::types::{SpeechChunk, TtsProviderId};
use crate::{Error, Result};

/// Where rendering requests go
pub enum RemoteBackend {
    /// Rendering endpoint taking `{text, language, learningLanguage, provider}`
    Endpoint { url: String },
    OpenAi {
        api_key: SecretString,
        model: String,
        voice: String,
        speed: f32,
        url: String,
    },
    ElevenLabs {
        api_key: SecretString,
        model: String,
        voice_id: String,
        base_url: String,
    },
}

impl std::fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Endpoint { url } => f.debug_struct("Endpoint").field("url", url).finish(),
            Self::OpenAi { model, voice, .. } => f
                .debug_struct("OpenAi")
                .field("model", model)
                .field("voice", voice)
                .finish_non_exhaustive(),
            Self::ElevenLabs {
                model, voice_id, ..
            } => f
                .debug_struct("ElevenLabs")
                .field("model", model)
                .field("voice_id", voice_id)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EndpointRequest<'a> {
    text: &'a str,
    language: &'a str,
    learning_language: &'a str,
    provider: &'a str,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    speed: f32,
}

#[derive(Serialize)]
struct ElevenLabsRequest<'a> {
    text: &'a str,
    model_id: &'a str,
}

/// Renders chunks over HTTP
#[derive(Debug)]
pub struct RemoteSpeech {
    client: reqwest::Client,
    provider: TtsProviderId,
    learning_language: String,
    backend: RemoteBackend,
}

impl RemoteSpeech {
    /// Render through the endpoint on behalf of `provider`
    pub fn endpoint(
        url: impl Into<String>,
        provider: TtsProviderId,
        learning_language: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            provider,
            learning_language: learning_language.into(),
            backend: RemoteBackend::Endpoint { url: url.into() },
        }
    }

    /// Call the `OpenAI` speech API directly
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn openai(
        api_key: SecretString,
        voice: String,
        speed: f32,
        model: String,
        learning_language: impl Into<String>,
    ) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            provider: TtsProviderId::Openai,
            learning_language: learning_language.into(),
            backend: RemoteBackend::OpenAi {
                api_key,
                model,
                voice,
                speed,
                url: "https://api.openai.com/v1/audio/speech".to_string(),
            },
        })
    }

    /// Call the ElevenLabs API directly
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn elevenlabs(
        api_key: SecretString,
        voice_id: String,
        model: String,
        learning_language: impl Into<String>,
    ) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config(
                "ElevenLabs API key required for TTS".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            provider: TtsProviderId::Elevenlabs,
            learning_language: learning_language.into(),
            backend: RemoteBackend::ElevenLabs {
                api_key,
                model,
                voice_id,
                base_url: "https://api.elevenlabs.io/v1/text-to-speech".to_string(),
            },
        })
    }

    /// Point a direct vendor backend at a different host
    #[must_use]
    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        let base = base.into();
        match &mut self.backend {
            RemoteBackend::Endpoint { url } | RemoteBackend::OpenAi { url, .. } => *url = base,
            RemoteBackend::ElevenLabs { base_url, .. } => *base_url = base,
        }
        self
    }

    #[must_use]
    pub const fn provider(&self) -> TtsProviderId {
        self.provider
    }

    fn language_of<'a>(&'a self, chunk: &'a SpeechChunk) -> &'a str {
        chunk
            .language
            .as_deref()
            .filter(|tag| !tag.trim().is_empty())
            .unwrap_or(&self.learning_language)
    }

    async fn fetch(&self, request: reqwest::RequestBuilder, vendor: &str) -> Result<Vec<u8>> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::Render(format!("{vendor} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Render(format!("{vendor} TTS error {status}: {body}")));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| Error::Render(format!("{vendor} audio download failed: {e}")))?;
        tracing::debug!(bytes = audio.len(), vendor, "rendered chunk");
        Ok(audio.to_vec())
    }
}

#[async_trait]
impl ChunkRenderer for RemoteSpeech {
    async fn render(&self, chunk: &SpeechChunk) -> Result<Vec<u8>> {
        match &self.backend {
            RemoteBackend::Endpoint { url } => {
                let body = EndpointRequest {
                    text: &chunk.text,
                    language: self.language_of(chunk),
                    learning_language: &self.learning_language,
                    provider: self.provider.as_str(),
                };
                self.fetch(self.client.post(url).json(&body), "render endpoint")
                    .await
            }
            RemoteBackend::OpenAi {
                api_key,
                model,
                voice,
                speed,
                url,
            } => {
                let body = OpenAiRequest {
                    model,
                    input: &chunk.text,
                    voice,
                    speed: *speed,
                };
                let request = self
                    .client
                    .post(url)
                    .header(
                        "Authorization",
                        format!("Bearer {}", api_key.expose_secret()),
                    )
                    .json(&body);
                self.fetch(request, "OpenAI").await
            }
            RemoteBackend::ElevenLabs {
                api_key,
                model,
                voice_id,
                base_url,
            } => {
                let body = ElevenLabsRequest {
                    text: &chunk.text,
                    model_id: model,
                };
                let request = self
                    .client
                    .post(format!("{base_url}/{voice_id}"))
                    .header("xi-api-key", api_key.expose_secret())
                    .json(&body);
                self.fetch(request, "ElevenLabs").await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_body_uses_camel_case_contract() {
        let body = EndpointRequest {
            text: "Bonjour",
            language: "FR",
            learning_language: "fr",
            provider: "openai",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["learningLanguage"], "fr");
        assert_eq!(json["provider"], "openai");
    }

    #[test]
    fn chunk_language_falls_back_to_learning_language() {
        let speech = RemoteSpeech::endpoint("http://localhost/tts", TtsProviderId::Openai, "de");
        let tagged = SpeechChunk::new("Hallo", Some("FR"), "1");
        let untagged = SpeechChunk::new("Hallo", None, "2");
        assert_eq!(speech.language_of(&tagged), "FR");
        assert_eq!(speech.language_of(&untagged), "de");
    }

    #[test]
    fn direct_vendors_need_keys() {
        let empty = || SecretString::from(String::new());
        assert!(RemoteSpeech::openai(empty(), "alloy".into(), 1.0, "tts-1".into(), "fr").is_err());
        assert!(RemoteSpeech::elevenlabs(empty(), "voice".into(), "model".into(), "fr").is_err());
    }

    #[test]
    fn debug_hides_api_key() {
        let speech = RemoteSpeech::openai(
            SecretString::from("sk-hidden".to_string()),
            "alloy".into(),
            1.0,
            "tts-1".into(),
            "fr",
        )
        .unwrap();
        assert!(!format!("{speech:?}").contains("sk-hidden"));
    }
}
