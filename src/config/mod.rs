//! Configuration management for the speech layer
//!
//! Precedence is env > TOML file > defaults. Resolution is a pure function of
//! the parsed file and an env lookup so it can be exercised without touching
//! the process environment.

pub mod file;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::voice::capture::{FRAME_SAMPLES, SAMPLE_RATE};
use crate::voice::duplex::DuplexConfig;
use crate::voice::endpoint::EndpointConfig;
use crate::voice::stt::{LanguagePair, ManualConfig, StreamingConfig};
use crate::voice::{SttProviderId, TtsProviderId};
use crate::{Error, Result};

use file::ParleyConfigFile;

/// Speech layer configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Input provider active at startup
    pub stt_provider: SttProviderId,

    /// Output provider active at startup
    pub tts_provider: TtsProviderId,

    /// Native and learning language codes
    pub languages: LanguagePair,

    pub capture: CaptureConfig,

    pub manual: ManualSettings,

    pub streaming: StreamingConfig,

    pub remote_tts: RemoteTtsConfig,

    pub device_tts: DeviceTtsConfig,

    pub duplex: DuplexConfig,

    pub api_keys: ApiKeys,
}

/// Microphone settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub frame_samples: usize,
}

/// Batch recognizer behind discrete recognition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecognizerBackend {
    #[default]
    Whisper,
    Deepgram,
}

impl FromStr for RecognizerBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "whisper" | "openai" => Ok(Self::Whisper),
            "deepgram" => Ok(Self::Deepgram),
            other => Err(Error::Config(format!("unknown recognizer backend: {other}"))),
        }
    }
}

/// Discrete recognition settings
#[derive(Debug, Clone, PartialEq)]
pub struct ManualSettings {
    pub backend: RecognizerBackend,
    pub model: String,
    pub recognition: ManualConfig,
}

/// Server-rendered voice settings
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTtsConfig {
    /// Rendering endpoint; vendor APIs are called directly when unset
    pub endpoint: Option<String>,
    pub openai_model: String,
    pub openai_voice: String,
    pub openai_speed: f32,
    pub elevenlabs_voice: String,
    pub elevenlabs_model: String,
}

/// On-device voice settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTtsConfig {
    /// Synthesizer binary; located on `PATH` when unset
    pub command: Option<PathBuf>,
    pub words_per_minute: u32,
}

/// API keys for external services
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (Whisper and speech)
    pub openai: Option<SecretString>,

    /// `ElevenLabs` API key
    pub elevenlabs: Option<SecretString>,

    /// `Deepgram` API key (streaming and batch recognition)
    pub deepgram: Option<SecretString>,

    /// Gemini API key (full-duplex sessions)
    pub gemini: Option<SecretString>,
}

impl Config {
    /// Load configuration from the config file and the process environment
    ///
    /// # Errors
    ///
    /// Returns error if a provider id or backend name is invalid
    pub fn load() -> Result<Self> {
        Self::resolve(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an env lookup
    ///
    /// # Errors
    ///
    /// Returns error if a provider id or backend name is invalid
    #[allow(clippy::too_many_lines)]
    pub fn resolve(fc: ParleyConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let secret = |var: &str, file: Option<String>| {
            env(var)
                .or(file)
                .filter(|key| !key.trim().is_empty())
                .map(SecretString::from)
        };

        // API keys (env > toml > None)
        let api_keys = ApiKeys {
            openai: secret("OPENAI_API_KEY", fc.api_keys.openai),
            elevenlabs: secret("ELEVENLABS_API_KEY", fc.api_keys.elevenlabs),
            deepgram: secret("DEEPGRAM_API_KEY", fc.api_keys.deepgram),
            gemini: secret("GEMINI_API_KEY", fc.api_keys.gemini),
        };

        let mut stt_provider = env("PARLEY_STT_PROVIDER")
            .or(fc.speech.stt_provider)
            .map(|id| id.parse::<SttProviderId>())
            .transpose()?
            .unwrap_or(SttProviderId::Manual);
        let mut tts_provider = env("PARLEY_TTS_PROVIDER")
            .or(fc.speech.tts_provider)
            .map(|id| id.parse::<TtsProviderId>())
            .transpose()?
            .unwrap_or(TtsProviderId::Openai);

        // Full-duplex cannot be mixed with anything else
        if stt_provider == SttProviderId::FullDuplex || tts_provider == TtsProviderId::FullDuplex {
            if stt_provider != SttProviderId::FullDuplex || tts_provider != TtsProviderId::FullDuplex {
                tracing::info!("full-duplex selected on one side, using it for both");
            }
            stt_provider = SttProviderId::FullDuplex;
            tts_provider = TtsProviderId::FullDuplex;
        }

        let languages = LanguagePair::new(
            env("PARLEY_NATIVE_LANGUAGE")
                .or(fc.speech.native_language)
                .unwrap_or_else(|| "en".to_string()),
            env("PARLEY_LEARNING_LANGUAGE")
                .or(fc.speech.learning_language)
                .unwrap_or_else(|| "fr".to_string()),
        );

        let capture = CaptureConfig {
            sample_rate: fc.capture.sample_rate.unwrap_or(SAMPLE_RATE),
            frame_samples: fc.capture.frame_samples.unwrap_or(FRAME_SAMPLES),
        };

        let backend = env("PARLEY_RECOGNIZER")
            .or(fc.manual.backend)
            .map(|name| name.parse::<RecognizerBackend>())
            .transpose()?
            .unwrap_or_default();
        let endpoint_defaults = EndpointConfig::default();
        let manual_defaults = ManualConfig::default();
        let manual = ManualSettings {
            backend,
            model: fc.manual.model.unwrap_or_else(|| match backend {
                RecognizerBackend::Whisper => "whisper-1".to_string(),
                RecognizerBackend::Deepgram => "nova-3".to_string(),
            }),
            recognition: ManualConfig {
                sample_rate: capture.sample_rate,
                endpoint: EndpointConfig {
                    energy_threshold: fc
                        .manual
                        .energy_threshold
                        .unwrap_or(endpoint_defaults.energy_threshold),
                    min_speech_samples: fc
                        .manual
                        .min_speech_samples
                        .unwrap_or(endpoint_defaults.min_speech_samples),
                    silence_samples: fc
                        .manual
                        .silence_samples
                        .unwrap_or(endpoint_defaults.silence_samples),
                },
                interim_samples: match fc.manual.interim_samples {
                    Some(0) => None,
                    Some(samples) => Some(samples),
                    None => manual_defaults.interim_samples,
                },
            },
        };

        let streaming_defaults = StreamingConfig::default();
        let streaming = StreamingConfig {
            url: env("PARLEY_STREAMING_URL")
                .or(fc.streaming.url)
                .unwrap_or(streaming_defaults.url),
            model: fc.streaming.model.unwrap_or(streaming_defaults.model),
            api_key: api_keys.deepgram.clone(),
            sample_rate: capture.sample_rate,
            frame_samples: capture.frame_samples,
            keepalive: fc
                .streaming
                .keepalive_secs
                .map_or(streaming_defaults.keepalive, Duration::from_secs),
            utterance_end_ms: fc
                .streaming
                .utterance_end_ms
                .unwrap_or(streaming_defaults.utterance_end_ms),
            endpointing_ms: fc
                .streaming
                .endpointing_ms
                .unwrap_or(streaming_defaults.endpointing_ms),
        };

        let remote_tts = RemoteTtsConfig {
            endpoint: env("PARLEY_TTS_ENDPOINT").or(fc.remote_tts.endpoint),
            openai_model: fc
                .remote_tts
                .openai_model
                .unwrap_or_else(|| "tts-1".to_string()),
            openai_voice: fc
                .remote_tts
                .openai_voice
                .unwrap_or_else(|| "alloy".to_string()),
            openai_speed: fc.remote_tts.openai_speed.unwrap_or(1.0),
            elevenlabs_voice: fc
                .remote_tts
                .elevenlabs_voice
                .unwrap_or_else(|| "21m00Tcm4TlvDq8ikWAM".to_string()),
            elevenlabs_model: fc
                .remote_tts
                .elevenlabs_model
                .unwrap_or_else(|| "eleven_multilingual_v2".to_string()),
        };

        let device_tts = DeviceTtsConfig {
            command: fc.device_tts.command.map(PathBuf::from),
            words_per_minute: fc.device_tts.words_per_minute.unwrap_or(160),
        };

        let duplex_defaults = DuplexConfig::default();
        let duplex = DuplexConfig {
            url: env("PARLEY_DUPLEX_URL")
                .or(fc.duplex.url)
                .unwrap_or(duplex_defaults.url),
            model: fc.duplex.model.unwrap_or(duplex_defaults.model),
            api_key: api_keys.gemini.clone(),
            voice: fc.duplex.voice,
            system_instruction: fc.duplex.system_instruction,
            input_sample_rate: fc
                .duplex
                .input_sample_rate
                .unwrap_or(duplex_defaults.input_sample_rate),
            output_sample_rate: fc
                .duplex
                .output_sample_rate
                .unwrap_or(duplex_defaults.output_sample_rate),
            frame_samples: capture.frame_samples,
        };

        Ok(Self {
            stt_provider,
            tts_provider,
            languages,
            capture,
            manual,
            streaming,
            remote_tts,
            device_tts,
            duplex,
            api_keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn resolve(toml_text: &str, env: &[(&str, &str)]) -> Result<Config> {
        let file: ParleyConfigFile = toml::from_str(toml_text).unwrap();
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::resolve(file, |key| env.get(key).cloned())
    }

    #[test]
    fn defaults_without_file_or_env() {
        let config = resolve("", &[]).unwrap();
        assert_eq!(config.stt_provider, SttProviderId::Manual);
        assert_eq!(config.tts_provider, TtsProviderId::Openai);
        assert_eq!(config.languages, LanguagePair::new("en", "fr"));
        assert_eq!(config.capture.sample_rate, 16000);
        assert_eq!(config.duplex.output_sample_rate, 24000);
        assert_eq!(config.manual.model, "whisper-1");
        assert!(config.api_keys.openai.is_none());
    }

    #[test]
    fn env_beats_file() {
        let config = resolve(
            "[speech]\nlearning_language = \"es\"\n[api_keys]\nopenai = \"from-file\"",
            &[("PARLEY_LEARNING_LANGUAGE", "de"), ("OPENAI_API_KEY", "from-env")],
        )
        .unwrap();
        assert_eq!(config.languages.learning, "de");
        assert_eq!(
            config.api_keys.openai.unwrap().expose_secret(),
            "from-env"
        );
    }

    #[test]
    fn service_keys_flow_into_connections() {
        let config = resolve(
            "",
            &[("DEEPGRAM_API_KEY", "dg"), ("GEMINI_API_KEY", "gm")],
        )
        .unwrap();
        assert_eq!(config.streaming.api_key.unwrap().expose_secret(), "dg");
        assert_eq!(config.duplex.api_key.unwrap().expose_secret(), "gm");
    }

    #[test]
    fn full_duplex_on_one_side_selects_both() {
        let config = resolve("[speech]\ntts_provider = \"full-duplex\"", &[]).unwrap();
        assert_eq!(config.stt_provider, SttProviderId::FullDuplex);
        assert_eq!(config.tts_provider, TtsProviderId::FullDuplex);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        assert!(matches!(
            resolve("", &[("PARLEY_STT_PROVIDER", "carrier-pigeon")]),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn zero_interim_disables_interim_results() {
        let config = resolve("[manual]\ninterim_samples = 0\nbackend = \"deepgram\"", &[]).unwrap();
        assert!(config.manual.recognition.interim_samples.is_none());
        assert_eq!(config.manual.backend, RecognizerBackend::Deepgram);
        assert_eq!(config.manual.model, "nova-3");
    }
}
