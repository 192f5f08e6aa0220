//! TOML configuration file loading
//!
//! Supports `~/.config/parley/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ParleyConfigFile {
    #[serde(default)]
    pub speech: SpeechFileConfig,

    #[serde(default)]
    pub capture: CaptureFileConfig,

    #[serde(default)]
    pub manual: ManualFileConfig,

    #[serde(default)]
    pub streaming: StreamingFileConfig,

    #[serde(default)]
    pub remote_tts: RemoteTtsFileConfig,

    #[serde(default)]
    pub device_tts: DeviceTtsFileConfig,

    #[serde(default)]
    pub duplex: DuplexFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Provider selection and languages
#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    /// Initial input provider ("manual", "streaming", "full-duplex")
    pub stt_provider: Option<String>,

    /// Initial output provider ("device", "openai", "elevenlabs", "full-duplex")
    pub tts_provider: Option<String>,

    /// ISO code the user speaks natively (e.g. "en")
    pub native_language: Option<String>,

    /// ISO code of the language being learned (e.g. "fr")
    pub learning_language: Option<String>,
}

/// Microphone settings
#[derive(Debug, Default, Deserialize)]
pub struct CaptureFileConfig {
    pub sample_rate: Option<u32>,
    pub frame_samples: Option<usize>,
}

/// Discrete recognition settings
#[derive(Debug, Default, Deserialize)]
pub struct ManualFileConfig {
    /// "whisper" or "deepgram"
    pub backend: Option<String>,
    pub model: Option<String>,
    /// Interim re-transcription interval in speech samples (0 disables)
    pub interim_samples: Option<usize>,
    pub energy_threshold: Option<f32>,
    pub min_speech_samples: Option<usize>,
    pub silence_samples: Option<usize>,
}

/// Streaming recognition settings
#[derive(Debug, Default, Deserialize)]
pub struct StreamingFileConfig {
    pub url: Option<String>,
    pub model: Option<String>,
    pub keepalive_secs: Option<u64>,
    pub utterance_end_ms: Option<u32>,
    pub endpointing_ms: Option<u32>,
}

/// Server-rendered voice settings
#[derive(Debug, Default, Deserialize)]
pub struct RemoteTtsFileConfig {
    /// Rendering endpoint; vendor APIs are called directly when unset
    pub endpoint: Option<String>,
    pub openai_model: Option<String>,
    pub openai_voice: Option<String>,
    pub openai_speed: Option<f32>,
    pub elevenlabs_voice: Option<String>,
    pub elevenlabs_model: Option<String>,
}

/// On-device voice settings
#[derive(Debug, Default, Deserialize)]
pub struct DeviceTtsFileConfig {
    /// Synthesizer binary; located on `PATH` when unset
    pub command: Option<String>,
    pub words_per_minute: Option<u32>,
}

/// Full-duplex session settings
#[derive(Debug, Default, Deserialize)]
pub struct DuplexFileConfig {
    pub url: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub system_instruction: Option<String>,
    pub input_sample_rate: Option<u32>,
    pub output_sample_rate: Option<u32>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub elevenlabs: Option<String>,
    pub deepgram: Option<String>,
    pub gemini: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ParleyConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ParleyConfigFile {
    config_file_path().map_or_else(ParleyConfigFile::default, |path| load_from(&path))
}

/// Load a config file from an explicit path, falling back to defaults
pub fn load_from(path: &Path) -> ParleyConfigFile {
    if !path.exists() {
        return ParleyConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ParleyConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ParleyConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/parley/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("parley").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_parses() {
        let file: ParleyConfigFile = toml::from_str(
            r#"
            [speech]
            stt_provider = "streaming"
            learning_language = "es"

            [duplex]
            output_sample_rate = 24000
            "#,
        )
        .unwrap();
        assert_eq!(file.speech.stt_provider.as_deref(), Some("streaming"));
        assert_eq!(file.duplex.output_sample_rate, Some(24000));
        assert!(file.manual.backend.is_none());
    }

    #[test]
    fn invalid_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[speech\nstt_provider = ").unwrap();
        let file = load_from(&path);
        assert!(file.speech.stt_provider.is_none());
    }

    #[test]
    fn missing_file_is_default() {
        let file = load_from(Path::new("/nonexistent/parley/config.toml"));
        assert!(file.api_keys.openai.is_none());
    }
}
