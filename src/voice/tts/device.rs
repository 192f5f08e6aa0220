//! On-device voice via espeak-ng

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::ChunkRenderer;
use crate::voice::types::{SpeechChunk, locale_for};
use crate::{Error, Result};

/// Default speaking rate in words per minute
pub const WORDS_PER_MINUTE: u32 = 160;

/// Local synthesizer writing WAV to stdout
#[derive(Debug, Clone)]
pub struct DeviceSynthesizer {
    command: PathBuf,
    words_per_minute: u32,
    default_language: String,
}

impl DeviceSynthesizer {
    pub fn new(command: impl Into<PathBuf>, default_language: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            words_per_minute: WORDS_PER_MINUTE,
            default_language: default_language.into(),
        }
    }

    /// Find `espeak-ng` (or legacy `espeak`) on `PATH`
    ///
    /// # Errors
    ///
    /// Returns a config error if neither binary is installed
    pub fn locate(default_language: impl Into<String>) -> Result<Self> {
        let command = which::which("espeak-ng")
            .or_else(|_| which::which("espeak"))
            .map_err(|_| Error::Config("espeak-ng not found on PATH".to_string()))?;
        Ok(Self::new(command, default_language))
    }

    #[must_use]
    pub const fn with_words_per_minute(mut self, words_per_minute: u32) -> Self {
        self.words_per_minute = words_per_minute;
        self
    }

    /// Voice name for a chunk: locale from its tag, else the default language
    #[must_use]
    pub fn voice_for(&self, chunk: &SpeechChunk) -> String {
        let tag = chunk
            .language
            .as_deref()
            .filter(|tag| !tag.trim().is_empty())
            .unwrap_or(&self.default_language);
        locale_for(tag).to_lowercase()
    }
}

#[async_trait]
impl ChunkRenderer for DeviceSynthesizer {
    async fn render(&self, chunk: &SpeechChunk) -> Result<Vec<u8>> {
        let voice = self.voice_for(chunk);
        tracing::debug!(voice = %voice, message_id = %chunk.message_id, "synthesizing on device");

        let output = Command::new(&self.command)
            .arg("--stdout")
            .arg("-v")
            .arg(&voice)
            .arg("-s")
            .arg(self.words_per_minute.to_string())
            .arg(&chunk.text)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Render(format!("failed to run synthesizer: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Render(format!(
                "synthesizer exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        if output.stdout.is_empty() {
            return Err(Error::Render("synthesizer produced no audio".to_string()));
        }

        Ok(output.stdout)
    }
}
