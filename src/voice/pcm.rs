//! Linear PCM helpers
//!
//! Float samples in `[-1.0, 1.0]` are converted to signed 16-bit
//! little-endian PCM for transports, and back for rendering.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::{Error, Result};

/// Convert one float sample to i16
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Convert float samples to 16-bit little-endian PCM bytes
#[must_use]
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| f32_to_i16(s).to_le_bytes())
        .collect()
}

/// Decode 16-bit little-endian PCM into normalized floats
///
/// A trailing odd byte is ignored.
#[must_use]
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect()
}

/// Base64-encode a PCM frame for a JSON control channel
#[must_use]
pub fn to_base64(pcm: &[u8]) -> String {
    STANDARD.encode(pcm)
}

/// Decode base64 audio carried inline in a JSON message
///
/// # Errors
///
/// Returns a protocol error if the payload is not valid base64
pub fn from_base64(data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data)
        .map_err(|e| Error::Protocol(format!("invalid base64 audio: {e}")))
}

/// Re-chunks an arbitrary sample stream into fixed-size PCM16 frames
#[derive(Debug)]
pub struct PcmFramer {
    frame_samples: usize,
    pending: Vec<f32>,
}

impl PcmFramer {
    #[must_use]
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
        }
    }

    /// Feed samples; returns every frame that became complete, in order
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let rest = self.pending.split_off(self.frame_samples);
            frames.push(encode_pcm16(&self.pending));
            self.pending = rest;
        }
        frames
    }

    /// Emit whatever is left as a short final frame
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(encode_pcm16(&std::mem::take(&mut self.pending)))
        }
    }
}

/// Raw audio blocks accumulated during one listening session
#[derive(Debug, Clone, Default)]
pub struct Recording {
    sample_rate: u32,
    segments: Vec<Vec<f32>>,
}

impl Recording {
    #[must_use]
    pub const fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            segments: Vec::new(),
        }
    }

    /// Append one captured block
    pub fn push(&mut self, block: &[f32]) {
        if !block.is_empty() {
            self.segments.push(block.to_vec());
        }
    }

    /// Number of blocks captured
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Total samples across all blocks
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sample_count() == 0
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// All samples in capture order
    #[must_use]
    pub fn samples(&self) -> Vec<f32> {
        self.segments.concat()
    }

    /// Package the blocks as one playable WAV file
    ///
    /// # Errors
    ///
    /// Returns error if WAV encoding fails
    pub fn to_wav(&self) -> Result<Vec<u8>> {
        samples_to_wav(&self.samples(), self.sample_rate)
    }
}

/// Convert f32 samples to 16-bit mono WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(f32_to_i16(sample))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
