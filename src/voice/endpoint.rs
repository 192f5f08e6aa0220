//! End-of-utterance detection
//!
//! Local energy heuristic: an utterance is complete once enough speech has
//! been heard and it is followed by a long enough run of silence.

/// Default RMS energy above which a block counts as speech
pub const ENERGY_THRESHOLD: f32 = 0.03;

/// Default minimum speech before an utterance can end (0.3s at 16kHz)
pub const MIN_SPEECH_SAMPLES: usize = 4800;

/// Default trailing silence that ends an utterance (0.8s at 16kHz)
pub const SILENCE_SAMPLES: usize = 12_800;

/// Tunables for the detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EndpointConfig {
    pub energy_threshold: f32,
    pub min_speech_samples: usize,
    pub silence_samples: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            energy_threshold: ENERGY_THRESHOLD,
            min_speech_samples: MIN_SPEECH_SAMPLES,
            silence_samples: SILENCE_SAMPLES,
        }
    }
}

/// State of the endpoint detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Waiting for speech
    Idle,
    /// Speech heard, accumulating
    Speaking,
    /// Speech followed by enough silence
    Complete,
}

/// Tracks speech activity across captured blocks
#[derive(Debug)]
pub struct EndpointDetector {
    config: EndpointConfig,
    state: DetectorState,
    speech_samples: usize,
    silence_counter: usize,
}

impl EndpointDetector {
    #[must_use]
    pub const fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            state: DetectorState::Idle,
            speech_samples: 0,
            silence_counter: 0,
        }
    }

    /// Process one block; returns true exactly once, when the utterance ends
    pub fn process(&mut self, samples: &[f32]) -> bool {
        let energy = calculate_energy(samples);
        let is_speech = energy > self.config.energy_threshold;

        match self.state {
            DetectorState::Idle => {
                if is_speech {
                    self.state = DetectorState::Speaking;
                    self.speech_samples = samples.len();
                    self.silence_counter = 0;
                    tracing::trace!(energy, "speech detected");
                }
            }
            DetectorState::Speaking => {
                if is_speech {
                    self.speech_samples += samples.len();
                    self.silence_counter = 0;
                } else {
                    self.silence_counter += samples.len();
                }

                if self.silence_counter >= self.config.silence_samples {
                    if self.speech_samples >= self.config.min_speech_samples {
                        tracing::debug!(
                            speech_samples = self.speech_samples,
                            "utterance complete"
                        );
                        self.state = DetectorState::Complete;
                        return true;
                    }
                    // Too short to be an utterance (a click or a cough)
                    self.reset();
                }
            }
            DetectorState::Complete => {}
        }

        false
    }

    /// Samples of speech heard so far in this utterance
    #[must_use]
    pub const fn speech_samples(&self) -> usize {
        self.speech_samples
    }

    /// Reset detector to idle state
    pub const fn reset(&mut self) {
        self.state = DetectorState::Idle;
        self.speech_samples = 0;
        self.silence_counter = 0;
    }

    /// Get current state
    #[must_use]
    pub const fn state(&self) -> DetectorState {
        self.state
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize) -> Vec<f32> {
        vec![0.3; len]
    }

    #[test]
    fn test_energy_calculation() {
        let silence = vec![0.0f32; 100];
        assert!(calculate_energy(&silence) < 0.001);

        let loud = vec![0.5f32; 100];
        assert!(calculate_energy(&loud) > 0.4);
        assert!(calculate_energy(&[]) < f32::EPSILON);
    }

    #[test]
    fn silence_alone_never_completes() {
        let mut detector = EndpointDetector::new(EndpointConfig::default());
        for _ in 0..20 {
            assert!(!detector.process(&[0.0; 1600]));
        }
        assert_eq!(detector.state(), DetectorState::Idle);
    }

    #[test]
    fn speech_then_silence_completes_once() {
        let mut detector = EndpointDetector::new(EndpointConfig::default());
        assert!(!detector.process(&tone(8000)));
        assert_eq!(detector.state(), DetectorState::Speaking);

        assert!(!detector.process(&[0.0; 8000]));
        assert!(detector.process(&[0.0; 8000]));
        assert_eq!(detector.state(), DetectorState::Complete);
        assert!(!detector.process(&[0.0; 8000]));
    }

    #[test]
    fn short_blip_resets() {
        let mut detector = EndpointDetector::new(EndpointConfig::default());
        detector.process(&tone(800));
        assert_eq!(detector.state(), DetectorState::Speaking);
        assert!(!detector.process(&[0.0; SILENCE_SAMPLES]));
        assert_eq!(detector.state(), DetectorState::Idle);
    }
}
