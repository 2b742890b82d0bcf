//! Energy-based voice-activity detector.
//!
//! Runs over the most recent window of samples on every appended chunk.
//! Speech starts once RMS energy stays above the threshold for the minimum
//! speech duration; it stops after the minimum silence duration. Timestamps
//! are sample-derived milliseconds since the session started.

#[derive(Debug, Clone)]
pub struct VadConfig {
    /// RMS threshold separating speech from silence.
    pub energy_threshold: f32,
    /// Silence needed before speech is considered ended.
    pub min_silence_ms: u64,
    /// Sustained energy needed before speech is considered started.
    pub min_speech_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.01,
            min_silence_ms: 500,
            min_speech_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    None,
    SpeechStart,
    SpeechEnd,
}

#[derive(Debug, Default)]
pub struct SimpleVad {
    config: VadConfig,
    speech_active: bool,
    /// Consecutive energetic/quiet time, in ms.
    energetic_ms: u64,
    quiet_ms: u64,
    /// Total audio time processed, in ms.
    clock_ms: u64,
    speech_start_ms: u64,
    speech_end_ms: u64,
}

impl SimpleVad {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn set_config(&mut self, config: VadConfig) {
        self.config = config;
    }

    pub fn is_speech_active(&self) -> bool {
        self.speech_active
    }

    pub fn speech_start_ms(&self) -> u64 {
        self.speech_start_ms
    }

    pub fn speech_end_ms(&self) -> u64 {
        self.speech_end_ms
    }

    pub fn reset(&mut self) {
        let config = self.config.clone();
        *self = Self::new(config);
    }

    /// Feed the most recent window of normalized samples.
    pub fn process(&mut self, samples: &[f32], sample_rate: u32) -> VadEvent {
        if samples.is_empty() {
            return VadEvent::None;
        }
        let window_ms = (samples.len() as u64 * 1000) / sample_rate as u64;
        self.clock_ms += window_ms;

        let rms = root_mean_square(samples);
        let energetic = rms >= self.config.energy_threshold;

        if energetic {
            self.energetic_ms += window_ms;
            self.quiet_ms = 0;
        } else {
            self.quiet_ms += window_ms;
            self.energetic_ms = 0;
        }

        if !self.speech_active && self.energetic_ms >= self.config.min_speech_ms {
            self.speech_active = true;
            self.speech_start_ms = self.clock_ms.saturating_sub(self.energetic_ms);
            return VadEvent::SpeechStart;
        }

        if self.speech_active && self.quiet_ms >= self.config.min_silence_ms {
            self.speech_active = false;
            self.speech_end_ms = self.clock_ms.saturating_sub(self.quiet_ms);
            return VadEvent::SpeechEnd;
        }

        VadEvent::None
    }
}

fn root_mean_square(samples: &[f32]) -> f32 {
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 16_000;

    fn loud(ms: u64) -> Vec<f32> {
        vec![0.5; (RATE as u64 * ms / 1000) as usize]
    }

    fn quiet(ms: u64) -> Vec<f32> {
        vec![0.0001; (RATE as u64 * ms / 1000) as usize]
    }

    #[test]
    fn test_speech_start_after_min_duration() {
        let mut vad = SimpleVad::new(VadConfig::default());
        assert_eq!(vad.process(&loud(100), RATE), VadEvent::None);
        assert_eq!(vad.process(&loud(100), RATE), VadEvent::SpeechStart);
        assert!(vad.is_speech_active());
    }

    #[test]
    fn test_speech_end_after_min_silence() {
        let mut vad = SimpleVad::new(VadConfig::default());
        vad.process(&loud(100), RATE);
        vad.process(&loud(100), RATE);
        assert!(vad.is_speech_active());

        assert_eq!(vad.process(&quiet(300), RATE), VadEvent::None);
        assert_eq!(vad.process(&quiet(300), RATE), VadEvent::SpeechEnd);
        assert!(!vad.is_speech_active());
    }

    #[test]
    fn test_brief_noise_does_not_trigger() {
        let mut vad = SimpleVad::new(VadConfig::default());
        assert_eq!(vad.process(&loud(100), RATE), VadEvent::None);
        assert_eq!(vad.process(&quiet(100), RATE), VadEvent::None);
        assert_eq!(vad.process(&loud(100), RATE), VadEvent::None);
        assert!(!vad.is_speech_active());
    }

    #[test]
    fn test_reset_preserves_config() {
        let config = VadConfig {
            energy_threshold: 0.2,
            min_silence_ms: 100,
            min_speech_ms: 50,
        };
        let mut vad = SimpleVad::new(config);
        vad.process(&loud(200), RATE);
        vad.reset();
        assert!(!vad.is_speech_active());
        // Threshold 0.2 still applies: a 0.1-amplitude signal stays quiet.
        let medium = vec![0.1f32; 3_200];
        assert_eq!(vad.process(&medium, RATE), VadEvent::None);
        assert_eq!(vad.process(&medium, RATE), VadEvent::None);
        assert!(!vad.is_speech_active());
    }
}
