//! Streaming PCM buffer.
//!
//! Accumulates base64 PCM16 little-endian mono samples at 16 kHz and frames
//! them into a WAV container for transcription. Short clips are padded with
//! trailing silence, because whisper hallucinates text on sub-second audio.

use base64::Engine;
use hound::{SampleFormat, WavSpec, WavWriter};

use lemonade_core::{Error, Result};

pub const SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Default)]
pub struct StreamingAudioBuffer {
    samples: Vec<i16>,
}

impl StreamingAudioBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a base64 chunk of PCM16-LE samples.
    pub fn append_base64(&mut self, data: &str) -> Result<()> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| Error::validation(format!("invalid base64 audio chunk: {e}")))?;
        self.samples.extend(
            bytes
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
        );
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn duration_ms(&self) -> u64 {
        (self.samples.len() as u64 * 1000) / SAMPLE_RATE as u64
    }

    /// The trailing `ms` of audio, normalized to f32 by int16 full scale,
    /// for VAD.
    pub fn recent_samples(&self, ms: u64) -> Vec<f32> {
        let wanted = ((SAMPLE_RATE as u64 * ms) / 1000) as usize;
        let start = self.samples.len().saturating_sub(wanted);
        self.samples[start..]
            .iter()
            .map(|&s| s as f32 / 32768.0)
            .collect()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Frame the buffer as a 16 kHz mono WAV, padded with silence up to
    /// `min_duration_ms`.
    pub fn to_wav_padded(&self, min_duration_ms: u64) -> Result<Vec<u8>> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let min_samples = ((SAMPLE_RATE as u64 * min_duration_ms) / 1000) as usize;
        let padding = min_samples.saturating_sub(self.samples.len());

        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec)
                .map_err(|e| Error::internal(format!("wav framing failed: {e}")))?;
            for &sample in &self.samples {
                writer
                    .write_sample(sample)
                    .map_err(|e| Error::internal(format!("wav framing failed: {e}")))?;
            }
            for _ in 0..padding {
                writer
                    .write_sample(0i16)
                    .map_err(|e| Error::internal(format!("wav framing failed: {e}")))?;
            }
            writer
                .finalize()
                .map_err(|e| Error::internal(format!("wav framing failed: {e}")))?;
        }
        Ok(cursor.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_samples(samples: &[i16]) -> String {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn test_append_and_duration() {
        let mut buffer = StreamingAudioBuffer::new();
        // 16000 samples = 1 second at 16 kHz.
        buffer.append_base64(&encode_samples(&vec![100; 16_000])).unwrap();
        assert_eq!(buffer.sample_count(), 16_000);
        assert_eq!(buffer.duration_ms(), 1_000);
    }

    #[test]
    fn test_recent_samples_window() {
        let mut buffer = StreamingAudioBuffer::new();
        buffer.append_base64(&encode_samples(&vec![100; 3_200])).unwrap();
        // 100 ms at 16 kHz = 1600 samples.
        assert_eq!(buffer.recent_samples(100).len(), 1_600);
        // Asking for more than is buffered returns everything.
        assert_eq!(buffer.recent_samples(10_000).len(), 3_200);
    }

    #[test]
    fn test_wav_padding_to_minimum_duration() {
        let mut buffer = StreamingAudioBuffer::new();
        buffer.append_base64(&encode_samples(&vec![5; 1_600])).unwrap(); // 100 ms
        let wav = buffer.to_wav_padded(1_250).unwrap();

        // 1.25 s at 16 kHz mono 16-bit = 40000 bytes of payload + header.
        let expected_payload = (SAMPLE_RATE as u64 * 1_250 / 1000) as usize * 2;
        assert!(wav.len() >= expected_payload);
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let mut buffer = StreamingAudioBuffer::new();
        assert!(buffer.append_base64("not!!base64").is_err());
    }
}
