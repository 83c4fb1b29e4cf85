//! Audio frame types
//!
//! Device uplink audio is 16-bit little-endian mono PCM. Frames keep the raw
//! bytes so they can be forwarded to the recognizer without re-encoding.

use serde::{Deserialize, Serialize};

/// Default device sample rate in Hz.
pub const SAMPLE_RATE: u32 = 16_000;

/// A single uplink audio frame.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw 16-bit LE mono PCM
    pub pcm: Vec<u8>,
    /// Frame duration in milliseconds
    pub duration_ms: u32,
    /// Monotonic sequence number within the connection
    pub sequence: u64,
}

impl AudioFrame {
    pub fn new(pcm: Vec<u8>, duration_ms: u32, sequence: u64) -> Self {
        Self {
            pcm,
            duration_ms,
            sequence,
        }
    }

    /// Number of 16-bit samples in the frame.
    pub fn sample_count(&self) -> usize {
        self.pcm.len() / 2
    }

    /// Root-mean-square energy normalized to [0, 1].
    pub fn rms(&self) -> f32 {
        if self.pcm.len() < 2 {
            return 0.0;
        }
        let mut sum = 0.0f64;
        let mut n = 0usize;
        for chunk in self.pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f64 / 32768.0;
            sum += sample * sample;
            n += 1;
        }
        (sum / n as f64).sqrt() as f32
    }
}

/// Audio format advertised to the recognizer handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioFormat {
    pub format: String,
    pub rate: u32,
    pub bits: u32,
    pub channel: u32,
    pub language: String,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            format: "pcm".to_string(),
            rate: SAMPLE_RATE,
            bits: 16,
            channel: 1,
            language: "zh-CN".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_from_samples(samples: &[i16]) -> AudioFrame {
        let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        AudioFrame::new(pcm, 20, 0)
    }

    #[test]
    fn silence_has_zero_rms() {
        let frame = frame_from_samples(&[0; 320]);
        assert_eq!(frame.rms(), 0.0);
    }

    #[test]
    fn full_scale_rms_is_near_one() {
        let frame = frame_from_samples(&[i16::MAX; 320]);
        let rms = frame.rms();
        assert!(rms > 0.99 && rms <= 1.0, "rms = {rms}");
    }

    #[test]
    fn empty_frame_is_safe() {
        let frame = AudioFrame::new(Vec::new(), 0, 0);
        assert_eq!(frame.sample_count(), 0);
        assert_eq!(frame.rms(), 0.0);
    }
}
