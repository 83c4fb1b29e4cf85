//! Voice activity detection
//!
//! Energy-based detector over 16-bit PCM frames. Keeps two counters —
//! consecutive speech frames and consecutive silence frames — and reports
//! speech once an active run has lasted `min_speech_ms`.

use parking_lot::Mutex;

use edgevoice_core::{AudioFrame, Provider, ProviderKind, Result, VadEngine};

/// Detector tuning. Durations are milliseconds of audio, converted to frame
/// counts with `frame_duration_ms`.
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Normalized RMS threshold in [0, 1]
    pub sensitivity: f32,
    pub frame_duration_ms: u32,
    pub min_speech_ms: u32,
    pub max_silence_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sensitivity: 0.02,
            frame_duration_ms: 20,
            min_speech_ms: 200,
            max_silence_ms: 800,
        }
    }
}

#[derive(Default)]
struct VadState {
    speech_frames: u32,
    silence_frames: u32,
    active: bool,
}

/// Pooled, resettable energy VAD.
pub struct EnergyVad {
    config: VadConfig,
    min_speech_frames: u32,
    max_silence_frames: u32,
    state: Mutex<VadState>,
}

impl EnergyVad {
    pub fn new(config: VadConfig) -> Self {
        let frame_ms = config.frame_duration_ms.max(1);
        Self {
            min_speech_frames: (config.min_speech_ms / frame_ms).max(1),
            max_silence_frames: config.max_silence_ms / frame_ms,
            config,
            state: Mutex::new(VadState::default()),
        }
    }
}

impl Provider for EnergyVad {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Vad
    }

    fn reset(&self) {
        *self.state.lock() = VadState::default();
    }
}

impl VadEngine for EnergyVad {
    fn process_frame(&self, frame: &AudioFrame) -> Result<bool> {
        let energetic = frame.rms() >= self.config.sensitivity;
        let mut state = self.state.lock();

        if energetic {
            state.speech_frames += 1;
            state.silence_frames = 0;
            state.active = true;
        } else {
            state.silence_frames += 1;
            if state.silence_frames > self.max_silence_frames {
                state.active = false;
                state.speech_frames = 0;
            }
        }

        Ok(state.active && state.speech_frames >= self.min_speech_frames)
    }
}
