use crate::controls::CaptureControls;

#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            frame_size_ms: 20,
        }
    }
}

impl AudioConfig {
    /// Samples per frame across all channels.
    pub fn frame_size_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_size_ms as usize) / 1000 * self.channels as usize
    }
}

/// One captured block of interleaved samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub timestamp_ms: u64,
}

impl AudioFrame {
    pub fn silence(len: usize, timestamp_ms: u64) -> Self {
        Self {
            samples: vec![0.0; len],
            timestamp_ms,
        }
    }

    /// Little-endian f32 samples.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

/// Apply the mute switch: a muted frame becomes silence of the same length
/// and timestamp so playback stays in sync.
pub fn gate_audio(frame: AudioFrame, controls: &CaptureControls) -> AudioFrame {
    if controls.is_muted() {
        AudioFrame::silence(frame.samples.len(), frame.timestamp_ms)
    } else {
        frame
    }
}
