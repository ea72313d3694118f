use crate::controls::CaptureControls;

/// Video configuration
#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    /// Frames between decoder-refresh keyframes.
    pub keyframe_interval: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            bitrate_kbps: 500,
            keyframe_interval: 10,
        }
    }
}

impl VideoConfig {
    /// Bytes in one raw RGB frame.
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// Raw RGB frame as produced by the camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub timestamp_ms: u64,
}

impl VideoFrame {
    /// A black frame.
    pub fn blank(width: u32, height: u32, timestamp_ms: u64) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * 3],
            timestamp_ms,
        }
    }
}

/// Apply the video-off switch: the frame is replaced by a blank image with
/// the same dimensions and timestamp.
pub fn gate_video(frame: VideoFrame, controls: &CaptureControls) -> VideoFrame {
    if controls.is_video_enabled() {
        frame
    } else {
        VideoFrame::blank(frame.width, frame.height, frame.timestamp_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_off_yields_blank_frame_of_same_shape() {
        let controls = CaptureControls::new();
        let frame = VideoFrame {
            width: 2,
            height: 1,
            data: vec![255, 0, 0, 0, 255, 0],
            timestamp_ms: 33,
        };

        controls.set_video_enabled(false);
        let gated = gate_video(frame.clone(), &controls);
        assert_eq!(gated, VideoFrame::blank(2, 1, 33));
        assert_eq!(gated.data.len(), frame.data.len());

        controls.set_video_enabled(true);
        assert_eq!(gate_video(frame.clone(), &controls), frame);
    }
}
