use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

/// Mute and video-off switches shared between the call state and the
/// capture pipeline.  Flipping a switch never stops capture; the pipeline
/// substitutes silence or a blank frame of the same shape instead.
#[derive(Debug, Clone, Default)]
pub struct CaptureControls {
    muted: Arc<AtomicBool>,
    video_off: Arc<AtomicBool>,
}

impl CaptureControls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
        debug!(muted, "Microphone state changed");
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.video_off.store(!enabled, Ordering::Relaxed);
        debug!(enabled, "Video enabled state changed");
    }

    pub fn is_video_enabled(&self) -> bool {
        !self.video_off.load(Ordering::Relaxed)
    }
}
