//! The media pipeline collaborator.
//!
//! The call layer never looks inside encoded media: it receives opaque
//! chunks from [`MediaPipeline::start_capture`] and hands remote chunks to a
//! playback sink.  Chunks must fit in one wire frame.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use parley_shared::PeerIdentity;

use crate::audio::{gate_audio, AudioConfig, AudioFrame};
use crate::controls::CaptureControls;
use crate::error::MediaError;
use crate::video::{gate_video, VideoConfig, VideoFrame};

const CHUNK_QUEUE_DEPTH: usize = 32;

/// One encoded piece of a media stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    /// Decoder initialization segment (container header).
    pub is_init: bool,
    pub data: Bytes,
}

#[async_trait]
pub trait MediaPipeline: Send + Sync + 'static {
    /// Open the camera and microphone and start encoding.  The first chunk
    /// on the returned channel is the init segment.
    async fn start_capture(
        &self,
        controls: CaptureControls,
    ) -> Result<mpsc::Receiver<EncodedChunk>, MediaError>;

    async fn stop_capture(&self);

    /// Start decoding a remote peer's stream.  Chunks are fed through the
    /// returned sender until `cancel` fires.
    fn start_playback(
        &self,
        peer: &PeerIdentity,
        cancel: CancellationToken,
    ) -> Result<mpsc::Sender<EncodedChunk>, MediaError>;
}

fn drain_until_cancelled(
    mut rx: mpsc::Receiver<EncodedChunk>,
    cancel: CancellationToken,
    mut on_chunk: impl FnMut(EncodedChunk) + Send + 'static,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = rx.recv() => match chunk {
                    Some(chunk) => on_chunk(chunk),
                    None => break,
                },
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Headless
// ---------------------------------------------------------------------------

/// A node without capture devices.  Capture fails with
/// [`MediaError::NoDevice`]; remote chunks are counted and discarded.
#[derive(Debug, Default)]
pub struct HeadlessPipeline;

#[async_trait]
impl MediaPipeline for HeadlessPipeline {
    async fn start_capture(
        &self,
        _controls: CaptureControls,
    ) -> Result<mpsc::Receiver<EncodedChunk>, MediaError> {
        Err(MediaError::NoDevice)
    }

    async fn stop_capture(&self) {}

    fn start_playback(
        &self,
        peer: &PeerIdentity,
        cancel: CancellationToken,
    ) -> Result<mpsc::Sender<EncodedChunk>, MediaError> {
        let (tx, rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
        let peer = peer.clone();
        let mut count = 0u64;
        drain_until_cancelled(rx, cancel, move |_| {
            count += 1;
            if count % 100 == 0 {
                debug!(peer = %peer.short(), chunks = count, "Discarding remote media");
            }
        });
        Ok(tx)
    }
}

// ---------------------------------------------------------------------------
// Synthetic
// ---------------------------------------------------------------------------

/// Generates a test pattern and tone, gated by the capture controls, and
/// records every chunk it is asked to play back.
///
/// "Encoding" is the raw frame bytes followed by the raw samples, so the
/// substitution policy is directly observable in the chunk payloads.
pub struct SyntheticPipeline {
    video: VideoConfig,
    audio: AudioConfig,
    interval: Duration,
    capture: Mutex<Option<CancellationToken>>,
    received: Arc<Mutex<HashMap<PeerIdentity, Vec<EncodedChunk>>>>,
}

impl Default for SyntheticPipeline {
    fn default() -> Self {
        Self::new(
            VideoConfig {
                width: 16,
                height: 12,
                fps: 25,
                bitrate_kbps: 0,
                keyframe_interval: 10,
            },
            AudioConfig {
                sample_rate: 8000,
                channels: 1,
                frame_size_ms: 20,
            },
            Duration::from_millis(20),
        )
    }
}

impl SyntheticPipeline {
    pub fn new(video: VideoConfig, audio: AudioConfig, interval: Duration) -> Self {
        Self {
            video,
            audio,
            interval,
            capture: Mutex::new(None),
            received: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The init segment this pipeline emits first.
    pub fn init_segment(&self) -> Bytes {
        let mut header = BytesMut::with_capacity(24);
        header.put_slice(b"PRLYINIT");
        header.put_u32(self.video.width);
        header.put_u32(self.video.height);
        header.put_u32(self.audio.sample_rate);
        header.put_u16(self.audio.channels);
        header.put_u16(self.video.fps as u16);
        header.freeze()
    }

    /// Chunks played back for `peer` so far.
    pub fn received_from(&self, peer: &PeerIdentity) -> Vec<EncodedChunk> {
        self.received
            .lock()
            .map(|map| map.get(peer).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn is_capturing(&self) -> bool {
        self.capture
            .lock()
            .map(|c| c.as_ref().is_some_and(|t| !t.is_cancelled()))
            .unwrap_or(false)
    }
}

fn encode(video: &VideoFrame, audio: &AudioFrame) -> Bytes {
    let mut out = BytesMut::with_capacity(video.data.len() + audio.samples.len() * 4);
    out.put_slice(&video.data);
    out.put_slice(&audio.to_le_bytes());
    out.freeze()
}

#[async_trait]
impl MediaPipeline for SyntheticPipeline {
    async fn start_capture(
        &self,
        controls: CaptureControls,
    ) -> Result<mpsc::Receiver<EncodedChunk>, MediaError> {
        let cancel = CancellationToken::new();
        if let Ok(mut current) = self.capture.lock() {
            if let Some(previous) = current.replace(cancel.clone()) {
                previous.cancel();
            }
        }

        let (tx, rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
        let init = self.init_segment();
        let video = self.video.clone();
        let samples = self.audio.frame_size_samples();
        let interval = self.interval;
        info!(width = video.width, height = video.height, "Starting synthetic capture");

        tokio::spawn(async move {
            if tx.send(EncodedChunk { is_init: true, data: init }).await.is_err() {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            let mut frame_no: u64 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let timestamp_ms = frame_no * interval.as_millis() as u64;
                        let frame = VideoFrame {
                            width: video.width,
                            height: video.height,
                            data: vec![(frame_no % 255) as u8 + 1; video.frame_len()],
                            timestamp_ms,
                        };
                        let tone = AudioFrame {
                            samples: vec![0.5; samples],
                            timestamp_ms,
                        };
                        let data = encode(&gate_video(frame, &controls), &gate_audio(tone, &controls));
                        if tx.send(EncodedChunk { is_init: false, data }).await.is_err() {
                            break;
                        }
                        frame_no += 1;
                    }
                }
            }
            debug!(frames = frame_no, "Synthetic capture stopped");
        });

        Ok(rx)
    }

    async fn stop_capture(&self) {
        if let Ok(mut current) = self.capture.lock() {
            if let Some(token) = current.take() {
                token.cancel();
            }
        }
    }

    fn start_playback(
        &self,
        peer: &PeerIdentity,
        cancel: CancellationToken,
    ) -> Result<mpsc::Sender<EncodedChunk>, MediaError> {
        let (tx, rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
        let received = Arc::clone(&self.received);
        let peer = peer.clone();
        drain_until_cancelled(rx, cancel, move |chunk| {
            if let Ok(mut map) = received.lock() {
                map.entry(peer.clone()).or_default().push(chunk);
            }
        });
        Ok(tx)
    }
}
