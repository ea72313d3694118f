//! Call media for Parley nodes: capture gating, the pipeline seam towards
//! the platform encoder and decoder, and the call signaling state.

pub mod audio;
pub mod call;
pub mod controls;
pub mod error;
pub mod pipeline;
pub mod video;

pub use call::{
    CallEnd, CallPhase, CallSnapshot, CallState, ChunkOutcome, JoinDecision, RelayTask, RosterChange,
    RELAY_QUEUE_DEPTH,
};
pub use controls::CaptureControls;
pub use error::MediaError;
pub use pipeline::{EncodedChunk, HeadlessPipeline, MediaPipeline, SyntheticPipeline};
