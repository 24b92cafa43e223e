//! Audio pipelines for the call client.
//!
//! The outbound leg turns microphone input into fixed-duration encoded
//! slices ([`chunker`], fed by [`capture`]); the inbound leg buffers and
//! plays received fragments in arrival order ([`playback`]). Utterance
//! segmentation ([`vad`]) taps the raw capture stream without gating the
//! live send path.

pub mod capture;
pub mod chunker;
pub mod playback;
pub mod vad;

pub use capture::{
    list_input_devices, AudioDeviceInfo, CaptureControl, CaptureSource, LinearResampler,
};
pub use chunker::FrameChunker;
pub use playback::{InterruptPoint, PlaybackEvent, PlaybackSink, Player, RenderHandle, RodioSink};
pub use vad::{UtteranceArtifact, VadSegmenter, VadState};
