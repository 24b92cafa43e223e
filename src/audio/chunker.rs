//! Outbound slice assembly and encoding.
//!
//! Raw capture samples accumulate until one slice duration's worth is
//! available, then the slice is WAV-encoded in memory, base64-encoded, and
//! wrapped in an [`OutboundFrame`]. Nothing downstream ever blocks capture:
//! frames are handed off fire-and-forget and a dropped frame is gone.

use base64::Engine;

use crate::config::AudioConfig;
use crate::error::{CallError, Result};
use crate::session::protocol::OutboundFrame;

/// Assembles fixed-duration outbound frames from a raw sample stream.
pub struct FrameChunker {
    config: AudioConfig,
    samples_per_slice: usize,
    pending: Vec<f32>,
}

impl FrameChunker {
    pub fn new(config: AudioConfig) -> Self {
        let samples_per_slice = config.samples_per_slice();
        Self {
            config,
            samples_per_slice,
            pending: Vec::with_capacity(samples_per_slice),
        }
    }

    /// Feed captured samples; returns every frame completed by this batch.
    ///
    /// A batch can complete zero frames (still below the slice boundary) or
    /// several (captures arriving after a scheduling hiccup).
    pub fn push(&mut self, samples: &[f32]) -> Result<Vec<OutboundFrame>> {
        self.pending.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.pending.len() >= self.samples_per_slice {
            let slice: Vec<f32> = self.pending.drain(..self.samples_per_slice).collect();
            frames.push(self.encode_slice(&slice)?);
        }
        Ok(frames)
    }

    /// Discard the partial slice below the boundary.
    ///
    /// Called when capture pauses for playback: a half-filled slice must
    /// not leak into the next utterance. Returns the number of samples
    /// dropped.
    pub fn discard_partial(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Samples currently below the slice boundary.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    fn encode_slice(&self, samples: &[f32]) -> Result<OutboundFrame> {
        let wav = encode_wav(samples, self.config.sample_rate)?;
        let audio_b64 = base64::engine::general_purpose::STANDARD.encode(&wav);
        Ok(OutboundFrame {
            audio_b64,
            format: self.config.format,
            captured_at: chrono::Utc::now(),
        })
    }
}

/// Encode mono f32 samples as 16-bit PCM WAV in memory.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| CallError::Device(format!("wav writer: {e}")))?;
        for &sample in samples {
            let clamped = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer
                .write_sample(clamped)
                .map_err(|e| CallError::Device(format!("wav write: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| CallError::Device(format!("wav finalize: {e}")))?;
    }
    Ok(cursor.into_inner())
}

// ── Tests ──────────────────────────────────────────────────────────
