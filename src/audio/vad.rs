//! Voice-activity segmentation over the raw capture stream.
//!
//! An RMS threshold detector with a hangover window marks utterance
//! boundaries and assembles each completed utterance into a replayable WAV
//! artifact for the UI's replay list. The detector only observes the
//! stream — the live slice-based send path is never gated by it.
//!
//! State machine: Idle → Speech when RMS rises above the start threshold;
//! Speech → Hangover when it falls below the end threshold; Hangover →
//! Speech on renewed activity, or → Idle once the hangover window elapses,
//! which closes the utterance.

use std::time::Duration;

use crate::config::VadConfig;
use crate::error::Result;

use super::chunker::encode_wav;

/// Segmentation state, advanced per pushed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Idle,
    Speech,
    Hangover,
}

/// A completed utterance, replayable by the UI collaborator.
#[derive(Debug, Clone)]
pub struct UtteranceArtifact {
    /// WAV-encoded utterance audio (16-bit PCM mono).
    pub wav: Vec<u8>,
    /// Offset of the utterance start from the beginning of capture.
    pub started_at: Duration,
    /// Offset of the utterance end from the beginning of capture.
    pub ended_at: Duration,
}

/// Utterance boundary detector and artifact assembler.
///
/// Time is derived from the sample count, not the wall clock, so
/// segmentation is deterministic for a given input stream.
pub struct VadSegmenter {
    config: VadConfig,
    sample_rate: u32,
    state: VadState,
    /// Samples spent in the current hangover window.
    hangover_samples: u64,
    /// Samples processed since capture start.
    samples_seen: u64,
    /// Sample offset where the open utterance began.
    utterance_start: u64,
    /// Accumulated samples of the open utterance.
    current: Vec<f32>,
}

impl VadSegmenter {
    pub fn new(config: VadConfig, sample_rate: u32) -> Self {
        Self {
            config,
            sample_rate,
            state: VadState::Idle,
            hangover_samples: 0,
            samples_seen: 0,
            utterance_start: 0,
            current: Vec::new(),
        }
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    /// Feed one chunk of raw capture samples.
    ///
    /// Returns a completed utterance when this chunk closes one.
    pub fn push(&mut self, chunk: &[f32]) -> Result<Option<UtteranceArtifact>> {
        if !self.config.enabled || chunk.is_empty() {
            self.samples_seen += chunk.len() as u64;
            return Ok(None);
        }

        let rms = rms(chunk);
        let chunk_len = chunk.len() as u64;
        let mut completed = None;

        match self.state {
            VadState::Idle => {
                if rms > self.config.start_rms {
                    tracing::debug!(rms, "speech start");
                    self.state = VadState::Speech;
                    self.utterance_start = self.samples_seen;
                    self.current.clear();
                    self.current.extend_from_slice(chunk);
                }
            }
            VadState::Speech => {
                self.current.extend_from_slice(chunk);
                if rms < self.config.end_rms {
                    self.state = VadState::Hangover;
                    self.hangover_samples = 0;
                }
            }
            VadState::Hangover => {
                self.current.extend_from_slice(chunk);
                if rms > self.config.start_rms {
                    self.state = VadState::Speech;
                } else {
                    self.hangover_samples += chunk_len;
                    let hangover_limit =
                        self.sample_rate as u64 * self.config.hangover_ms / 1000;
                    if self.hangover_samples >= hangover_limit {
                        tracing::debug!("speech end");
                        completed = Some(self.close_utterance()?);
                    }
                }
            }
        }

        self.samples_seen += chunk_len;
        Ok(completed)
    }

    /// Close any open utterance at end of capture.
    pub fn finish(&mut self) -> Result<Option<UtteranceArtifact>> {
        match self.state {
            VadState::Idle => Ok(None),
            VadState::Speech | VadState::Hangover => Ok(Some(self.close_utterance()?)),
        }
    }

    fn close_utterance(&mut self) -> Result<UtteranceArtifact> {
        self.state = VadState::Idle;
        let samples = std::mem::take(&mut self.current);
        let wav = encode_wav(&samples, self.sample_rate)?;
        let end = self.utterance_start + samples.len() as u64;
        Ok(UtteranceArtifact {
            wav,
            started_at: self.offset(self.utterance_start),
            ended_at: self.offset(end),
        })
    }

    fn offset(&self, sample: u64) -> Duration {
        Duration::from_micros(sample * 1_000_000 / self.sample_rate as u64)
    }
}

fn rms(chunk: &[f32]) -> f32 {
    if chunk.is_empty() {
        return 0.0;
    }
    let sum: f32 = chunk.iter().map(|s| s * s).sum();
    (sum / chunk.len() as f32).sqrt()
}

// ── Tests ──────────────────────────────────────────────────────────
