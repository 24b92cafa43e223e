//! Microphone capture.
//!
//! The cpal stream lives on a dedicated thread (cpal streams are not
//! `Send`); only atomic flags and channels cross into async code. The
//! stream callback does the minimum — pause check, mono downmix, lossy
//! hand-off — and never blocks: the sample channel is try_send only, so a
//! slow consumer drops samples instead of stalling the device.
//!
//! Pausing flips an atomic gate rather than tearing the stream down, so
//! resume is instant when playback hands the turn back.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::AudioConfig;
use crate::error::{CallError, Result};

/// Audio input device information.
#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_default: bool,
}

/// List available audio input devices.
pub fn list_input_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    host.input_devices()
        .map(|devices| {
            devices
                .filter_map(|device| {
                    let name = device.name().ok()?;
                    let is_default = default_name.as_deref() == Some(name.as_str());
                    Some(AudioDeviceInfo { name, is_default })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Control surface the session controller holds on the microphone owner.
///
/// Object-safe so tests can run the controller without a real device; the
/// only production implementor is [`CaptureSource`].
pub trait CaptureControl: Send {
    /// Gate capture off (samples are dropped at the device callback).
    fn pause(&self);
    /// Re-open the gate.
    fn resume(&self);
    /// Release the device. Idempotent.
    fn stop(&mut self);
    /// Actual device capture rate.
    fn sample_rate(&self) -> u32;
}

/// Owns the microphone for the duration of a call.
///
/// Dropping the source (or calling [`stop`](Self::stop)) releases the
/// device. The capture thread exits when its shutdown channel closes.
pub struct CaptureSource {
    paused: Arc<AtomicBool>,
    shutdown: Option<crossbeam_channel::Sender<()>>,
    /// Actual device sample rate; resample to the wire rate when they differ.
    sample_rate: u32,
}

impl CaptureSource {
    /// Acquire the default input device and start capturing.
    ///
    /// Mono samples at the device rate flow into `samples_tx`; overruns are
    /// dropped, never queued.
    pub fn start(config: &AudioConfig, samples_tx: mpsc::Sender<Vec<f32>>) -> Result<Self> {
        let paused = Arc::new(AtomicBool::new(false));
        let paused_cb = Arc::clone(&paused);

        let desired_rate = config.sample_rate;
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);

        std::thread::Builder::new()
            .name("voxwire-capture".into())
            .spawn(move || {
                let stream = match build_stream(desired_rate, paused_cb, samples_tx) {
                    Ok((stream, rate)) => {
                        if stream.play().is_err() {
                            let _ = ready_tx
                                .send(Err(CallError::Device("failed to start input stream".into())));
                            return;
                        }
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Hold the stream (and the device) until shutdown.
                let _ = shutdown_rx.recv();
                drop(stream);
                tracing::info!("microphone released");
            })
            .map_err(|e| CallError::Device(format!("capture thread: {e}")))?;

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| CallError::Device("capture thread died".into()))??;

        tracing::info!(sample_rate, "microphone capture started");

        Ok(Self {
            paused,
            shutdown: Some(shutdown_tx),
            sample_rate,
        })
    }

    /// Actual capture rate of the device, which may differ from the wire
    /// rate and then requires resampling.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Gate capture off while playback holds the turn.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Release the microphone. Idempotent.
    pub fn stop(&mut self) {
        self.shutdown.take();
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.stop();
    }
}

impl CaptureControl for CaptureSource {
    fn pause(&self) {
        CaptureSource::pause(self);
    }

    fn resume(&self) {
        CaptureSource::resume(self);
    }

    fn stop(&mut self) {
        CaptureSource::stop(self);
    }

    fn sample_rate(&self) -> u32 {
        CaptureSource::sample_rate(self)
    }
}

fn build_stream(
    desired_rate: u32,
    paused: Arc<AtomicBool>,
    samples_tx: mpsc::Sender<Vec<f32>>,
) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| CallError::Device("no input device available".into()))?;

    let device_name = device.name().unwrap_or_else(|_| "unknown".into());
    let supported = device
        .default_input_config()
        .map_err(|e| CallError::Device(format!("input config: {e}")))?;

    let mut stream_config: cpal::StreamConfig = supported.into();
    // Ask for the wire rate; fall back to the device default if refused.
    let default_rate = stream_config.sample_rate.0;
    stream_config.sample_rate = cpal::SampleRate(desired_rate);

    let channels = stream_config.channels as usize;
    tracing::info!(device = %device_name, channels, "opening input stream");

    let err_fn = |err| tracing::error!(error = %err, "input stream error");

    let callback = {
        let samples_tx = samples_tx.clone();
        let paused = Arc::clone(&paused);
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            if paused.load(Ordering::SeqCst) {
                return;
            }
            let mono: Vec<f32> = if channels == 1 {
                data.to_vec()
            } else {
                data.chunks(channels)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                    .collect()
            };
            // Lossy by design: drop on overrun rather than stall the device.
            if samples_tx.try_send(mono).is_err() {
                tracing::debug!("capture consumer behind, dropping samples");
            }
        }
    };

    match device.build_input_stream(&stream_config, callback.clone(), err_fn, None) {
        Ok(stream) => Ok((stream, desired_rate)),
        Err(_) => {
            tracing::warn!(
                desired_rate,
                default_rate,
                "device refused wire rate, capturing at device rate"
            );
            stream_config.sample_rate = cpal::SampleRate(default_rate);
            let stream = device
                .build_input_stream(&stream_config, callback, err_fn, None)
                .map_err(|e| CallError::Device(format!("input stream: {e}")))?;
            Ok((stream, default_rate))
        }
    }
}

// ── Resampling ────────────────────────────────────────────────────

/// Stateful linear resampler for devices that refuse the wire rate.
///
/// Keeps the last sample and fractional read position across chunks so
/// chunk boundaries stay continuous.
pub struct LinearResampler {
    from: u32,
    to: u32,
    /// Fractional position into the virtual input stream.
    pos: f64,
    last: f32,
    primed: bool,
}

impl LinearResampler {
    pub fn new(from: u32, to: u32) -> Self {
        Self {
            from,
            to,
            pos: 0.0,
            last: 0.0,
            primed: false,
        }
    }

    /// Whether any conversion is needed at all.
    pub fn is_identity(&self) -> bool {
        self.from == self.to
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_identity() {
            return input.to_vec();
        }
        if input.is_empty() {
            return Vec::new();
        }

        let step = self.from as f64 / self.to as f64;
        let mut output = Vec::with_capacity((input.len() as f64 / step) as usize + 1);

        if !self.primed {
            self.last = input[0];
            self.primed = true;
        }

        // `pos` indexes the stream formed by [last, input[0], input[1], ..]
        while self.pos < input.len() as f64 {
            let idx = self.pos.floor() as usize;
            let frac = (self.pos - idx as f64) as f32;
            let a = if idx == 0 { self.last } else { input[idx - 1] };
            let b = input[idx];
            output.push(a + (b - a) * frac);
            self.pos += step;
        }

        self.pos -= input.len() as f64;
        self.last = input[input.len() - 1];
        output
    }
}

// ── Tests ──────────────────────────────────────────────────────────
