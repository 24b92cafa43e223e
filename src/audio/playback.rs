//! Inbound playback: ordered, gapless, interruptible.
//!
//! Fragments arrive from the socket at irregular intervals and are queued
//! FIFO. At most one fragment is ever rendering; when it completes
//! naturally the next is decoded and started, so decode order can never
//! race playback order. `interrupt()` halts the active render mid-fragment,
//! discards everything queued behind it, and reports the exact point of
//! interruption.
//!
//! Rendering goes through the object-safe [`PlaybackSink`] trait so the
//! queue logic is testable without an output device. The production
//! implementation is [`RodioSink`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{CallError, Result};

// ── Sink abstraction ──────────────────────────────────────────────

/// Handle to one in-flight render.
pub trait RenderHandle: Send {
    /// Halt rendering immediately. Idempotent.
    fn stop(&mut self);
}

/// Decodes and renders one fragment at a time on the output device.
///
/// Contract: `done` fires exactly once, asynchronously, when the fragment
/// finishes or is stopped — never from inside `begin` itself. The player
/// distinguishes natural completion from a stop via its generation counter.
pub trait PlaybackSink: Send + Sync + 'static {
    /// Start decoding and rendering `audio`. Errors mean the fragment is
    /// undecodable and will be dropped.
    fn begin(
        &self,
        audio: Vec<u8>,
        done: Box<dyn FnOnce() + Send + 'static>,
    ) -> Result<Box<dyn RenderHandle>>;
}

// ── Player ────────────────────────────────────────────────────────

/// The exact point at which playback was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptPoint {
    /// Arrival-order index of the fragment that was rendering.
    pub fragment_index: u64,
    /// Elapsed render time within that fragment.
    pub offset: Duration,
}

/// Signals from the player to the session controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The queue drained naturally; nothing is rendering.
    Idle,
}

struct Rendering {
    handle: Box<dyn RenderHandle>,
    index: u64,
    started: Instant,
}

struct PlayerState {
    queue: VecDeque<Vec<u8>>,
    rendering: Option<Rendering>,
    /// Bumped on every interrupt; in-flight completions carrying an older
    /// generation are superseded and must no-op.
    generation: u64,
    /// Arrival-order counter across the session.
    next_index: u64,
}

struct PlayerInner {
    sink: Arc<dyn PlaybackSink>,
    state: Mutex<PlayerState>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

/// FIFO playback buffer and player.
///
/// `enqueue` and `interrupt` are safe to call from the socket receive task
/// while a render completion is in flight; ordering is preserved by always
/// dequeuing at the head.
#[derive(Clone)]
pub struct Player {
    inner: Arc<PlayerInner>,
}

impl Player {
    pub fn new(sink: Arc<dyn PlaybackSink>, events: mpsc::UnboundedSender<PlaybackEvent>) -> Self {
        Self {
            inner: Arc::new(PlayerInner {
                sink,
                state: Mutex::new(PlayerState {
                    queue: VecDeque::new(),
                    rendering: None,
                    generation: 0,
                    next_index: 0,
                }),
                events,
            }),
        }
    }

    /// Append a fragment at the tail; start it immediately if idle.
    pub fn enqueue(&self, fragment: Vec<u8>) {
        let mut state = self.inner.state.lock();
        state.queue.push_back(fragment);
        if state.rendering.is_none() {
            PlayerInner::start_head(&self.inner, &mut state);
        }
    }

    /// Stop the active render, discard the queue, report where playback
    /// stopped. Returns `None` when nothing was playing (idempotent).
    pub fn interrupt(&self) -> Option<InterruptPoint> {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        let discarded = state.queue.len();
        state.queue.clear();
        match state.rendering.take() {
            Some(mut rendering) => {
                rendering.handle.stop();
                let point = InterruptPoint {
                    fragment_index: rendering.index,
                    offset: rendering.started.elapsed(),
                };
                tracing::info!(
                    fragment = point.fragment_index,
                    offset_ms = point.offset.as_millis() as u64,
                    discarded,
                    "playback interrupted"
                );
                Some(point)
            }
            None => None,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.inner.state.lock().rendering.is_some()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}

impl PlayerInner {
    /// Start rendering from the queue head. Undecodable fragments are
    /// logged and skipped; an emptied queue signals idle.
    fn start_head(inner: &Arc<PlayerInner>, state: &mut PlayerState) {
        while let Some(fragment) = state.queue.pop_front() {
            let index = state.next_index;
            state.next_index += 1;

            let generation = state.generation;
            let completer = Arc::clone(inner);
            let done = Box::new(move || completer.render_complete(generation));

            match inner.sink.begin(fragment, done) {
                Ok(handle) => {
                    state.rendering = Some(Rendering {
                        handle,
                        index,
                        started: Instant::now(),
                    });
                    return;
                }
                Err(e) => {
                    tracing::warn!(fragment = index, error = %e, "dropping undecodable fragment");
                }
            }
        }
        let _ = inner.events.send(PlaybackEvent::Idle);
    }

    /// Completion callback from the sink. No-ops when superseded by an
    /// interrupt that happened while the render was still in flight.
    fn render_complete(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock();
        if generation != state.generation {
            return;
        }
        state.rendering = None;
        Self::start_head(self, &mut state);
    }
}

// ── Rodio sink ────────────────────────────────────────────────────

/// Production sink: rodio decode + render on the default output device.
///
/// `rodio::OutputStream` is not `Send`, so it lives on a dedicated thread
/// that parks until the sink is dropped; only the cloneable stream handle
/// crosses threads. Each fragment gets a fresh `rodio::Sink`, and a waiter
/// thread fires `done` when the sink drains or is stopped.
pub struct RodioSink {
    handle: rodio::OutputStreamHandle,
    _shutdown: crossbeam_channel::Sender<()>,
}

impl RodioSink {
    /// Acquire the default output device.
    pub fn new() -> Result<Self> {
        let (handle_tx, handle_rx) = crossbeam_channel::bounded(1);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);

        std::thread::Builder::new()
            .name("voxwire-output".into())
            .spawn(move || {
                let stream = match rodio::OutputStream::try_default() {
                    Ok((stream, handle)) => {
                        let _ = handle_tx.send(Ok(handle));
                        stream
                    }
                    Err(e) => {
                        let _ = handle_tx.send(Err(CallError::Device(format!(
                            "no output device: {e}"
                        ))));
                        return;
                    }
                };
                // Keep the stream alive until the sink is dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
            })
            .map_err(|e| CallError::Device(format!("output thread: {e}")))?;

        let handle = handle_rx
            .recv()
            .map_err(|_| CallError::Device("output thread died".into()))??;

        Ok(Self {
            handle,
            _shutdown: shutdown_tx,
        })
    }
}

struct RodioHandle {
    sink: Arc<rodio::Sink>,
}

impl RenderHandle for RodioHandle {
    fn stop(&mut self) {
        self.sink.stop();
    }
}

impl PlaybackSink for RodioSink {
    fn begin(
        &self,
        audio: Vec<u8>,
        done: Box<dyn FnOnce() + Send + 'static>,
    ) -> Result<Box<dyn RenderHandle>> {
        let decoder = rodio::Decoder::new(std::io::Cursor::new(audio))
            .map_err(|e| CallError::Protocol(format!("undecodable audio payload: {e}")))?;

        let sink = rodio::Sink::try_new(&self.handle)
            .map_err(|e| CallError::Device(format!("output sink: {e}")))?;
        sink.append(decoder);

        let sink = Arc::new(sink);
        let waiter = Arc::clone(&sink);
        std::thread::Builder::new()
            .name("voxwire-render-wait".into())
            .spawn(move || {
                waiter.sleep_until_end();
                done();
            })
            .map_err(|e| CallError::Device(format!("render waiter: {e}")))?;

        Ok(Box::new(RodioHandle { sink }))
    }
}

// ── Tests ──────────────────────────────────────────────────────────
