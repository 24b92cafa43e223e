//! Session model and controller.
//!
//! One session per call. The controller is the single source of truth
//! for `mode` and `config`: it supervises the outbound leg (capture →
//! chunker → socket) and the inbound leg (socket → playback queue →
//! speaker), applies inbound control signals, and forwards configuration
//! changes upstream as control messages.
//!
//! ```text
//! mic ─▸ CaptureSource ─▸ resample ─▸ FrameChunker ─▸ ConnectionHandle ─▸ ws
//!                └────────▸ VadSegmenter ─▸ replay artifacts ─▸ UI
//! ws ─▸ ConnectionManager ─▸ InboundMessage ─▸ Player ─▸ speaker
//! ```
//!
//! The controller runs as a single task multiplexing every input channel;
//! components never reach into each other's resources directly.

pub mod connection;
pub mod protocol;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::audio::playback::PlaybackEvent;
use crate::audio::{
    CaptureControl, CaptureSource, FrameChunker, InterruptPoint, LinearResampler, PlaybackSink,
    Player, RodioSink, UtteranceArtifact, VadSegmenter,
};
use crate::config::Config;
use crate::error::Result;
use crate::wake::WakeLock;

pub use connection::{ConnectionHandle, ConnectionManager, ConnectionStatus};
use protocol::{ControlSignal, InboundMessage, OutboundMessage};

// ── Session model ─────────────────────────────────────────────────

/// The two user-facing session parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Target language for translated output.
    pub target_language: String,
    /// Whether the remote service should translate rather than relay.
    pub simultaneous_translation: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_language: "中文".into(),
            simultaneous_translation: false,
        }
    }
}

/// Turn-taking mode. Capture runs exactly while listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Listening,
    Speaking,
}

/// Events surfaced to the UI collaborator.
#[derive(Debug)]
pub enum SessionEvent {
    StatusChanged(ConnectionStatus),
    ModeChanged(SessionMode),
    /// Playback was cut off at this exact point.
    PlaybackInterrupted(InterruptPoint),
    /// A completed utterance was added to the replay list.
    UtteranceCaptured(UtteranceArtifact),
    /// The session is over — end-call or unrecoverable failure.
    Ended,
}

/// Commands from the UI collaborator.
#[derive(Debug)]
pub enum SessionCommand {
    SetConfig {
        simultaneous: bool,
        target_language: String,
    },
    EndCall,
}

/// Handle the UI uses to drive a running session.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Update the session config. Takes effect upstream immediately when
    /// connected, otherwise on the next successful open.
    pub async fn set_config(&self, simultaneous: bool, target_language: &str) {
        let _ = self
            .cmd_tx
            .send(SessionCommand::SetConfig {
                simultaneous,
                target_language: target_language.into(),
            })
            .await;
    }

    /// End the call. Irreversible for this session.
    pub async fn end_call(&self) {
        let _ = self.cmd_tx.send(SessionCommand::EndCall).await;
    }
}

// ── Controller ────────────────────────────────────────────────────

/// Injected resources, split out so tests can run the controller without
/// a microphone, speaker, or wake-lock binary.
pub struct SessionParts {
    pub capture: Box<dyn CaptureControl>,
    pub samples_rx: mpsc::Receiver<Vec<f32>>,
    pub sink: Arc<dyn PlaybackSink>,
    pub wake_lock: Option<WakeLock>,
}

/// Orchestrates one call session.
pub struct SessionController {
    config: Config,
    mode: SessionMode,
    ended_by_user: bool,
    vc_uid: String,

    capture: Box<dyn CaptureControl>,
    resampler: LinearResampler,
    chunker: FrameChunker,
    vad: VadSegmenter,
    player: Player,
    connection: ConnectionHandle,
    wake_lock: Option<WakeLock>,
    /// In-memory replay list; the only conversation history kept.
    replay_list: Vec<UtteranceArtifact>,

    session_config_tx: watch::Sender<SessionConfig>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

/// Receive ends the run loop multiplexes over, kept apart from the
/// controller state so select arms and handlers borrow disjoint data.
struct ControllerChannels {
    samples_rx: mpsc::Receiver<Vec<f32>>,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    status_rx: watch::Receiver<ConnectionStatus>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
}

impl SessionController {
    /// Start a call with the real microphone, speaker, and wake lock.
    pub fn start(
        config: Config,
        session_config: SessionConfig,
    ) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionEvent>)> {
        let wake_lock = match WakeLock::acquire() {
            Ok(lock) => Some(lock),
            Err(e) => {
                tracing::warn!(error = %e, "continuing without wake lock");
                None
            }
        };

        let (samples_tx, samples_rx) = mpsc::channel(64);
        let capture = CaptureSource::start(&config.audio, samples_tx)?;
        let sink: Arc<dyn PlaybackSink> = Arc::new(RodioSink::new()?);

        Ok(Self::start_with(
            config,
            session_config,
            SessionParts {
                capture: Box::new(capture),
                samples_rx,
                sink,
                wake_lock,
            },
        ))
    }

    /// Start a call around injected capture/playback resources.
    pub fn start_with(
        config: Config,
        session_config: SessionConfig,
        parts: SessionParts,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (session_config_tx, session_config_rx) = watch::channel(session_config);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);

        let (manager, connection) = ConnectionManager::new(
            config.endpoints.socket_url.clone(),
            config.reconnect.clone(),
            session_config_rx,
            inbound_tx,
        );
        tokio::spawn(manager.run());

        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let player = Player::new(parts.sink, playback_tx);

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let resampler =
            LinearResampler::new(parts.capture.sample_rate(), config.audio.sample_rate);
        let chunker = FrameChunker::new(config.audio.clone());
        let vad = VadSegmenter::new(config.vad.clone(), config.audio.sample_rate);
        let vc_uid = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let status_rx = connection.status_stream();

        let controller = Self {
            config,
            mode: SessionMode::Listening,
            ended_by_user: false,
            vc_uid,
            capture: parts.capture,
            resampler,
            chunker,
            vad,
            player,
            connection,
            wake_lock: parts.wake_lock,
            replay_list: Vec::new(),
            session_config_tx,
            events_tx,
        };
        let channels = ControllerChannels {
            samples_rx: parts.samples_rx,
            inbound_rx,
            playback_rx,
            status_rx,
            cmd_rx,
        };
        tokio::spawn(controller.run(channels));

        (SessionHandle { cmd_tx }, events_rx)
    }

    async fn run(mut self, mut channels: ControllerChannels) {
        self.emit(SessionEvent::StatusChanged(self.connection.status()));

        loop {
            tokio::select! {
                Some(cmd) = channels.cmd_rx.recv() => match cmd {
                    SessionCommand::SetConfig { simultaneous, target_language } => {
                        self.apply_config(simultaneous, target_language).await;
                    }
                    SessionCommand::EndCall => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(message) = channels.inbound_rx.recv() => {
                    self.handle_inbound(message);
                }
                Some(event) = channels.playback_rx.recv() => {
                    self.handle_playback(event);
                }
                Ok(()) = channels.status_rx.changed() => {
                    let status = *channels.status_rx.borrow_and_update();
                    if self.handle_status(status).await {
                        break;
                    }
                }
                Some(samples) = channels.samples_rx.recv() => {
                    self.handle_samples(samples).await;
                }
                else => break,
            }
        }
        tracing::info!("session controller stopped");
    }

    /// Forward one batch of raw capture samples down the outbound leg.
    async fn handle_samples(&mut self, samples: Vec<f32>) {
        if self.mode == SessionMode::Speaking {
            // In-flight leftovers that arrived after the pause gate closed.
            return;
        }

        let samples = self.resampler.process(&samples);

        match self.vad.push(&samples) {
            Ok(Some(artifact)) => {
                self.replay_list.push(artifact.clone());
                self.emit(SessionEvent::UtteranceCaptured(artifact));
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "utterance assembly failed"),
        }

        let frames = match self.chunker.push(&samples) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!(error = %e, "slice encoding failed, dropping batch");
                return;
            }
        };
        for frame in frames {
            let msg = OutboundMessage::start(
                frame.audio_b64,
                frame.format,
                &self.config.audio.prosody,
                &self.vc_uid,
            );
            self.connection.send(&msg).await;
        }
    }

    fn handle_inbound(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::Audio(data) => {
                self.set_mode(SessionMode::Speaking);
                self.player.enqueue(data);
            }
            InboundMessage::Control(ControlSignal::Interrupt) => {
                // Idempotent: interrupting an idle player is a no-op.
                if let Some(point) = self.player.interrupt() {
                    self.emit(SessionEvent::PlaybackInterrupted(point));
                }
                self.set_mode(SessionMode::Listening);
            }
            InboundMessage::Control(ControlSignal::EndOfAudio) => {
                // Utterance boundary marker; queued audio drains naturally.
                tracing::debug!("end of utterance audio");
            }
            InboundMessage::Unrecognized => {
                tracing::warn!("unrecognized inbound message reached controller, dropping");
            }
        }
    }

    fn handle_playback(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Idle => self.set_mode(SessionMode::Listening),
        }
    }

    /// Reflect a status transition; returns true when the session is over.
    async fn handle_status(&mut self, status: ConnectionStatus) -> bool {
        self.emit(SessionEvent::StatusChanged(status));

        if status != ConnectionStatus::Connected {
            // A broken socket must never let stale audio keep playing.
            if let Some(point) = self.player.interrupt() {
                self.emit(SessionEvent::PlaybackInterrupted(point));
            }
            self.set_mode(SessionMode::Listening);
        }

        if status == ConnectionStatus::Disconnected {
            tracing::error!("connection lost for good, ending session");
            self.shutdown().await;
            return true;
        }
        false
    }

    async fn apply_config(&mut self, simultaneous: bool, target_language: String) {
        let new = SessionConfig {
            target_language,
            simultaneous_translation: simultaneous,
        };
        tracing::info!(
            target_lang = %new.target_language,
            simultaneous = new.simultaneous_translation,
            "session config updated"
        );
        self.session_config_tx.send_replace(new.clone());

        // When connected, the remote learns about the change right away;
        // otherwise open() re-sends the current config anyway.
        if self.connection.status() == ConnectionStatus::Connected {
            self.connection.send(&OutboundMessage::config(&new)).await;
        }
    }

    fn set_mode(&mut self, mode: SessionMode) {
        if self.mode == mode {
            return;
        }
        self.mode = mode;
        match mode {
            SessionMode::Speaking => {
                self.capture.pause();
                let dropped = self.chunker.discard_partial();
                if dropped > 0 {
                    tracing::debug!(dropped, "discarded partial slice on pause");
                }
            }
            SessionMode::Listening => {
                if !self.ended_by_user {
                    self.capture.resume();
                }
            }
        }
        self.emit(SessionEvent::ModeChanged(mode));
    }

    /// Tear the session down. Irreversible.
    async fn shutdown(&mut self) {
        self.ended_by_user = true;

        if let Some(point) = self.player.interrupt() {
            self.emit(SessionEvent::PlaybackInterrupted(point));
        }

        self.capture.stop();
        if let Ok(Some(artifact)) = self.vad.finish() {
            self.replay_list.push(artifact.clone());
            self.emit(SessionEvent::UtteranceCaptured(artifact));
        }

        self.connection.close().await;

        if let Some(lock) = self.wake_lock.take() {
            lock.release();
        }

        self.emit(SessionEvent::StatusChanged(ConnectionStatus::Closed));
        self.emit(SessionEvent::Ended);
        tracing::info!(utterances = self.replay_list.len(), "call ended");
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointsConfig, ReconnectConfig};
    use futures_util::{SinkExt, StreamExt};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    // ── Stub capture ──────────────────────────────────────────────

    #[derive(Clone, Default)]
    struct StubCaptureState {
        paused: Arc<AtomicBool>,
        stopped: Arc<AtomicBool>,
    }

    struct StubCapture {
        state: StubCaptureState,
    }

    impl CaptureControl for StubCapture {
        fn pause(&self) {
            self.state.paused.store(true, Ordering::SeqCst);
        }
        fn resume(&self) {
            self.state.paused.store(false, Ordering::SeqCst);
        }
        fn stop(&mut self) {
            self.state.stopped.store(true, Ordering::SeqCst);
        }
        fn sample_rate(&self) -> u32 {
            16_000
        }
    }

    // ── Stub sink: renders for a fixed duration on a thread ───────

    struct DelaySink {
        render_time: Duration,
        begun: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    struct NoopHandle;

    impl crate::audio::RenderHandle for NoopHandle {
        fn stop(&mut self) {}
    }

    impl PlaybackSink for DelaySink {
        fn begin(
            &self,
            audio: Vec<u8>,
            done: Box<dyn FnOnce() + Send + 'static>,
        ) -> crate::error::Result<Box<dyn crate::audio::RenderHandle>> {
            self.begun.lock().push(audio);
            let wait = self.render_time;
            std::thread::spawn(move || {
                std::thread::sleep(wait);
                done();
            });
            Ok(Box::new(NoopHandle))
        }
    }

    // ── Harness ───────────────────────────────────────────────────

    struct Harness {
        handle: SessionHandle,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        samples_tx: mpsc::Sender<Vec<f32>>,
        capture: StubCaptureState,
        begun: Arc<Mutex<Vec<Vec<u8>>>>,
        listener: TcpListener,
    }

    async fn harness(render_time: Duration) -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let config = Config {
            endpoints: EndpointsConfig {
                socket_url: url,
                ..EndpointsConfig::default()
            },
            reconnect: ReconnectConfig {
                delay_secs: 0,
                max_attempts: Some(5),
            },
            ..Config::default()
        };

        let capture = StubCaptureState::default();
        let begun = Arc::new(Mutex::new(Vec::new()));
        let (samples_tx, samples_rx) = mpsc::channel(64);

        let parts = SessionParts {
            capture: Box::new(StubCapture {
                state: capture.clone(),
            }),
            samples_rx,
            sink: Arc::new(DelaySink {
                render_time,
                begun: Arc::clone(&begun),
            }),
            wake_lock: None,
        };

        let session_config = SessionConfig {
            target_language: "英语".into(),
            simultaneous_translation: false,
        };

        let (handle, events) = SessionController::start_with(config, session_config, parts);

        Harness {
            handle,
            events,
            samples_tx,
            capture,
            begun,
            listener,
        }
    }

    async fn accept(
        listener: &TcpListener,
    ) -> tokio_tungstenite::WebSocketStream<tokio::net::TcpStream> {
        let (socket, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(socket).await.unwrap()
    }

    async fn next_text(
        server: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    ) -> String {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), server.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap()
            {
                WsMessage::Text(text) => return text.to_string(),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed")
    }

    async fn wait_for_mode(
        events: &mut mpsc::UnboundedReceiver<SessionEvent>,
        want: SessionMode,
    ) {
        loop {
            if let SessionEvent::ModeChanged(mode) = next_event(events).await {
                if mode == want {
                    return;
                }
            }
        }
    }

    // ── Tests ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn config_flows_first_then_audio_slices() {
        let mut h = harness(Duration::from_millis(10)).await;
        let mut server = accept(&h.listener).await;

        let first = next_text(&mut server).await;
        let value: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(value["type"], "config");
        assert_eq!(value["data"]["target_lang"], "英语");
        assert_eq!(value["data"]["is_simultaneous"], false);

        // One slice worth of samples (16 kHz × 100 ms) arrives
        h.samples_tx.send(vec![0.1; 1600]).await.unwrap();

        let second = next_text(&mut server).await;
        let value: serde_json::Value = serde_json::from_str(&second).unwrap();
        assert_eq!(value["type"], "start");
        assert!(!value["request"]["audio"].as_str().unwrap().is_empty());

        h.handle.end_call().await;
    }

    #[tokio::test]
    async fn inbound_audio_switches_to_speaking_and_pauses_capture() {
        let mut h = harness(Duration::from_millis(200)).await;
        let mut server = accept(&h.listener).await;
        let _config = next_text(&mut server).await;

        server
            .send(WsMessage::Binary(vec![9u8; 32].into()))
            .await
            .unwrap();

        wait_for_mode(&mut h.events, SessionMode::Speaking).await;
        assert!(h.capture.paused.load(Ordering::SeqCst));
        assert_eq!(h.begun.lock().len(), 1);

        // Natural drain hands the turn back
        wait_for_mode(&mut h.events, SessionMode::Listening).await;
        assert!(!h.capture.paused.load(Ordering::SeqCst));

        h.handle.end_call().await;
    }

    #[tokio::test]
    async fn interrupt_signal_cuts_playback_and_returns_to_listening() {
        let mut h = harness(Duration::from_secs(5)).await;
        let mut server = accept(&h.listener).await;
        let _config = next_text(&mut server).await;

        // Three fragments; the first renders slowly, two stay queued
        for n in 1..=3u8 {
            server
                .send(WsMessage::Binary(vec![n; 16].into()))
                .await
                .unwrap();
        }
        wait_for_mode(&mut h.events, SessionMode::Speaking).await;

        server
            .send(WsMessage::Text(r#"{"event": "interrupt"}"#.into()))
            .await
            .unwrap();

        // The interrupt reports the fragment that was cut and flips the mode
        loop {
            match next_event(&mut h.events).await {
                SessionEvent::PlaybackInterrupted(point) => {
                    assert_eq!(point.fragment_index, 0);
                    break;
                }
                _ => continue,
            }
        }
        wait_for_mode(&mut h.events, SessionMode::Listening).await;
        assert_eq!(h.begun.lock().len(), 1);

        // Playback still works afterwards
        server
            .send(WsMessage::Binary(vec![7u8; 16].into()))
            .await
            .unwrap();
        wait_for_mode(&mut h.events, SessionMode::Speaking).await;
        assert_eq!(h.begun.lock().len(), 2);

        h.handle.end_call().await;
    }

    #[tokio::test]
    async fn end_call_releases_capture_and_closes() {
        let mut h = harness(Duration::from_millis(10)).await;
        let mut server = accept(&h.listener).await;
        let _config = next_text(&mut server).await;

        h.handle.end_call().await;

        let mut saw_closed = false;
        loop {
            match next_event(&mut h.events).await {
                SessionEvent::StatusChanged(ConnectionStatus::Closed) => saw_closed = true,
                SessionEvent::Ended => break,
                _ => continue,
            }
        }
        assert!(saw_closed);
        assert!(h.capture.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn set_config_while_connected_resends_config() {
        let mut h = harness(Duration::from_millis(10)).await;
        let mut server = accept(&h.listener).await;
        let _config = next_text(&mut server).await;

        h.handle.set_config(true, "韩语").await;

        let resent = next_text(&mut server).await;
        let value: serde_json::Value = serde_json::from_str(&resent).unwrap();
        assert_eq!(value["type"], "config");
        assert_eq!(value["data"]["is_simultaneous"], true);
        assert_eq!(value["data"]["target_lang"], "韩语");

        h.handle.end_call().await;
    }

    #[tokio::test]
    async fn config_changed_while_disconnected_is_sent_on_reopen() {
        let mut h = harness(Duration::from_millis(10)).await;

        // First connection, then the peer drops it
        let server = accept(&h.listener).await;
        drop(server);

        h.handle.set_config(true, "日语").await;

        // The reconnect sends the updated config first
        let mut server = accept(&h.listener).await;
        let first = next_text(&mut server).await;
        let value: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(value["type"], "config");
        assert_eq!(value["data"]["target_lang"], "日语");

        h.handle.end_call().await;
    }

    #[tokio::test]
    async fn socket_break_interrupts_stale_playback() {
        let mut h = harness(Duration::from_secs(5)).await;
        let mut server = accept(&h.listener).await;
        let _config = next_text(&mut server).await;

        server
            .send(WsMessage::Binary(vec![1u8; 16].into()))
            .await
            .unwrap();
        wait_for_mode(&mut h.events, SessionMode::Speaking).await;

        drop(server);

        // Stale audio is cut when the transport breaks
        loop {
            if let SessionEvent::PlaybackInterrupted(_) = next_event(&mut h.events).await {
                break;
            }
        }

        let _server = accept(&h.listener).await;
        h.handle.end_call().await;
    }
}
