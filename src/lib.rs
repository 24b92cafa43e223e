//! voxwire — real-time voice call client.
//!
//! Holds a live, bidirectional audio conversation with a remote speech
//! service over a persistent WebSocket: microphone audio streams outward
//! as it is captured, while translated audio fragments stream back and
//! play in arrival order, interruptible mid-stream. The session survives
//! transport failures through fixed-delay reconnection and ends only on an
//! explicit end-call or when the retry ceiling is exhausted.
//!
//! Crate layout:
//! - [`session`] — session model, controller, connection manager, wire protocol
//! - [`audio`] — capture, slice encoding, playback queue, utterance segmentation
//! - [`relay`] — the one-shot negotiation forwarding endpoint
//! - [`config`] — deployment parameters
//! - [`wake`] — wake-lock guard for the call duration

pub mod audio;
pub mod config;
pub mod error;
pub mod relay;
pub mod session;
pub mod wake;

pub use config::Config;
pub use error::{CallError, Result};
pub use session::{SessionConfig, SessionController, SessionEvent, SessionHandle};
