//! Error taxonomy for the call client.
//!
//! Three classes with different propagation policies: transport errors are
//! recovered locally by the reconnect loop, device errors end the call and
//! are surfaced to the user, protocol errors are logged and the offending
//! message is dropped.

use thiserror::Error;

/// Errors produced by the streaming call session.
#[derive(Error, Debug)]
pub enum CallError {
    /// Socket open/close/error failures. Recovered by reconnection unless
    /// the attempt ceiling is exhausted.
    #[error("transport error: {0}")]
    Transport(String),

    /// Microphone or output device acquisition failure. The call cannot
    /// proceed; surfaced to the user immediately.
    #[error("audio device error: {0}")]
    Device(String),

    /// Inbound payload that is neither recognized audio nor a recognized
    /// control signal. The message is dropped; the session continues.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// The session has already been ended by the user.
    #[error("session ended")]
    SessionEnded,
}

impl CallError {
    /// Whether the session can keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            CallError::Transport(_) => true,
            CallError::Protocol(_) => true,
            CallError::Device(_) => false,
            CallError::Config(_) => false,
            CallError::SessionEnded => false,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_protocol_are_recoverable() {
        assert!(CallError::Transport("reset".into()).is_recoverable());
        assert!(CallError::Protocol("garbage frame".into()).is_recoverable());
    }

    #[test]
    fn device_errors_end_the_call() {
        assert!(!CallError::Device("no input device".into()).is_recoverable());
        assert!(!CallError::SessionEnded.is_recoverable());
    }

    #[test]
    fn display_includes_class() {
        let e = CallError::Transport("connection reset".into());
        assert!(e.to_string().contains("transport"));
    }
}
