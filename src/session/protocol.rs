//! Wire contract with the remote speech service.
//!
//! All outbound traffic is JSON text frames. Inbound traffic is mixed:
//! binary frames carry opaque audio payloads for playback, text frames
//! carry JSON control signals. Two end-of-utterance framings exist in the
//! wild — an explicit typed control message and an in-band byte sentinel
//! embedded in a binary payload — and both are detected here, with the
//! typed form authoritative.

use serde::{Deserialize, Serialize};

use crate::config::{AudioWireFormat, ProsodyConfig};
use crate::session::SessionConfig;

/// In-band end-of-utterance marker some service revisions embed in a
/// binary payload instead of sending the typed control message.
pub const END_OF_AUDIO_SENTINEL: &[u8] = b"END_OF_AUDIO";

// ── Outbound messages ─────────────────────────────────────────────

/// Messages sent from the client to the speech service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    /// Session configuration. Sent once immediately after connect and again
    /// whenever the configuration changes.
    #[serde(rename = "config")]
    Config { data: ConfigData },

    /// One captured audio slice.
    #[serde(rename = "start")]
    Start { request: StartRequest },
}

/// Payload of the config control message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigData {
    pub is_simultaneous: bool,
    pub target_lang: String,
}

/// Payload of one outbound audio message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    /// Base64-encoded audio slice.
    pub audio: String,
    /// Latency hint. Always "normal".
    pub latency: String,
    /// Audio container format ("opus" or "wav").
    pub format: String,
    pub prosody: Prosody,
    /// Caller reference id, stable for the session.
    pub vc_uid: String,
}

/// Prosody hints attached to every audio message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prosody {
    pub speed: f64,
    pub volume: f64,
}

impl OutboundMessage {
    /// Build the config control message from the current session config.
    pub fn config(config: &SessionConfig) -> Self {
        Self::Config {
            data: ConfigData {
                is_simultaneous: config.simultaneous_translation,
                target_lang: config.target_language.clone(),
            },
        }
    }

    /// Build an audio message from an encoded slice.
    pub fn start(
        audio_b64: String,
        format: AudioWireFormat,
        prosody: &ProsodyConfig,
        vc_uid: &str,
    ) -> Self {
        Self::Start {
            request: StartRequest {
                audio: audio_b64,
                latency: "normal".into(),
                format: format.as_str().into(),
                prosody: Prosody {
                    speed: prosody.speed,
                    volume: prosody.volume,
                },
                vc_uid: vc_uid.into(),
            },
        }
    }
}

// ── Outbound frames ───────────────────────────────────────────────

/// A timestamped, encoded slice of captured audio ready for transmission.
///
/// Immutable once built; a dropped frame is never retransmitted.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Base64-encoded audio payload.
    pub audio_b64: String,
    /// Container format of the payload.
    pub format: AudioWireFormat,
    /// Capture timestamp of the slice start.
    pub captured_at: chrono::DateTime<chrono::Utc>,
}

// ── Inbound classification ────────────────────────────────────────

/// A classified inbound socket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Opaque audio payload destined for the playback queue.
    Audio(Vec<u8>),
    /// A control signal for the session controller.
    Control(ControlSignal),
    /// Recognized as neither audio nor a known control signal. Logged and
    /// dropped by the caller; never terminates the session.
    Unrecognized,
}

/// Control signals the service sends out-of-band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Halt playback immediately and return to listening.
    Interrupt,
    /// The current utterance's audio is complete.
    EndOfAudio,
}

/// Parse a text frame as a control signal.
///
/// Tolerant of extra fields; only the `event` discriminator matters.
pub fn parse_control_text(text: &str) -> Option<ControlSignal> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    match value.get("event").and_then(|v| v.as_str()) {
        Some("interrupt") => Some(ControlSignal::Interrupt),
        Some("end_of_audio") => Some(ControlSignal::EndOfAudio),
        _ => None,
    }
}

/// Whether a binary payload carries the in-band end-of-utterance sentinel.
pub fn contains_end_sentinel(data: &[u8]) -> bool {
    data.windows(END_OF_AUDIO_SENTINEL.len())
        .any(|w| w == END_OF_AUDIO_SENTINEL)
}

/// Classify one inbound binary frame.
///
/// JSON-shaped binary frames (first byte `{`) are parsed as control
/// messages first — some transports deliver every message as a binary
/// frame. The sentinel scan runs before any decode attempt so sentinel
/// bytes are never fed to the audio decoder.
pub fn classify_binary(data: Vec<u8>) -> InboundMessage {
    if data.is_empty() {
        return InboundMessage::Unrecognized;
    }

    if data.first() == Some(&b'{') {
        if let Ok(text) = std::str::from_utf8(&data) {
            if let Some(signal) = parse_control_text(text) {
                return InboundMessage::Control(signal);
            }
            if serde_json::from_str::<serde_json::Value>(text).is_ok() {
                // Valid JSON but not a known control signal
                return InboundMessage::Unrecognized;
            }
        }
    }

    if contains_end_sentinel(&data) {
        return InboundMessage::Control(ControlSignal::EndOfAudio);
    }

    InboundMessage::Audio(data)
}

/// Classify one inbound text frame.
pub fn classify_text(text: &str) -> InboundMessage {
    match parse_control_text(text) {
        Some(signal) => InboundMessage::Control(signal),
        None => InboundMessage::Unrecognized,
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn session_config(lang: &str, simultaneous: bool) -> SessionConfig {
        SessionConfig {
            target_language: lang.into(),
            simultaneous_translation: simultaneous,
        }
    }

    #[test]
    fn config_message_wire_shape() {
        let msg = OutboundMessage::config(&session_config("英语", false));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"config\""));
        assert!(json.contains("\"is_simultaneous\":false"));
        assert!(json.contains("\"target_lang\":\"英语\""));
    }

    #[test]
    fn start_message_wire_shape() {
        let msg = OutboundMessage::start(
            "QUJD".into(),
            AudioWireFormat::Opus,
            &ProsodyConfig::default(),
            "c9cf4e49",
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"start\""));
        assert!(json.contains("\"audio\":\"QUJD\""));
        assert!(json.contains("\"latency\":\"normal\""));
        assert!(json.contains("\"format\":\"opus\""));
        assert!(json.contains("\"speed\":1.0"));
        assert!(json.contains("\"vc_uid\":\"c9cf4e49\""));
    }

    #[test]
    fn outbound_round_trip() {
        let msg = OutboundMessage::config(&session_config("中文", true));
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: OutboundMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            OutboundMessage::Config { data } => {
                assert!(data.is_simultaneous);
                assert_eq!(data.target_lang, "中文");
            }
            OutboundMessage::Start { .. } => panic!("wrong variant"),
        }
    }

    #[test]
    fn parse_interrupt_control() {
        assert_eq!(
            parse_control_text(r#"{"event": "interrupt"}"#),
            Some(ControlSignal::Interrupt)
        );
    }

    #[test]
    fn parse_end_of_audio_control() {
        assert_eq!(
            parse_control_text(r#"{"event": "end_of_audio", "extra": 1}"#),
            Some(ControlSignal::EndOfAudio)
        );
    }

    #[test]
    fn unknown_event_is_not_a_control() {
        assert_eq!(parse_control_text(r#"{"event": "warble"}"#), None);
        assert_eq!(parse_control_text("not json"), None);
    }

    #[test]
    fn binary_audio_passes_through() {
        // RIFF header — typical WAV payload start
        let data = b"RIFF\x24\x00\x00\x00WAVE".to_vec();
        assert_eq!(classify_binary(data.clone()), InboundMessage::Audio(data));
    }

    #[test]
    fn binary_json_control_is_detected() {
        let data = br#"{"event": "interrupt"}"#.to_vec();
        assert_eq!(
            classify_binary(data),
            InboundMessage::Control(ControlSignal::Interrupt)
        );
    }

    #[test]
    fn binary_json_garbage_is_unrecognized() {
        let data = br#"{"something": "else"}"#.to_vec();
        assert_eq!(classify_binary(data), InboundMessage::Unrecognized);
    }

    #[test]
    fn sentinel_detected_anywhere_in_payload() {
        let mut data = vec![0u8, 1, 2];
        data.extend_from_slice(END_OF_AUDIO_SENTINEL);
        data.extend_from_slice(&[3, 4]);
        assert_eq!(
            classify_binary(data),
            InboundMessage::Control(ControlSignal::EndOfAudio)
        );
    }

    #[test]
    fn sentinel_never_reaches_audio_classification() {
        let data = END_OF_AUDIO_SENTINEL.to_vec();
        assert!(matches!(
            classify_binary(data),
            InboundMessage::Control(ControlSignal::EndOfAudio)
        ));
    }

    #[test]
    fn typed_control_wins_over_embedded_sentinel() {
        // Both framings in one payload: the typed form is authoritative.
        let data = br#"{"event": "interrupt", "note": "END_OF_AUDIO"}"#.to_vec();
        assert_eq!(
            classify_binary(data),
            InboundMessage::Control(ControlSignal::Interrupt)
        );
    }

    #[test]
    fn empty_binary_is_unrecognized() {
        assert_eq!(classify_binary(Vec::new()), InboundMessage::Unrecognized);
    }

    #[test]
    fn text_frame_classification() {
        assert_eq!(
            classify_text(r#"{"event": "interrupt"}"#),
            InboundMessage::Control(ControlSignal::Interrupt)
        );
        assert_eq!(classify_text("hello"), InboundMessage::Unrecognized);
    }
}
