//! Typed payloads carried by the push-event stream
//!
//! Every payload is a JSON object with a `type` discriminator. Unknown
//! types deserialize into `Other` so a newer backend never breaks the
//! channel.

use serde::Deserialize;

/// One event from the session's push stream
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A committed fragment of the user's speech
    Transcription { text: String },
    /// Partial or final AI response text
    Response {
        text: String,
        #[serde(rename = "final", default)]
        is_final: bool,
    },
    /// Server-side failure the user should see
    Error { message: String },
    /// Connection health as observed by the backend
    Connection { connected: bool },
    /// Progress notice that belongs in the transcript but not the history
    Log { text: String },
    /// Keepalive; logged only, never dispatched
    Heartbeat { timestamp: f64 },
    /// Forward-compatibility catch-all
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcription_deserialization() {
        let json = r#"{"type": "transcription", "text": "hello there"}"#;
        match serde_json::from_str::<StreamEvent>(json).unwrap() {
            StreamEvent::Transcription { text } => assert_eq!(text, "hello there"),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_response_final_flag() {
        let json = r#"{"type": "response", "text": "Hello world", "final": true}"#;
        match serde_json::from_str::<StreamEvent>(json).unwrap() {
            StreamEvent::Response { text, is_final } => {
                assert_eq!(text, "Hello world");
                assert!(is_final);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_response_final_defaults_to_partial() {
        let json = r#"{"type": "response", "text": "Hello"}"#;
        match serde_json::from_str::<StreamEvent>(json).unwrap() {
            StreamEvent::Response { is_final, .. } => assert!(!is_final),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_deserialization() {
        let json = r#"{"type": "heartbeat", "timestamp": 1756300000.25}"#;
        match serde_json::from_str::<StreamEvent>(json).unwrap() {
            StreamEvent::Heartbeat { timestamp } => assert!(timestamp > 0.0),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_other() {
        let json = r#"{"type": "status", "data": {"message_count": 3}}"#;
        match serde_json::from_str::<StreamEvent>(json).unwrap() {
            StreamEvent::Other => {}
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_missing_field_is_error() {
        let json = r#"{"type": "error"}"#;
        assert!(serde_json::from_str::<StreamEvent>(json).is_err());
    }
}
