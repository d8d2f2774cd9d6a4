//! Wire messages for the audio WebSocket

use crate::audio::AudioChunk;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Messages sent to the backend audio endpoint
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum AudioClientMessage {
    /// One chunk of microphone audio
    AudioData {
        session_id: String,
        /// Base64-encoded PCM 16-bit little-endian mono samples
        audio: String,
    },
}

/// Acknowledgement for an audio frame
#[derive(Debug, Deserialize)]
pub(crate) struct AudioAck {
    pub(crate) received: bool,
    #[serde(default)]
    pub(crate) samples: Option<u64>,
    #[serde(default)]
    pub(crate) error: Option<String>,
}

impl AudioAck {
    /// The session cannot accept audio anymore; reconnecting will not help
    pub(crate) fn is_session_gone(&self) -> bool {
        self.error.as_deref().is_some_and(|e| {
            let e = e.to_ascii_lowercase();
            e.contains("session not found") || e.contains("not recording")
        })
    }
}

/// Encode a chunk's samples as base64 PCM16LE
pub(crate) fn encode_chunk(chunk: &AudioChunk) -> String {
    let bytes: Vec<u8> = chunk
        .samples
        .iter()
        .flat_map(|&s| s.to_le_bytes())
        .collect();
    base64::engine::general_purpose::STANDARD.encode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_data_serialization() {
        let msg = AudioClientMessage::AudioData {
            session_id: "42".to_string(),
            audio: "AAA=".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"audio_data\""));
        assert!(json.contains("\"session_id\":\"42\""));
        assert!(json.contains("\"audio\":\"AAA=\""));
    }

    #[test]
    fn test_ack_deserialization() {
        let json = r#"{"received": true, "samples": 4800}"#;
        let ack: AudioAck = serde_json::from_str(json).unwrap();
        assert!(ack.received);
        assert_eq!(ack.samples, Some(4800));
        assert!(!ack.is_session_gone());
    }

    #[test]
    fn test_ack_session_gone() {
        let json = r#"{"received": false, "error": "Session not found"}"#;
        let ack: AudioAck = serde_json::from_str(json).unwrap();
        assert!(ack.is_session_gone());

        let json = r#"{"received": false, "error": "Session is not recording"}"#;
        let ack: AudioAck = serde_json::from_str(json).unwrap();
        assert!(ack.is_session_gone());

        let json = r#"{"received": false, "error": "internal error"}"#;
        let ack: AudioAck = serde_json::from_str(json).unwrap();
        assert!(!ack.is_session_gone());
    }

    #[test]
    fn test_encode_chunk_little_endian() {
        let chunk = AudioChunk {
            samples: vec![1, -1],
            sample_rate: 16000,
        };
        // 0x0001 -> 01 00, 0xFFFF -> FF FF
        let encoded = encode_chunk(&chunk);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert_eq!(decoded, vec![0x01, 0x00, 0xFF, 0xFF]);
    }
}
