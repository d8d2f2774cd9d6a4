//! Conversation transcript reconciliation
//!
//! The transcript is the single ordered view of the conversation. Events
//! arrive partial, repeated and out of order; this module merges them into
//! a stable message list: duplicate speech fragments are dropped, partial
//! responses revise one open assistant message in place, and local
//! placeholders are resolved where they stand instead of appended again.

use crate::events::StreamEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

/// Who a transcript message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Transcribed or typed user speech
    User,
    /// AI response text
    Assistant,
    /// Locally generated status, e.g. connection loss
    System,
    /// Server progress notices and errors
    Log,
}

/// One entry in the transcript
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptMessage {
    pub role: Role,
    pub content: String,
    /// Local correlation id; only placeholders carry one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// An open message is still being revised by partial events
    pub open: bool,
    pub timestamp: DateTime<Utc>,
    /// True while a placeholder waits for its server-side outcome
    #[serde(skip)]
    unresolved: bool,
}

impl TranscriptMessage {
    fn new(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            id: None,
            open: false,
            timestamp: Utc::now(),
            unresolved: false,
        }
    }
}

/// Ordered, reconciled view of the conversation
#[derive(Debug, Default)]
pub struct Transcript {
    messages: Vec<TranscriptMessage>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current messages, oldest first
    pub fn messages(&self) -> &[TranscriptMessage] {
        &self.messages
    }

    /// Append a user message the user typed locally
    ///
    /// A message identical to the latest user entry is dropped, matching
    /// how transcribed fragments are deduplicated.
    pub fn push_user(&mut self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        if self.is_duplicate_user(text) {
            return false;
        }
        self.messages
            .push(TranscriptMessage::new(Role::User, text.to_string()));
        true
    }

    /// Append a locally generated status line
    pub fn push_system(&mut self, text: &str) {
        self.messages
            .push(TranscriptMessage::new(Role::System, text.to_string()));
    }

    /// Append a log entry unconditionally, leaving pending placeholders alone
    ///
    /// Used for channel-level notices such as a forced disconnect; unlike a
    /// streamed log event this never stands in for a command's outcome.
    pub fn push_log(&mut self, text: &str) {
        self.messages
            .push(TranscriptMessage::new(Role::Log, text.to_string()));
    }

    /// Insert a pending placeholder and return its correlation id
    ///
    /// The placeholder holds the conversation position for a slow command
    /// (think, screenshot); the eventual response or log resolves it in
    /// place rather than appending at the tail.
    pub fn add_placeholder(&mut self, text: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let mut message = TranscriptMessage::new(Role::Log, text.to_string());
        message.id = Some(id.clone());
        message.unresolved = true;
        self.messages.push(message);
        id
    }

    /// Resolve a placeholder by its correlation id, keeping its position
    ///
    /// Returns false when the id is unknown or already resolved.
    pub fn resolve_placeholder(&mut self, id: &str, text: &str) -> bool {
        for message in self.messages.iter_mut() {
            if message.unresolved && message.id.as_deref() == Some(id) {
                message.content = text.to_string();
                message.unresolved = false;
                return true;
            }
        }
        false
    }

    /// Apply one stream event; returns true when the transcript changed
    pub fn apply(&mut self, event: &StreamEvent) -> bool {
        match event {
            StreamEvent::Transcription { text } => self.apply_transcription(text),
            StreamEvent::Response { text, is_final } => self.apply_response(text, *is_final),
            StreamEvent::Log { text } => self.apply_log(text),
            StreamEvent::Error { message } => {
                self.apply_log(&format!("Error: {}", message));
                true
            }
            StreamEvent::Connection { .. } | StreamEvent::Heartbeat { .. } | StreamEvent::Other => {
                false
            }
        }
    }

    fn apply_transcription(&mut self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        if self.is_duplicate_user(text) {
            debug!("Dropping duplicate transcription fragment");
            return false;
        }
        self.messages
            .push(TranscriptMessage::new(Role::User, text.to_string()));
        true
    }

    fn apply_response(&mut self, text: &str, is_final: bool) -> bool {
        // Revise the open assistant message if there is one
        if let Some(message) = self
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.role == Role::Assistant && m.open)
        {
            message.content = text.to_string();
            if is_final {
                message.open = false;
            }
            return true;
        }

        // Otherwise the response belongs to the oldest pending command
        if let Some(message) = self.messages.iter_mut().find(|m| m.unresolved) {
            message.role = Role::Assistant;
            message.content = text.to_string();
            message.open = !is_final;
            message.unresolved = false;
            return true;
        }

        let mut message = TranscriptMessage::new(Role::Assistant, text.to_string());
        message.open = !is_final;
        self.messages.push(message);
        true
    }

    fn apply_log(&mut self, text: &str) -> bool {
        if let Some(message) = self.messages.iter_mut().find(|m| m.unresolved) {
            message.content = text.to_string();
            message.unresolved = false;
            return true;
        }
        self.messages
            .push(TranscriptMessage::new(Role::Log, text.to_string()));
        true
    }

    fn is_duplicate_user(&self, text: &str) -> bool {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .is_some_and(|m| m.content == text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(text: &str, is_final: bool) -> StreamEvent {
        StreamEvent::Response {
            text: text.to_string(),
            is_final,
        }
    }

    fn transcription(text: &str) -> StreamEvent {
        StreamEvent::Transcription {
            text: text.to_string(),
        }
    }

    #[test]
    fn test_partials_revise_one_message() {
        let mut transcript = Transcript::new();
        assert!(transcript.apply(&response("Hello", false)));
        assert!(transcript.apply(&response("Hello wor", false)));
        assert!(transcript.apply(&response("Hello world", true)));

        assert_eq!(transcript.messages().len(), 1);
        let message = &transcript.messages()[0];
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.content, "Hello world");
        assert!(!message.open);
    }

    #[test]
    fn test_final_closes_then_next_response_is_new() {
        let mut transcript = Transcript::new();
        transcript.apply(&response("First answer", true));
        transcript.apply(&response("Second answer", false));

        assert_eq!(transcript.messages().len(), 2);
        assert!(!transcript.messages()[0].open);
        assert!(transcript.messages()[1].open);
    }

    #[test]
    fn test_duplicate_transcription_dropped() {
        let mut transcript = Transcript::new();
        assert!(transcript.apply(&transcription("ping")));
        assert!(!transcript.apply(&transcription("ping")));
        assert_eq!(transcript.messages().len(), 1);
    }

    #[test]
    fn test_repeated_text_after_other_speech_kept() {
        let mut transcript = Transcript::new();
        transcript.apply(&transcription("ping"));
        transcript.apply(&transcription("pong"));
        assert!(transcript.apply(&transcription("ping")));
        assert_eq!(transcript.messages().len(), 3);
    }

    #[test]
    fn test_empty_transcription_ignored() {
        let mut transcript = Transcript::new();
        assert!(!transcript.apply(&transcription("   ")));
        assert!(transcript.messages().is_empty());
    }

    #[test]
    fn test_placeholder_resolved_in_place() {
        let mut transcript = Transcript::new();
        transcript.apply(&transcription("question one"));
        transcript.add_placeholder("Analyzing the conversation...");
        transcript.apply(&transcription("question two"));

        let before = transcript.messages().len();
        assert!(transcript.apply(&response("Here is my analysis", true)));
        assert_eq!(transcript.messages().len(), before);

        let resolved = &transcript.messages()[1];
        assert_eq!(resolved.role, Role::Assistant);
        assert_eq!(resolved.content, "Here is my analysis");
        assert!(!resolved.open);
    }

    #[test]
    fn test_log_resolves_oldest_placeholder() {
        let mut transcript = Transcript::new();
        transcript.add_placeholder("Capturing screenshot...");
        transcript.add_placeholder("Analyzing the conversation...");

        assert!(transcript.apply(&StreamEvent::Log {
            text: "Screenshot captured".to_string(),
        }));
        assert_eq!(transcript.messages()[0].content, "Screenshot captured");
        assert_eq!(
            transcript.messages()[1].content,
            "Analyzing the conversation..."
        );
    }

    #[test]
    fn test_resolve_placeholder_by_id() {
        let mut transcript = Transcript::new();
        let id = transcript.add_placeholder("Capturing screenshot...");

        assert!(transcript.resolve_placeholder(&id, "Screenshot failed: timed out"));
        assert!(!transcript.resolve_placeholder(&id, "again"));
        assert!(!transcript.resolve_placeholder("no-such-id", "text"));
        assert_eq!(
            transcript.messages()[0].content,
            "Screenshot failed: timed out"
        );
    }

    #[test]
    fn test_error_event_appends_log() {
        let mut transcript = Transcript::new();
        assert!(transcript.apply(&StreamEvent::Error {
            message: "model overloaded".to_string(),
        }));
        let message = &transcript.messages()[0];
        assert_eq!(message.role, Role::Log);
        assert_eq!(message.content, "Error: model overloaded");
    }

    #[test]
    fn test_connection_and_heartbeat_do_not_change_transcript() {
        let mut transcript = Transcript::new();
        assert!(!transcript.apply(&StreamEvent::Connection { connected: true }));
        assert!(!transcript.apply(&StreamEvent::Heartbeat { timestamp: 1.0 }));
        assert!(transcript.messages().is_empty());
    }

    #[test]
    fn test_push_log_appends_without_resolving_placeholders() {
        let mut transcript = Transcript::new();
        transcript.add_placeholder("Capturing screenshot...");

        transcript.push_log("Connection closed: session ended");

        assert_eq!(transcript.messages().len(), 2);
        assert_eq!(
            transcript.messages()[0].content,
            "Capturing screenshot..."
        );
        let appended = &transcript.messages()[1];
        assert_eq!(appended.role, Role::Log);
        assert_eq!(appended.content, "Connection closed: session ended");
    }

    #[test]
    fn test_push_user_dedupes_and_trims() {
        let mut transcript = Transcript::new();
        assert!(transcript.push_user("  hello  "));
        assert!(!transcript.push_user("hello"));
        assert!(!transcript.push_user(""));
        assert_eq!(transcript.messages().len(), 1);
        assert_eq!(transcript.messages()[0].content, "hello");
    }
}
