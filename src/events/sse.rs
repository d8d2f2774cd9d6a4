//! Incremental Server-Sent Events frame parser
//!
//! The stream body arrives in arbitrary byte slices; this parser buffers
//! them and yields complete `data:` payloads as frames are terminated by a
//! blank line. Comment lines and non-data fields are skipped.

/// Incremental SSE parser. Feed it raw body bytes, collect data payloads.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseParser {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Consume one chunk of body bytes and return every payload completed
    /// by it, in order.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // Blank line terminates the frame
                if !self.data_lines.is_empty() {
                    payloads.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data_lines
                    .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            } else if line.starts_with(':') {
                // Comment / keepalive line
            } else {
                // event:, id:, retry: fields are not used by this backend
            }
        }
        payloads
    }
}
