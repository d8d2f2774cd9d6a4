//! HTTP client for the backend session API
//!
//! Covers session lifecycle (create/start/end/status) plus the text, think
//! and screenshot commands. The event stream endpoint is consumed by the
//! events module through [`SessionApi::open_stream`].

use crate::config::BackendConfig;
use crate::error::ApiError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Timeout for ordinary request/response calls
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Connect timeout, also applied to the streaming client
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Client for the backend session API
pub struct SessionApi {
    base_url: String,
    auth_token: Option<String>,
    /// Client with a total request timeout, for request/response calls
    client: reqwest::Client,
    /// Client without a total timeout, for the long-lived event stream
    stream_client: reqwest::Client,
}

/// Reported session status, used as the event-channel liveness probe
#[derive(Debug, Clone, Deserialize)]
pub struct SessionStatus {
    pub is_active: bool,
    pub is_recording: bool,
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    success: bool,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommandResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    success: bool,
    #[serde(default)]
    status: Option<SessionStatus>,
}

#[derive(Debug, Serialize)]
struct TextRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct ScreenshotRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    monitor_index: Option<u32>,
}

impl SessionApi {
    /// Create a new API client from backend settings
    pub fn new(backend: &BackendConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;

        // The event stream stays open indefinitely, so no total timeout here
        let stream_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            base_url: backend.base_url.trim_end_matches('/').to_string(),
            auth_token: backend.auth_token.clone(),
            client,
            stream_client,
        })
    }

    /// Base URL this client talks to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Bearer token attached to every request, if configured
    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    /// Request a new session id from the backend
    pub async fn create_session(&self) -> Result<String, ApiError> {
        let url = format!("{}/sessions", self.base_url);
        let response = self
            .attach_auth(self.client.post(&url))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(map_send_error)?;

        let response = check_status(response).await?;
        let body: CreateSessionResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;

        match body.session_id {
            Some(id) if body.success && !id.is_empty() => {
                info!("Created session {}", id);
                Ok(id)
            }
            _ => Err(ApiError::InvalidResponse(
                "create response carried no session id".to_string(),
            )),
        }
    }

    /// Start a previously created session
    pub async fn start_session(&self, session_id: &str) -> Result<(), ApiError> {
        self.post_command(session_id, "start", serde_json::json!({}))
            .await
    }

    /// End a session server-side
    pub async fn end_session(&self, session_id: &str) -> Result<(), ApiError> {
        self.post_command(session_id, "end", serde_json::json!({}))
            .await
    }

    /// Probe whether a session still exists and what it is doing
    pub async fn session_status(&self, session_id: &str) -> Result<SessionStatus, ApiError> {
        let url = format!("{}/sessions/{}/status", self.base_url, session_id);
        let response = self
            .attach_auth(self.client.get(&url))
            .send()
            .await
            .map_err(map_send_error)?;

        let response = check_status(response).await?;
        let body: StatusResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;

        match body.status {
            Some(status) if body.success => Ok(status),
            _ => Err(ApiError::InvalidResponse(
                "status response carried no status object".to_string(),
            )),
        }
    }

    /// Send a text message into the conversation
    pub async fn send_text(&self, session_id: &str, text: &str) -> Result<(), ApiError> {
        self.post_command(
            session_id,
            "text",
            serde_json::to_value(TextRequest { text })
                .map_err(|e| ApiError::InvalidResponse(e.to_string()))?,
        )
        .await
    }

    /// Kick off the server-side conversation analysis; results arrive as
    /// response events on the stream
    pub async fn think(&self, session_id: &str) -> Result<(), ApiError> {
        self.post_command(session_id, "think", serde_json::json!({}))
            .await
    }

    /// Ask the backend to capture and analyze a screenshot
    pub async fn request_screenshot(
        &self,
        session_id: &str,
        monitor_index: Option<u32>,
    ) -> Result<(), ApiError> {
        self.post_command(
            session_id,
            "screenshot",
            serde_json::to_value(ScreenshotRequest { monitor_index })
                .map_err(|e| ApiError::InvalidResponse(e.to_string()))?,
        )
        .await
    }

    /// Open the long-lived push-event stream for a session
    pub(crate) async fn open_stream(&self, session_id: &str) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}/sessions/{}/stream", self.base_url, session_id);
        debug!("Opening event stream: {}", url);
        let response = self
            .attach_auth(self.stream_client.get(&url))
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(map_send_error)?;

        check_status(response).await
    }

    async fn post_command(
        &self,
        session_id: &str,
        command: &str,
        body: serde_json::Value,
    ) -> Result<(), ApiError> {
        let url = format!("{}/sessions/{}/{}", self.base_url, session_id, command);
        let response = self
            .attach_auth(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(map_send_error)?;

        let response = check_status(response).await?;
        let body: CommandResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;

        if body.success {
            Ok(())
        } else {
            Err(ApiError::InvalidResponse(
                body.error
                    .unwrap_or_else(|| format!("{} command rejected", command)),
            ))
        }
    }

    fn attach_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Map a reqwest send error into the API taxonomy
fn map_send_error(error: reqwest::Error) -> ApiError {
    if error.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Network(error)
    }
}

/// Translate HTTP status codes into typed errors
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(ApiError::SessionNotFound);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ApiError::Server {
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_response_deserialization() {
        let json = r#"{"success": true, "session_id": "42", "message": "New session created"}"#;
        let body: CreateSessionResponse = serde_json::from_str(json).unwrap();
        assert!(body.success);
        assert_eq!(body.session_id.as_deref(), Some("42"));
    }

    #[test]
    fn test_status_response_deserialization() {
        let json = r#"{"success": true, "status": {"is_active": true, "is_recording": false}}"#;
        let body: StatusResponse = serde_json::from_str(json).unwrap();
        let status = body.status.unwrap();
        assert!(status.is_active);
        assert!(!status.is_recording);
    }

    #[test]
    fn test_command_response_failure() {
        let json = r#"{"success": false, "error": "Session not recording"}"#;
        let body: CommandResponse = serde_json::from_str(json).unwrap();
        assert!(!body.success);
        assert_eq!(body.error.as_deref(), Some("Session not recording"));
    }

    #[test]
    fn test_screenshot_request_omits_missing_monitor() {
        let json = serde_json::to_string(&ScreenshotRequest {
            monitor_index: None,
        })
        .unwrap();
        assert_eq!(json, "{}");

        let json = serde_json::to_string(&ScreenshotRequest {
            monitor_index: Some(1),
        })
        .unwrap();
        assert!(json.contains("\"monitor_index\":1"));
    }
}
