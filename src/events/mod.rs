//! Server-push event channel
//!
//! Consumes the backend's event stream for one session, parses the typed
//! payloads, and forwards them in arrival order. On stream loss the session
//! is probed first: a session that no longer exists terminates the channel
//! permanently, anything else is retried with exponential backoff.

mod messages;
mod sse;

pub use messages::StreamEvent;

use crate::api::{SessionApi, SessionStatus};
use crate::error::ApiError;
use futures_util::StreamExt;
use std::future::Future;
use sse::SseParser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

/// Maximum consecutive reconnection attempts before giving up
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// First backoff delay; doubles per attempt
const BACKOFF_BASE_MS: u64 = 500;

/// Backoff ceiling
const BACKOFF_CAP_MS: u64 = 8_000;

/// Notices delivered to the session's reconcile task, in arrival order
#[derive(Debug, Clone)]
pub enum ChannelNotice {
    /// A parsed event from the stream
    Event(StreamEvent),
    /// The stream connected (or reconnected)
    Connected,
    /// The stream dropped; a reconnect will be attempted
    Disconnected,
    /// The session is gone or retries are exhausted; nothing follows this
    Terminal { reason: String },
}

/// Handle for one session's push-event connection
///
/// At most one live connection per session id: dropping or closing this
/// handle tears the connection down before a new one may be opened.
pub struct EventChannel {
    should_stop: Arc<AtomicBool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl EventChannel {
    /// Open the push-event stream for a session
    ///
    /// Parsed events and connection notices are delivered over `notice_tx`
    /// strictly in arrival order.
    pub fn open(
        api: Arc<SessionApi>,
        session_id: String,
        notice_tx: mpsc::Sender<ChannelNotice>,
    ) -> Self {
        let should_stop = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_stream(
            api,
            session_id,
            notice_tx,
            should_stop.clone(),
        ));
        Self {
            should_stop,
            task: Some(task),
        }
    }

    /// Close the channel; idempotent, cancels any pending reconnect delay
    pub fn close(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Delay before reconnect attempt `attempt` (1-based)
fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let ms = BACKOFF_BASE_MS.saturating_mul(1 << exponent);
    Duration::from_millis(ms.min(BACKOFF_CAP_MS))
}

async fn run_stream(
    api: Arc<SessionApi>,
    session_id: String,
    notice_tx: mpsc::Sender<ChannelNotice>,
    should_stop: Arc<AtomicBool>,
) {
    let open_api = api.clone();
    let open_id = session_id.clone();
    let open = move || {
        let api = open_api.clone();
        let id = open_id.clone();
        async move { api.open_stream(&id).await }
    };
    let probe = move || {
        let api = api.clone();
        let id = session_id.clone();
        async move { api.session_status(&id).await }
    };
    run_stream_with(open, probe, notice_tx, should_stop).await
}

/// The retry loop proper, with the connection attempt and liveness probe
/// injected so the policy is testable without a server
async fn run_stream_with<O, OF, P, PF>(
    mut open: O,
    mut probe: P,
    notice_tx: mpsc::Sender<ChannelNotice>,
    should_stop: Arc<AtomicBool>,
) where
    O: FnMut() -> OF,
    OF: Future<Output = Result<reqwest::Response, ApiError>>,
    P: FnMut() -> PF,
    PF: Future<Output = Result<SessionStatus, ApiError>>,
{
    let mut attempts = 0u32;

    loop {
        if should_stop.load(Ordering::SeqCst) {
            break;
        }

        match open().await {
            Ok(response) => {
                info!("Event stream connected");
                attempts = 0;
                if notice_tx.send(ChannelNotice::Connected).await.is_err() {
                    return;
                }
                consume_stream(response, &notice_tx, &should_stop).await;
                if should_stop.load(Ordering::SeqCst) {
                    break;
                }
                warn!("Event stream dropped");
            }
            Err(ApiError::SessionNotFound) => {
                let _ = notice_tx
                    .send(ChannelNotice::Terminal {
                        reason: "session no longer exists".to_string(),
                    })
                    .await;
                return;
            }
            Err(e) => {
                warn!("Failed to open event stream: {}", e);
            }
        }

        // Probe whether the session is still alive before burning a retry
        match probe().await {
            Err(ApiError::SessionNotFound) => {
                info!("Session gone server-side, stopping event channel");
                let _ = notice_tx
                    .send(ChannelNotice::Terminal {
                        reason: "session no longer exists".to_string(),
                    })
                    .await;
                return;
            }
            Ok(status) if !status.is_active => {
                info!("Session ended server-side, stopping event channel");
                let _ = notice_tx
                    .send(ChannelNotice::Terminal {
                        reason: "session ended".to_string(),
                    })
                    .await;
                return;
            }
            Ok(status) => {
                debug!("Session still alive (recording: {})", status.is_recording);
            }
            Err(e) => {
                // The probe itself failing is treated as a transient outage
                debug!("Status probe failed: {}", e);
            }
        }

        attempts += 1;
        if attempts > MAX_RECONNECT_ATTEMPTS {
            error!(
                "Event stream reconnection failed after {} attempts",
                MAX_RECONNECT_ATTEMPTS
            );
            let _ = notice_tx
                .send(ChannelNotice::Terminal {
                    reason: format!("reconnection failed after {} attempts", MAX_RECONNECT_ATTEMPTS),
                })
                .await;
            return;
        }

        let delay = backoff_delay(attempts);
        if notice_tx.send(ChannelNotice::Disconnected).await.is_err() {
            return;
        }
        debug!(
            "Retrying event stream in {:?} (attempt {}/{})",
            delay, attempts, MAX_RECONNECT_ATTEMPTS
        );
        sleep(delay).await;
    }
}

/// Read one connection's body until EOF or error, forwarding parsed events
async fn consume_stream(
    response: reqwest::Response,
    notice_tx: &mpsc::Sender<ChannelNotice>,
    should_stop: &Arc<AtomicBool>,
) {
    let mut parser = SseParser::new();
    let mut body = response.bytes_stream();

    while let Some(item) = body.next().await {
        if should_stop.load(Ordering::SeqCst) {
            return;
        }
        let bytes = match item {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Event stream read error: {}", e);
                return;
            }
        };
        for payload in parser.push(&bytes) {
            match serde_json::from_str::<StreamEvent>(&payload) {
                Ok(StreamEvent::Heartbeat { timestamp }) => {
                    trace!("Heartbeat at {}", timestamp);
                }
                Ok(StreamEvent::Other) => {
                    trace!("Ignoring unrecognized stream payload: {}", payload);
                }
                Ok(event) => {
                    if notice_tx.send(ChannelNotice::Event(event)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    // Malformed payloads never take the channel down
                    warn!("Malformed stream payload: {} - {}", e, payload);
                }
            }
        }
    }
    info!("Event stream closed by server");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alive_status() -> SessionStatus {
        SessionStatus {
            is_active: true,
            is_recording: false,
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(500));
        assert_eq!(backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(3), Duration::from_millis(2000));
        assert_eq!(backoff_delay(4), Duration::from_millis(4000));
        assert_eq!(backoff_delay(5), Duration::from_millis(8000));
        assert_eq!(backoff_delay(6), Duration::from_millis(8000));
        assert_eq!(backoff_delay(60), Duration::from_millis(8000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_terminal_exactly_once() {
        let (notice_tx, mut notice_rx) = mpsc::channel(32);
        let should_stop = Arc::new(AtomicBool::new(false));

        run_stream_with(
            || async { Err(ApiError::Timeout) },
            || async { Ok(alive_status()) },
            notice_tx,
            should_stop,
        )
        .await;

        let mut notices = Vec::new();
        while let Some(notice) = notice_rx.recv().await {
            notices.push(notice);
        }

        let disconnects = notices
            .iter()
            .filter(|n| matches!(n, ChannelNotice::Disconnected))
            .count();
        let terminals = notices
            .iter()
            .filter(|n| matches!(n, ChannelNotice::Terminal { .. }))
            .count();
        assert_eq!(disconnects, MAX_RECONNECT_ATTEMPTS as usize);
        assert_eq!(terminals, 1);
        // Nothing follows the terminal notice
        assert!(matches!(
            notices.last(),
            Some(ChannelNotice::Terminal { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_gone_probe_stops_immediately() {
        let (notice_tx, mut notice_rx) = mpsc::channel(32);
        let should_stop = Arc::new(AtomicBool::new(false));

        run_stream_with(
            || async { Err(ApiError::Timeout) },
            || async { Err(ApiError::SessionNotFound) },
            notice_tx,
            should_stop,
        )
        .await;

        let mut notices = Vec::new();
        while let Some(notice) = notice_rx.recv().await {
            notices.push(notice);
        }

        // No retries, just the single terminal notice
        assert_eq!(notices.len(), 1);
        assert!(matches!(
            notices.first(),
            Some(ChannelNotice::Terminal { .. })
        ));
    }
}
