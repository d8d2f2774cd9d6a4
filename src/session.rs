//! Session lifecycle coordination
//!
//! The coordinator owns one session's worth of state: the lifecycle state
//! machine, the transcript, and the capture, transport and event-channel
//! components that exist only while a session is active. UI code observes
//! it through a broadcast of change notices and a shared transcript.

use crate::api::SessionApi;
use crate::audio::{self, AudioCaptureHandle};
use crate::config::{AudioConfig, Config};
use crate::error::SessionError;
use crate::events::{ChannelNotice, EventChannel, StreamEvent};
use crate::transcript::Transcript;
use crate::transport::AudioTransport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

/// Lifecycle of one session
///
/// `Ended` is terminal: a fresh conversation needs a new coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No session yet, or created but not started
    #[default]
    Idle,
    /// Waiting for the backend to allocate a session id
    Creating,
    /// Started; events flow and recording may be toggled
    Active,
    /// Teardown in progress
    Ending,
    /// Torn down; no transition leaves this state
    Ended,
}

/// Change notices broadcast to observers
#[derive(Debug, Clone)]
pub enum SessionNotice {
    /// The transcript gained or revised a message
    TranscriptChanged,
    StateChanged(SessionState),
    ConnectionChanged(bool),
    RecordingChanged(bool),
}

/// Owns and drives one session
pub struct SessionCoordinator {
    api: Arc<SessionApi>,
    audio: AudioConfig,
    session_id: Option<String>,
    state: SessionState,
    recording: bool,
    transcript: Arc<Mutex<Transcript>>,
    notice_tx: broadcast::Sender<SessionNotice>,
    is_connected: Arc<AtomicBool>,
    events: Option<EventChannel>,
    capture: Option<AudioCaptureHandle>,
    pump_task: Option<tokio::task::JoinHandle<()>>,
    reconcile_task: Option<tokio::task::JoinHandle<()>>,
}

impl SessionCoordinator {
    pub fn new(config: &Config) -> Result<Self, SessionError> {
        let api = Arc::new(SessionApi::new(&config.backend)?);
        let (notice_tx, _) = broadcast::channel(100);
        Ok(Self {
            api,
            audio: config.audio.clone(),
            session_id: None,
            state: SessionState::Idle,
            recording: false,
            transcript: Arc::new(Mutex::new(Transcript::new())),
            notice_tx,
            is_connected: Arc::new(AtomicBool::new(false)),
            events: None,
            capture: None,
            pump_task: None,
            reconcile_task: None,
        })
    }

    /// Subscribe to change notices
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.notice_tx.subscribe()
    }

    /// Shared transcript, for rendering alongside the notices
    pub fn transcript(&self) -> Arc<Mutex<Transcript>> {
        self.transcript.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Whether the push-event channel is currently connected
    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::SeqCst)
    }

    /// Ask the backend for a session id
    pub async fn create(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Ended || self.state == SessionState::Ending {
            return Err(SessionError::Ended);
        }
        if self.session_id.is_some() || self.state != SessionState::Idle {
            return Err(SessionError::AlreadyCreated);
        }

        self.set_state(SessionState::Creating);
        match self.api.create_session().await {
            Ok(id) => {
                self.session_id = Some(id);
                self.set_state(SessionState::Idle);
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Idle);
                Err(SessionError::Create(e))
            }
        }
    }

    /// Start the session and open the push-event channel
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Ended || self.state == SessionState::Ending {
            return Err(SessionError::Ended);
        }
        if self.state == SessionState::Active {
            return Err(SessionError::AlreadyStarted);
        }
        let session_id = self
            .session_id
            .clone()
            .ok_or(SessionError::NoSession)?;

        self.api
            .start_session(&session_id)
            .await
            .map_err(SessionError::Start)?;

        let (event_tx, event_rx) = mpsc::channel(256);
        self.events = Some(EventChannel::open(
            self.api.clone(),
            session_id.clone(),
            event_tx,
        ));
        self.reconcile_task = Some(tokio::spawn(run_reconciler(
            event_rx,
            self.transcript.clone(),
            self.notice_tx.clone(),
            self.is_connected.clone(),
        )));

        self.set_state(SessionState::Active);
        info!("Session {} started", session_id);
        Ok(())
    }

    /// Flip recording on or off; returns the new recording state
    pub async fn toggle_recording(&mut self) -> Result<bool, SessionError> {
        if self.state != SessionState::Active {
            return Err(SessionError::NotActive);
        }

        if self.recording {
            self.stop_recording().await;
            return Ok(false);
        }

        let session_id = self.session_id.clone().ok_or(SessionError::NoSession)?;
        let (capture, mut audio_rx) = audio::start_capture(self.audio.sample_rate)?;
        let transport = match AudioTransport::connect(
            self.api.base_url(),
            self.api.auth_token(),
            &session_id,
        )
        .await
        {
            Ok(transport) => transport,
            Err(e) => {
                let mut capture = capture;
                capture.stop();
                return Err(e.into());
            }
        };

        // Forward capture to the transport until the capture side closes
        self.pump_task = Some(tokio::spawn(async move {
            while let Some(chunk) = audio_rx.recv().await {
                transport.send(chunk);
            }
            transport.shutdown().await;
        }));
        self.capture = Some(capture);
        self.recording = true;
        let _ = self
            .notice_tx
            .send(SessionNotice::RecordingChanged(true));
        Ok(true)
    }

    /// Send a typed message into the conversation
    pub async fn send_text(&mut self, text: &str) -> Result<(), SessionError> {
        if self.state != SessionState::Active {
            return Err(SessionError::NotActive);
        }
        let session_id = self.session_id.clone().ok_or(SessionError::NoSession)?;

        // The message appears locally before the round trip completes
        if let Ok(mut transcript) = self.transcript.lock() {
            if transcript.push_user(text) {
                let _ = self.notice_tx.send(SessionNotice::TranscriptChanged);
            }
        }

        self.api.send_text(&session_id, text).await?;
        Ok(())
    }

    /// Ask the backend to analyze the conversation so far
    ///
    /// A placeholder appears in the transcript immediately; the analysis
    /// arrives later as response events and resolves it in place.
    pub async fn think(&mut self) -> Result<(), SessionError> {
        self.run_command("Analyzing the conversation...", |api, id| async move {
            api.think(&id).await
        })
        .await
    }

    /// Ask the backend to capture and analyze a screenshot
    pub async fn request_screenshot(
        &mut self,
        monitor_index: Option<u32>,
    ) -> Result<(), SessionError> {
        self.run_command("Capturing screenshot...", move |api, id| async move {
            api.request_screenshot(&id, monitor_index).await
        })
        .await
    }

    /// End the session; idempotent, tears everything down even when the
    /// backend call fails
    pub async fn end(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Ended || self.state == SessionState::Ending {
            return Ok(());
        }
        self.set_state(SessionState::Ending);

        if self.recording {
            self.stop_recording().await;
        }
        if let Some(mut events) = self.events.take() {
            events.close();
        }
        if let Some(task) = self.reconcile_task.take() {
            task.abort();
        }
        self.is_connected.store(false, Ordering::SeqCst);

        let result = match &self.session_id {
            Some(id) => self
                .api
                .end_session(id)
                .await
                .map_err(SessionError::End),
            None => Ok(()),
        };

        if let Ok(mut transcript) = self.transcript.lock() {
            transcript.push_system("Session ended");
        }
        let _ = self.notice_tx.send(SessionNotice::TranscriptChanged);
        self.set_state(SessionState::Ended);
        if let Err(e) = &result {
            warn!("Backend end call failed, session ended locally: {}", e);
        }
        result
    }

    async fn stop_recording(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        // Capture is stopped, so the pump drains the tail and closes the socket
        if let Some(task) = self.pump_task.take() {
            let _ = task.await;
        }
        self.recording = false;
        let _ = self
            .notice_tx
            .send(SessionNotice::RecordingChanged(false));
    }

    async fn run_command<F, Fut>(&mut self, placeholder: &str, call: F) -> Result<(), SessionError>
    where
        F: FnOnce(Arc<SessionApi>, String) -> Fut,
        Fut: std::future::Future<Output = Result<(), crate::error::ApiError>>,
    {
        if self.state != SessionState::Active {
            return Err(SessionError::NotActive);
        }
        let session_id = self.session_id.clone().ok_or(SessionError::NoSession)?;

        let placeholder_id = match self.transcript.lock() {
            Ok(mut transcript) => transcript.add_placeholder(placeholder),
            Err(_) => return Err(SessionError::NotActive),
        };
        let _ = self.notice_tx.send(SessionNotice::TranscriptChanged);

        if let Err(e) = call(self.api.clone(), session_id).await {
            if let Ok(mut transcript) = self.transcript.lock() {
                transcript.resolve_placeholder(&placeholder_id, &format!("Request failed: {}", e));
            }
            let _ = self.notice_tx.send(SessionNotice::TranscriptChanged);
            return Err(e.into());
        }
        Ok(())
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        let _ = self.notice_tx.send(SessionNotice::StateChanged(state));
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        if let Some(mut events) = self.events.take() {
            events.close();
        }
        if let Some(task) = self.reconcile_task.take() {
            task.abort();
        }
        if let Some(task) = self.pump_task.take() {
            task.abort();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
    }
}

/// Consume channel notices in order and fold them into the transcript
async fn run_reconciler(
    mut event_rx: mpsc::Receiver<ChannelNotice>,
    transcript: Arc<Mutex<Transcript>>,
    notice_tx: broadcast::Sender<SessionNotice>,
    is_connected: Arc<AtomicBool>,
) {
    while let Some(notice) = event_rx.recv().await {
        match notice {
            ChannelNotice::Connected => {
                is_connected.store(true, Ordering::SeqCst);
                let _ = notice_tx.send(SessionNotice::ConnectionChanged(true));
            }
            ChannelNotice::Disconnected => {
                is_connected.store(false, Ordering::SeqCst);
                let _ = notice_tx.send(SessionNotice::ConnectionChanged(false));
            }
            ChannelNotice::Terminal { reason } => {
                is_connected.store(false, Ordering::SeqCst);
                let _ = notice_tx.send(SessionNotice::ConnectionChanged(false));
                // A forced disconnect always leaves a visible log entry
                if let Ok(mut transcript) = transcript.lock() {
                    transcript.push_log(&format!("Connection closed: {}", reason));
                }
                let _ = notice_tx.send(SessionNotice::TranscriptChanged);
                break;
            }
            ChannelNotice::Event(StreamEvent::Connection { connected }) => {
                is_connected.store(connected, Ordering::SeqCst);
                let _ = notice_tx.send(SessionNotice::ConnectionChanged(connected));
            }
            ChannelNotice::Event(event) => {
                let changed = match transcript.lock() {
                    Ok(mut transcript) => transcript.apply(&event),
                    Err(_) => false,
                };
                if changed {
                    let _ = notice_tx.send(SessionNotice::TranscriptChanged);
                }
            }
        }
    }
    info!("Event reconciler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::Role;

    fn test_config() -> Config {
        Config {
            backend: crate::config::BackendConfig {
                base_url: "http://127.0.0.1:9".to_string(),
                auth_token: None,
            },
            audio: AudioConfig { sample_rate: 16000 },
        }
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let mut coordinator = SessionCoordinator::new(&test_config()).unwrap();
        assert!(coordinator.end().await.is_ok());
        assert_eq!(coordinator.state(), SessionState::Ended);
        assert!(coordinator.end().await.is_ok());
        assert_eq!(coordinator.state(), SessionState::Ended);

        // The second end() was a no-op, so only one closing entry exists
        let transcript = coordinator.transcript();
        let transcript = transcript.lock().unwrap();
        let endings = transcript
            .messages()
            .iter()
            .filter(|m| m.role == Role::System && m.content == "Session ended")
            .count();
        assert_eq!(endings, 1);
    }

    #[tokio::test]
    async fn test_terminal_channel_failure_leaves_log_entry() {
        let transcript = Arc::new(Mutex::new(Transcript::new()));
        let (event_tx, event_rx) = mpsc::channel(4);
        let (notice_tx, _notice_rx) = broadcast::channel(16);
        let is_connected = Arc::new(AtomicBool::new(true));

        event_tx
            .send(ChannelNotice::Terminal {
                reason: "session ended".to_string(),
            })
            .await
            .unwrap();
        drop(event_tx);

        run_reconciler(event_rx, transcript.clone(), notice_tx, is_connected.clone()).await;

        assert!(!is_connected.load(Ordering::SeqCst));
        let transcript = transcript.lock().unwrap();
        let last = transcript.messages().last().unwrap();
        assert_eq!(last.role, Role::Log);
        assert_eq!(last.content, "Connection closed: session ended");
    }

    #[tokio::test]
    async fn test_no_transition_out_of_ended() {
        let mut coordinator = SessionCoordinator::new(&test_config()).unwrap();
        coordinator.end().await.unwrap();

        assert!(matches!(
            coordinator.create().await,
            Err(SessionError::Ended)
        ));
        assert!(matches!(coordinator.start().await, Err(SessionError::Ended)));
        assert_eq!(coordinator.state(), SessionState::Ended);
    }

    #[tokio::test]
    async fn test_start_requires_created_session() {
        let mut coordinator = SessionCoordinator::new(&test_config()).unwrap();
        assert!(matches!(
            coordinator.start().await,
            Err(SessionError::NoSession)
        ));
    }

    #[tokio::test]
    async fn test_commands_require_active_session() {
        let mut coordinator = SessionCoordinator::new(&test_config()).unwrap();
        assert!(matches!(
            coordinator.toggle_recording().await,
            Err(SessionError::NotActive)
        ));
        assert!(matches!(
            coordinator.send_text("hi").await,
            Err(SessionError::NotActive)
        ));
        assert!(matches!(coordinator.think().await, Err(SessionError::NotActive)));
        assert!(matches!(
            coordinator.request_screenshot(None).await,
            Err(SessionError::NotActive)
        ));
    }

    #[tokio::test]
    async fn test_state_notices_broadcast() {
        let mut coordinator = SessionCoordinator::new(&test_config()).unwrap();
        let mut notices = coordinator.subscribe();
        coordinator.end().await.unwrap();

        let mut saw_ending = false;
        let mut saw_ended = false;
        while let Ok(notice) = notices.try_recv() {
            match notice {
                SessionNotice::StateChanged(SessionState::Ending) => saw_ending = true,
                SessionNotice::StateChanged(SessionState::Ended) => saw_ended = true,
                _ => {}
            }
        }
        assert!(saw_ending);
        assert!(saw_ended);
    }
}
