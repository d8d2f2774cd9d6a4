//! Audio transport over a duplex WebSocket
//!
//! Streams audio chunks to the backend's per-session audio endpoint and
//! reads acknowledgements off the same socket. A dropped connection is
//! retried a few times with doubling delays; a close we initiated, or an
//! ack saying the session is gone, ends the transport without retrying.

mod messages;

use crate::audio::AudioChunk;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use messages::{encode_chunk, AudioAck, AudioClientMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

/// Ping interval in seconds to keep the WebSocket alive
const PING_INTERVAL_SECS: u64 = 30;

/// Timeout for the WebSocket handshake
const WS_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Maximum reconnection attempts after an involuntary drop
const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// First reconnect delay; doubles per attempt
const RECONNECT_BASE_DELAY_MS: u64 = 1_000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Errors establishing the audio connection
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid audio endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket connection failed: {0}")]
    Connection(String),

    #[error("WebSocket connection timed out")]
    ConnectTimeout,
}

/// How one pump run ended
enum PumpOutcome {
    /// Involuntary drop, worth reconnecting
    Dropped,
    /// We closed the socket or the session is gone
    Finished,
}

/// Handle for one session's audio connection
pub struct AudioTransport {
    active: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    chunk_tx: Option<mpsc::Sender<AudioChunk>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl AudioTransport {
    /// Connect to the session's audio endpoint and start the send loop
    ///
    /// The initial connection is not retried; callers surface the failure
    /// immediately. Drops after a successful connect are retried.
    pub async fn connect(
        base_url: &str,
        auth_token: Option<&str>,
        session_id: &str,
    ) -> Result<Self, TransportError> {
        let ws_url = build_audio_ws_url(base_url, session_id)?;
        let ws = open_websocket(&ws_url, auth_token).await?;
        info!("Audio transport connected: {}", ws_url);

        let active = Arc::new(AtomicBool::new(true));
        let paused = Arc::new(AtomicBool::new(false));
        let closing = Arc::new(AtomicBool::new(false));
        let (chunk_tx, chunk_rx) = mpsc::channel(600);

        let task = tokio::spawn(run_transport(
            ws,
            ws_url,
            auth_token.map(str::to_string),
            session_id.to_string(),
            chunk_rx,
            active.clone(),
            closing.clone(),
        ));

        Ok(Self {
            active,
            paused,
            closing,
            chunk_tx: Some(chunk_tx),
            task: Some(task),
        })
    }

    /// Queue a chunk for sending; dropped silently when paused or inactive
    pub fn send(&self, chunk: AudioChunk) {
        if !self.active.load(Ordering::SeqCst) || self.paused.load(Ordering::SeqCst) {
            return;
        }
        let Some(chunk_tx) = &self.chunk_tx else {
            return;
        };
        if chunk_tx.try_send(chunk).is_err() {
            warn!("Audio transport backlog full - chunk dropped");
        }
    }

    /// Stop forwarding chunks without tearing the connection down
    #[allow(dead_code)]
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume forwarding chunks
    #[allow(dead_code)]
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Whether the transport still accepts chunks
    #[allow(dead_code)]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Drain queued chunks, close the socket cleanly, and wait for the
    /// send loop to finish
    pub async fn shutdown(mut self) {
        // Dropping the sender lets the send loop drain before closing
        self.chunk_tx.take();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.active.store(false, Ordering::SeqCst);
    }

    /// Tear the connection down immediately; idempotent
    pub fn close(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for AudioTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Build the audio WebSocket URL from the HTTP base URL
fn build_audio_ws_url(base_url: &str, session_id: &str) -> Result<String, TransportError> {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        return Err(TransportError::InvalidUrl(format!(
            "unsupported scheme in {}",
            base
        )));
    };
    Ok(format!("{}/sessions/{}/audio", ws_base, session_id))
}

/// Generate a random Sec-WebSocket-Key
fn generate_ws_key() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let mut key = [0u8; 16];
    rng.fill(&mut key);
    base64::engine::general_purpose::STANDARD.encode(key)
}

async fn open_websocket(ws_url: &str, auth_token: Option<&str>) -> Result<WsStream, TransportError> {
    let parsed = url::Url::parse(ws_url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl(format!("no host in {}", ws_url)))?
        .to_string();

    let mut builder = http::Request::builder()
        .uri(ws_url)
        .header("Host", host)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Key", generate_ws_key())
        .header("Sec-WebSocket-Version", "13");
    if let Some(token) = auth_token {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }
    let request = builder
        .body(())
        .map_err(|e| TransportError::Connection(e.to_string()))?;

    let connect = connect_async(request);
    match timeout(Duration::from_secs(WS_CONNECT_TIMEOUT_SECS), connect).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(TransportError::Connection(e.to_string())),
        Err(_) => Err(TransportError::ConnectTimeout),
    }
}

async fn run_transport(
    first_ws: WsStream,
    ws_url: String,
    auth_token: Option<String>,
    session_id: String,
    mut chunk_rx: mpsc::Receiver<AudioChunk>,
    active: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
) {
    let mut ws = Some(first_ws);
    let mut attempts = 0u32;

    loop {
        let stream = match ws.take() {
            Some(stream) => stream,
            None => {
                attempts += 1;
                if attempts > MAX_RECONNECT_ATTEMPTS {
                    error!(
                        "Audio transport reconnection failed after {} attempts",
                        MAX_RECONNECT_ATTEMPTS
                    );
                    break;
                }
                let delay =
                    Duration::from_millis(RECONNECT_BASE_DELAY_MS << (attempts - 1).min(16));
                debug!(
                    "Reconnecting audio transport in {:?} (attempt {}/{})",
                    delay, attempts, MAX_RECONNECT_ATTEMPTS
                );
                sleep(delay).await;
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                match open_websocket(&ws_url, auth_token.as_deref()).await {
                    Ok(stream) => {
                        info!("Audio transport reconnected");
                        stream
                    }
                    Err(e) => {
                        warn!("Audio transport reconnect failed: {}", e);
                        continue;
                    }
                }
            }
        };

        attempts = 0;
        match pump(stream, &session_id, &mut chunk_rx, &active).await {
            PumpOutcome::Finished => break,
            PumpOutcome::Dropped => {
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                warn!("Audio transport connection dropped");
            }
        }
    }

    active.store(false, Ordering::SeqCst);
    info!("Audio transport stopped");
}

/// Drive one connection: forward chunks, read acks, keep the socket alive
async fn pump(
    ws: WsStream,
    session_id: &str,
    chunk_rx: &mut mpsc::Receiver<AudioChunk>,
    active: &Arc<AtomicBool>,
) -> PumpOutcome {
    let (mut sink, mut source) = ws.split();

    let mut ping_interval = interval(Duration::from_secs(PING_INTERVAL_SECS));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately
    ping_interval.tick().await;

    loop {
        tokio::select! {
            biased;

            incoming = source.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<AudioAck>(&text) {
                            Ok(ack) if ack.is_session_gone() => {
                                info!("Backend reports session gone, stopping audio transport");
                                active.store(false, Ordering::SeqCst);
                                let _ = sink.close().await;
                                return PumpOutcome::Finished;
                            }
                            Ok(ack) => {
                                if let Some(error) = ack.error {
                                    warn!("Audio frame rejected: {}", error);
                                } else if ack.received {
                                    trace!("Audio ack: {} samples", ack.samples.unwrap_or(0));
                                } else {
                                    warn!("Audio frame not received by backend");
                                }
                            }
                            Err(e) => {
                                warn!("Unparseable audio ack: {} - {}", e, text);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Audio WebSocket closed by server");
                        return PumpOutcome::Dropped;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        trace!("Audio WebSocket keepalive");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Audio WebSocket receive error: {}", e);
                        return PumpOutcome::Dropped;
                    }
                    None => {
                        return PumpOutcome::Dropped;
                    }
                }
            }
            _ = ping_interval.tick() => {
                if sink.send(Message::Ping(vec![])).await.is_err() {
                    warn!("Failed to send audio keepalive ping");
                    return PumpOutcome::Dropped;
                }
            }
            chunk = chunk_rx.recv() => {
                match chunk {
                    Some(chunk) => {
                        trace!("Sending {}ms audio frame", chunk.duration_ms());
                        let msg = AudioClientMessage::AudioData {
                            session_id: session_id.to_string(),
                            audio: encode_chunk(&chunk),
                        };
                        let json = match serde_json::to_string(&msg) {
                            Ok(json) => json,
                            Err(e) => {
                                error!("Failed to encode audio frame: {}", e);
                                continue;
                            }
                        };
                        if sink.send(Message::Text(json)).await.is_err() {
                            error!("Failed to send audio frame");
                            return PumpOutcome::Dropped;
                        }
                    }
                    None => {
                        // Sender side closed, this is a voluntary stop
                        let _ = sink.close().await;
                        return PumpOutcome::Finished;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_transport(chunk_tx: mpsc::Sender<AudioChunk>) -> AudioTransport {
        AudioTransport {
            active: Arc::new(AtomicBool::new(true)),
            paused: Arc::new(AtomicBool::new(false)),
            closing: Arc::new(AtomicBool::new(false)),
            chunk_tx: Some(chunk_tx),
            task: None,
        }
    }

    fn chunk() -> AudioChunk {
        AudioChunk {
            samples: vec![1000; 4800],
            sample_rate: 16000,
        }
    }

    #[test]
    fn test_send_drops_chunks_while_paused_or_inactive() {
        let (chunk_tx, mut chunk_rx) = mpsc::channel(8);
        let mut transport = bare_transport(chunk_tx);

        transport.send(chunk());
        assert!(chunk_rx.try_recv().is_ok());

        transport.pause();
        transport.send(chunk());
        assert!(chunk_rx.try_recv().is_err());

        transport.resume();
        transport.send(chunk());
        assert!(chunk_rx.try_recv().is_ok());

        // A session-gone ack or close deactivates the transport outright
        transport.close();
        assert!(!transport.is_active());
        transport.send(chunk());
        assert!(chunk_rx.try_recv().is_err());
    }

    #[test]
    fn test_build_audio_ws_url() {
        let url = build_audio_ws_url("http://127.0.0.1:8000/api", "42").unwrap();
        assert_eq!(url, "ws://127.0.0.1:8000/api/sessions/42/audio");

        let url = build_audio_ws_url("https://backend.example.com/api/", "abc").unwrap();
        assert_eq!(url, "wss://backend.example.com/api/sessions/abc/audio");

        assert!(build_audio_ws_url("ftp://example.com", "1").is_err());
    }

    #[test]
    fn test_generate_ws_key_is_16_bytes() {
        let key = generate_ws_key();
        let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, key)
            .unwrap();
        assert_eq!(decoded.len(), 16);
    }
}
