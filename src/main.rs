#![deny(clippy::all)]

mod api;
mod audio;
mod config;
mod error;
mod events;
mod session;
mod transcript;
mod transport;

use anyhow::Context;
use session::{SessionCoordinator, SessionNotice};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Environment from .env, if present
    dotenvy::dotenv().ok();

    // Initialize tracing for structured logging
    tracing_subscriber::fmt::init();

    let config = config::Config::load().context("failed to load configuration")?;
    info!("Backend: {}", config.backend.base_url);

    let mut coordinator =
        SessionCoordinator::new(&config).context("failed to initialize session")?;

    coordinator
        .create()
        .await
        .context("failed to create session")?;
    coordinator
        .start()
        .await
        .context("failed to start session")?;

    spawn_transcript_renderer(&coordinator);

    println!("Session {} started.", coordinator.session_id().unwrap_or("?"));
    println!("Commands: /record  /think  /screenshot [monitor]  /status  /quit");
    println!("Anything else is sent as a text message.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(' ').map_or((line, ""), |(c, rest)| (c, rest)) {
            ("/quit", _) => break,
            ("/record", _) => match coordinator.toggle_recording().await {
                Ok(true) => println!("Recording started."),
                Ok(false) => println!("Recording stopped."),
                Err(e) => warn!("Recording toggle failed: {}", e),
            },
            ("/think", _) => {
                if let Err(e) = coordinator.think().await {
                    warn!("Think request failed: {}", e);
                }
            }
            ("/status", _) => {
                println!(
                    "State: {:?}, connected: {}, recording: {}",
                    coordinator.state(),
                    coordinator.is_connected(),
                    coordinator.is_recording()
                );
            }
            ("/screenshot", rest) => {
                let monitor_index = rest.trim().parse::<u32>().ok();
                if let Err(e) = coordinator.request_screenshot(monitor_index).await {
                    warn!("Screenshot request failed: {}", e);
                }
            }
            _ => {
                if let Err(e) = coordinator.send_text(line).await {
                    warn!("Failed to send message: {}", e);
                }
            }
        }
    }

    coordinator.end().await.context("failed to end session")?;
    println!("Session ended.");
    Ok(())
}

/// Print new transcript messages as they arrive
fn spawn_transcript_renderer(coordinator: &SessionCoordinator) {
    let mut notices = coordinator.subscribe();
    let transcript = coordinator.transcript();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            match notice {
                SessionNotice::TranscriptChanged => {
                    let last = match transcript.lock() {
                        Ok(transcript) => transcript.messages().last().cloned(),
                        Err(_) => continue,
                    };
                    // Revisions reprint the same message with its new text
                    if let Some(message) = last {
                        println!("[{:?}] {}", message.role, message.content);
                    }
                }
                SessionNotice::ConnectionChanged(connected) => {
                    info!(
                        "Event channel {}",
                        if connected { "connected" } else { "disconnected" }
                    );
                }
                _ => {}
            }
        }
    });
}
