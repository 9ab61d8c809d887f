//! Counsel Live - voice session against Gemini Live using PulseAudio devices
//!
//! Configuration comes from the environment (`GEMINI_API_KEY` is required).
//! The model's transcript and captured notes are logged; Ctrl-C ends the
//! session.

#![forbid(unsafe_code)]

use anyhow::Context;
use counsel_live::config::AppConfig;
use counsel_live::gemini::{GeminiConfig, GeminiConnector};
use counsel_live::pulse::PulseBackend;
use counsel_live::session::{SessionOptions, SessionState, VoiceSession};
use counsel_live::tools::{capture_note_declaration, NoteSink, SessionNote};
use counsel_live::{MemoryNoteSink, SessionConfig};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Logs each note and keeps a copy for the end-of-session summary.
struct CliNotes {
    memory: MemoryNoteSink,
}

impl NoteSink for CliNotes {
    fn capture(&self, note: SessionNote) {
        info!(
            themes = ?note.presenting_themes,
            goals = ?note.goals_next_steps,
            "Note at {}: {}",
            note.timestamp,
            note.summary
        );
        self.memory.capture(note);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = AppConfig::from_env().context("failed to read configuration")?;
    info!("Starting counsel-live with model {} and voice {}", config.model, config.voice);

    let gemini = GeminiConfig::from_api_key(&config.api_key, &config.model);
    let connector = GeminiConnector::new(gemini);
    let session_config = SessionConfig::new(
        &config.voice,
        &config.system_instruction,
        vec![capture_note_declaration()],
    );
    let notes = Arc::new(CliNotes {
        memory: MemoryNoteSink::new(),
    });
    let options = SessionOptions {
        connect_timeout: config.connect_timeout,
        ..SessionOptions::default()
    };

    let session = VoiceSession::new(
        connector,
        PulseBackend::new("counsel-live"),
        session_config,
        notes.clone(),
        options,
    );

    session.start().await.context("failed to start voice session")?;
    info!("Listening. Press Ctrl-C to end the session.");

    let mut state = session.state();
    let mut transcript = session.transcript();
    let mut last_turn = String::new();
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Ending session");
                session.stop().await;
                break;
            }
            changed = transcript.changed() => {
                if changed.is_err() {
                    break;
                }
                // The transcript is cleared when the turn completes.
                let text = transcript.borrow_and_update().clone();
                if text.is_empty() && !last_turn.is_empty() {
                    info!("Model: {}", last_turn);
                }
                last_turn = text;
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow_and_update() == SessionState::Idle {
                    warn!("Session ended by the service");
                    break;
                }
            }
        }
    }

    let captured = notes.memory.notes();
    info!("{} note(s) captured this session", captured.len());
    for note in captured.iter().rev() {
        println!("{}", serde_json::to_string_pretty(note)?);
    }
    Ok(())
}
