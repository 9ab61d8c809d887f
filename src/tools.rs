//! Tool-call bridge
//!
//! Validates `capture-note` requests from the service, forwards accepted notes
//! to a [`NoteSink`], and produces exactly one acknowledgement per call id.

use crate::events::{ToolCallRequest, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub const CAPTURE_NOTE_TOOL: &str = "capture-note";

const NOTE_CAPTURED: &str = "Note captured successfully.";

/// A counselling-style note written by the service during a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNote {
    #[serde(alias = "dateTimeUTC")]
    pub timestamp: String,
    pub presenting_themes: Vec<String>,
    #[serde(default)]
    pub emotions_observed: Vec<String>,
    #[serde(default)]
    pub key_quotes: Vec<String>,
    #[serde(default)]
    pub skills_applied: Vec<String>,
    pub summary: String,
    #[serde(default)]
    pub goals_next_steps: Vec<String>,
}

impl SessionNote {
    /// Parse and validate tool arguments. Arguments wrapped in a `json`
    /// object are accepted as well.
    pub fn from_args(args: &Value) -> Result<Self, String> {
        let body = match args.get("json") {
            Some(inner) if inner.is_object() => inner,
            _ => args,
        };
        let note: SessionNote =
            serde_json::from_value(body.clone()).map_err(|e| format!("invalid arguments: {}", e))?;
        note.validate()?;
        Ok(note)
    }

    fn validate(&self) -> Result<(), String> {
        if self.timestamp.trim().is_empty() {
            return Err("timestamp must not be empty".to_string());
        }
        if self.presenting_themes.is_empty() {
            return Err("presentingThemes must contain at least one theme".to_string());
        }
        if self.presenting_themes.iter().any(|t| t.trim().is_empty()) {
            return Err("presentingThemes must not contain blank entries".to_string());
        }
        if self.summary.trim().is_empty() {
            return Err("summary must not be empty".to_string());
        }
        Ok(())
    }
}

/// Function declaration advertised to the service for note capture.
pub fn capture_note_declaration() -> Value {
    let list = json!({ "type": "ARRAY", "items": { "type": "STRING" } });
    json!({
        "name": CAPTURE_NOTE_TOOL,
        "description":
            "Create a concise, counselling-style session note based on the last exchange.",
        "parameters": {
            "type": "OBJECT",
            "properties": {
                "timestamp": { "type": "STRING", "description": "UTC date and time, RFC 3339" },
                "presentingThemes": list,
                "emotionsObserved": list,
                "keyQuotes": list,
                "skillsApplied": list,
                "summary": { "type": "STRING" },
                "goalsNextSteps": list
            },
            "required": ["timestamp", "presentingThemes", "summary"]
        }
    })
}

/// Receives captured notes. Implementations must not block.
pub trait NoteSink: Send + Sync {
    fn capture(&self, note: SessionNote);
}

/// Keeps notes in memory, newest first.
#[derive(Debug, Default)]
pub struct MemoryNoteSink {
    notes: Mutex<Vec<SessionNote>>,
}

impl MemoryNoteSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notes(&self) -> Vec<SessionNote> {
        match self.notes.lock() {
            Ok(notes) => notes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl NoteSink for MemoryNoteSink {
    fn capture(&self, note: SessionNote) {
        match self.notes.lock() {
            Ok(mut notes) => notes.insert(0, note),
            Err(poisoned) => poisoned.into_inner().insert(0, note),
        }
    }
}

/// Writes each note to the log.
#[derive(Debug, Default)]
pub struct LogNoteSink;

impl NoteSink for LogNoteSink {
    fn capture(&self, note: SessionNote) {
        info!(
            timestamp = %note.timestamp,
            themes = ?note.presenting_themes,
            emotions = ?note.emotions_observed,
            goals = ?note.goals_next_steps,
            "Session note: {}",
            note.summary
        );
    }
}

/// Acknowledgement to send back for a tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolAck {
    pub id: String,
    pub name: String,
    pub result: ToolResult,
}

/// Dispatches tool calls. Lives for one session.
pub struct ToolBridge {
    sink: Arc<dyn NoteSink>,
    seen: HashSet<String>,
}

impl ToolBridge {
    pub fn new(sink: Arc<dyn NoteSink>) -> Self {
        Self {
            sink,
            seen: HashSet::new(),
        }
    }

    /// Handle a request; `None` means this id was already acknowledged.
    pub fn handle(&mut self, request: ToolCallRequest) -> Option<ToolAck> {
        if !self.seen.insert(request.id.clone()) {
            warn!("Ignoring redelivered tool call {}", request.id);
            return None;
        }

        let result = if request.name != CAPTURE_NOTE_TOOL {
            warn!("Unknown tool '{}' requested (id {})", request.name, request.id);
            ToolResult::Failure(format!("unknown tool: {}", request.name))
        } else {
            match SessionNote::from_args(&request.args) {
                Ok(note) => {
                    info!("Captured session note for call {}", request.id);
                    self.sink.capture(note);
                    ToolResult::Success(NOTE_CAPTURED.to_string())
                }
                Err(reason) => {
                    warn!("Rejected note from call {}: {}", request.id, reason);
                    ToolResult::Failure(reason)
                }
            }
        };

        Some(ToolAck {
            id: request.id,
            name: request.name,
            result,
        })
    }
}
