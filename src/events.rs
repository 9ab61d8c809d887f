use crate::codec::EncodedChunk;
use serde_json::{json, Value};

/// A single inbound event from the remote service.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Fragment of the transcript of the model's speech
    TranscriptDelta { text: String },
    /// Synthesized speech, 16-bit PCM at 24 kHz
    AudioChunk { chunk: EncodedChunk },
    ToolCall(ToolCallRequest),
    TurnComplete,
    /// The service cancelled the speech it was producing (barge-in)
    Interrupted,
    Error { detail: String },
    Closed,
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TranscriptDelta { .. } => "transcript-delta",
            Self::AudioChunk { .. } => "audio-chunk",
            Self::ToolCall(_) => "tool-call",
            Self::TurnComplete => "turn-complete",
            Self::Interrupted => "interrupted",
            Self::Error { .. } => "error",
            Self::Closed => "closed",
        }
    }
}

/// Structured request from the service to run a declared tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Outcome reported back for a tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolResult {
    Success(String),
    Failure(String),
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Function response body sent to the service.
    pub fn to_response(&self) -> Value {
        match self {
            Self::Success(message) => json!({ "result": message }),
            Self::Failure(reason) => json!({ "error": reason }),
        }
    }
}
