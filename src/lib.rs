//! Counsel Live - real-time duplex voice sessions with Gemini Live
//!
//! Microphone audio is streamed to the service while synthesized speech is
//! scheduled for gapless playback. The service can write session notes
//! through the `capture-note` tool.

#![forbid(unsafe_code)]

pub mod capture;
pub mod channel;
pub mod codec;
pub mod config;
pub mod device;
pub mod events;
pub mod gemini;
pub mod mixer;
pub mod playback;
#[cfg(feature = "pulse")]
pub mod pulse;
pub mod session;
pub mod tools;
pub mod transcript;

pub use channel::{ChannelHandle, ConnectError, Connector};
pub use config::{AppConfig, SessionConfig};
pub use events::{ServerEvent, ToolResult};
pub use gemini::{GeminiConfig, GeminiConnector};
pub use session::{SessionError, SessionOptions, SessionState, VoiceSession};
pub use tools::{MemoryNoteSink, NoteSink, SessionNote};
