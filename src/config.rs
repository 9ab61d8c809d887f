//! Session and application configuration

use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Prebuilt voices offered by the Live API.
pub const VOICES: &[&str] = &[
    "Zephyr", "Puck", "Charon", "Kore", "Fenrir", "Leda", "Orus", "Aoede",
];

pub const DEFAULT_VOICE: &str = "Zephyr";

pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";

/// Response modality requested from the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseModality {
    Text,
    Audio,
}

impl ResponseModality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Audio => "AUDIO",
        }
    }
}

/// Everything the channel needs to open a session. Immutable once built.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub voice: String,
    /// Opaque system instruction handed to the service verbatim.
    pub system_instruction: String,
    /// Function declarations advertised to the service.
    pub tools: Vec<Value>,
    pub response_modality: ResponseModality,
    pub transcription_enabled: bool,
}

impl SessionConfig {
    pub fn new(voice: &str, system_instruction: &str, tools: Vec<Value>) -> Self {
        Self {
            voice: voice.to_string(),
            system_instruction: system_instruction.to_string(),
            tools,
            response_modality: ResponseModality::Audio,
            transcription_enabled: true,
        }
    }
}

/// Map a requested voice onto a known prebuilt voice, falling back to the default.
pub fn resolve_voice(requested: &str) -> &'static str {
    match VOICES.iter().find(|v| v.eq_ignore_ascii_case(requested.trim())) {
        Some(voice) => voice,
        None => {
            warn!("Unknown voice '{}', using {}", requested, DEFAULT_VOICE);
            DEFAULT_VOICE
        }
    }
}

/// Error while reading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Application configuration for the CLI
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub connect_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: String::new(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl AppConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.api_key = lookup("GEMINI_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::Missing("GEMINI_API_KEY"))?;

        if let Some(model) = lookup("GEMINI_MODEL") {
            config.model = if model.starts_with("models/") {
                model
            } else {
                format!("models/{}", model)
            };
        }

        if let Some(voice) = lookup("COUNSEL_VOICE") {
            config.voice = resolve_voice(&voice).to_string();
        }

        if let Some(path) = lookup("COUNSEL_SYSTEM_INSTRUCTION_FILE") {
            let path = PathBuf::from(path);
            config.system_instruction = std::fs::read_to_string(&path)
                .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
            info!("Loaded system instruction from {:?}", path);
        }

        if let Some(secs) = lookup("COUNSEL_CONNECT_TIMEOUT_SECS") {
            let parsed = secs.trim().parse::<u64>().ok().filter(|s| *s > 0);
            config.connect_timeout = match parsed {
                Some(s) => Duration::from_secs(s),
                None => {
                    return Err(ConfigError::Invalid {
                        name: "COUNSEL_CONNECT_TIMEOUT_SECS",
                        value: secs,
                    })
                }
            };
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn api_key_is_required() {
        let err = AppConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("GEMINI_API_KEY")));
    }

    #[test]
    fn defaults_apply() {
        let config = AppConfig::from_lookup(lookup(&[("GEMINI_API_KEY", "k")])).unwrap();
        assert_eq!(config.api_key, "k");
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.voice, DEFAULT_VOICE);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn overrides_apply() {
        let config = AppConfig::from_lookup(lookup(&[
            ("GEMINI_API_KEY", "k"),
            ("GEMINI_MODEL", "gemini-live-test"),
            ("COUNSEL_VOICE", "kore"),
            ("COUNSEL_CONNECT_TIMEOUT_SECS", "3"),
        ]))
        .unwrap();
        assert_eq!(config.model, "models/gemini-live-test");
        assert_eq!(config.voice, "Kore");
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
    }

    #[test]
    fn bad_timeout_is_rejected() {
        let err = AppConfig::from_lookup(lookup(&[
            ("GEMINI_API_KEY", "k"),
            ("COUNSEL_CONNECT_TIMEOUT_SECS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn unknown_voice_falls_back() {
        assert_eq!(resolve_voice("Puck"), "Puck");
        assert_eq!(resolve_voice("Nobody"), DEFAULT_VOICE);
    }

    #[test]
    fn session_config_requests_audio_with_transcription() {
        let config = SessionConfig::new("Puck", "be kind", vec![]);
        assert_eq!(config.response_modality, ResponseModality::Audio);
        assert_eq!(config.response_modality.as_str(), "AUDIO");
        assert!(config.transcription_enabled);
    }
}
