use thiserror::Error;

use crate::bounded::TimeoutError;
use crate::frame::FrameError;

#[derive(Error, Debug)]
pub enum SandlinkError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Framing errors
    #[error(transparent)]
    FrameParse(#[from] FrameError),

    // Bounded waits
    #[error("Operation timed out after {millis} ms")]
    Timeout { millis: u64 },

    // Relay errors
    #[error("Relay unavailable: {0}")]
    RelayUnavailable(String),

    #[error("Relay protocol error: {0}")]
    RelayProtocol(String),

    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    // Signal file errors
    #[error("Timed out after {millis} ms waiting for signal file {path}")]
    SignalTimeout { path: String, millis: u64 },

    // OSC registration errors
    #[error("OSC registration missing {field}")]
    OscRegistration { field: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<TimeoutError> for SandlinkError {
    fn from(err: TimeoutError) -> Self {
        Self::Timeout { millis: err.millis }
    }
}

impl SandlinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::SignalTimeout { .. } | Self::RelayUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SandlinkError>;
