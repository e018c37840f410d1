use thiserror::Error;

use crate::output::OutputChannel;

/// All errors produced by cadence-core.
#[derive(Debug, Error)]
pub enum CadenceError {
    #[error("no tone backend could be constructed for channel {0}")]
    ChannelUnavailable(OutputChannel),

    #[error("tone backend '{backend}' failed: {detail}")]
    Backend {
        backend: &'static str,
        detail: String,
    },

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("{channel} output unsupported on this device")]
    Unsupported { channel: OutputChannel },

    #[error("{channel} driver error: {detail}")]
    Driver {
        channel: OutputChannel,
        detail: String,
    },

    #[error("invalid press window: end {end_ms} precedes start {start_ms}")]
    InvalidPressWindow { start_ms: f64, end_ms: f64 },

    #[error("invalid morse pattern {0:?}")]
    InvalidPattern(String),

    #[error("no keyer session is active")]
    NoActiveSession,

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CadenceError {
    pub fn backend(backend: &'static str, detail: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            detail: detail.into(),
        }
    }

    pub fn driver(channel: OutputChannel, detail: impl Into<String>) -> Self {
        Self::Driver {
            channel,
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CadenceError>;
