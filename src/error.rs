//! Error types for the genie voice pipeline

use thiserror::Error;

use crate::engine::StatusCode;

/// Result type alias for genie operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device or stream error
    #[error("audio error: {0}")]
    Audio(String),

    /// The audio peripheral reported a fault for a block
    #[error("audio fault: {0}")]
    AudioFault(String),

    /// Blocks were lost because the consumer fell behind the producer
    #[error("audio overrun: {lost} block(s) lost")]
    Overrun {
        /// Number of blocks that never reached the consumer
        lost: u64,
    },

    /// The audio producer went away (end of file, device removed)
    #[error("audio source closed")]
    SourceClosed,

    /// Shutdown was requested while waiting for audio
    #[error("shutdown requested")]
    Shutdown,

    /// The recognition engine returned a non-success status
    #[error("engine error {status} during {context}")]
    Engine {
        /// Raw engine status
        status: StatusCode,
        /// Operation that produced the status
        context: &'static str,
    },

    /// Push called before the session was initialized
    #[error("recognition session not initialized")]
    SessionNotReady,

    /// Push called after a fatal engine status
    #[error("recognition session halted after fatal status")]
    SessionHalted,

    /// Driving an output line failed
    #[error("output error on line {line}: {reason}")]
    Output {
        /// Line name from the command table
        line: String,
        /// Driver message
        reason: String,
    },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WAV decoding error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}

impl Error {
    /// Build an engine error for the given operation
    #[must_use]
    pub const fn engine(status: StatusCode, context: &'static str) -> Self {
        Self::Engine { status, context }
    }

    /// Whether the pipeline may continue after this error
    ///
    /// Overruns lose audio but leave every component in a valid state
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Overrun { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_overruns_are_recoverable() {
        assert!(Error::Overrun { lost: 2 }.is_recoverable());
        assert!(!Error::AudioFault("dma".to_string()).is_recoverable());
        assert!(!Error::SourceClosed.is_recoverable());
        assert!(!Error::engine(StatusCode::LICENSE, "push").is_recoverable());
    }
}
