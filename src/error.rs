use thiserror::Error;

/// Errors surfaced by a speech session.
///
/// `Clone` because memoized phrase and PCM results are shared between every
/// awaiter of the same computation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpeechError {
    /// The session was stopped. Expected; callers should not report it.
    #[error("Playback cancelled")]
    Cancelled,

    #[error("Synthesis failed: {0}")]
    Synthesis(String),

    #[error("Playback failed: {0}")]
    Playback(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl SpeechError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SpeechError::Cancelled)
    }
}

impl From<tokio::task::JoinError> for SpeechError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            SpeechError::Cancelled
        } else {
            SpeechError::Synthesis(format!("worker task panicked: {}", err))
        }
    }
}

impl From<config::ConfigError> for SpeechError {
    fn from(err: config::ConfigError) -> Self {
        SpeechError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SpeechError>;
