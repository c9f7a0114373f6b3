use thiserror::Error;

/// Errors that can occur while supervising agent sessions
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The event cannot be supervised (e.g. it names no session)
    #[error("invalid continuation event: {0}")]
    InvalidEvent(String),

    /// The state analyzer failed to classify the output
    #[error("analyzer failure: {0}")]
    AnalyzerFailure(String),

    /// Error reading or parsing configuration
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Error reading terminal output or an event file
    #[error("failed to read input: {0}")]
    InputError(#[source] std::io::Error),

    /// A replayed event line was not valid JSON
    #[error("event parse error: {0}")]
    EventParseError(String),
}

/// Result type alias for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;
