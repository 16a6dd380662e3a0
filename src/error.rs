//! Crate-wide error type
//!
//! Registration and configuration surface errors through `StreamingError`.
//! Conditions the update loop recovers from (stale handles, read failures,
//! back-pressure) are logged and counted instead of returned.

/// Result type used across the crate
pub type StreamingResult<T> = Result<T, StreamingError>;

/// Errors raised by the streaming manager
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    #[error("Stale resource handle: {handle:#010x}")]
    StaleHandle { handle: u32 },

    #[error("Capacity exceeded for {what}: requested {requested}, ceiling {ceiling}")]
    CapacityExceeded {
        what: &'static str,
        requested: u64,
        ceiling: u64,
    },

    #[error("Invalid resource '{name}': {reason}")]
    InvalidResource { name: String, reason: String },

    #[error("Malformed page data: {reason}")]
    MalformedPage { reason: String },

    #[error("begin_update called while an update is already active")]
    UpdateAlreadyActive,

    #[error("end_update called without a matching begin_update")]
    UpdateNotActive,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {reason}")]
    Config { reason: String },

    #[error("Resource pack error: {reason}")]
    Pack { reason: String },

    #[error("Device memory error on {buffer}: {reason}")]
    Device { buffer: String, reason: String },
}

impl From<toml::de::Error> for StreamingError {
    fn from(err: toml::de::Error) -> Self {
        StreamingError::Config {
            reason: err.to_string(),
        }
    }
}

impl From<bincode::Error> for StreamingError {
    fn from(err: bincode::Error) -> Self {
        StreamingError::Pack {
            reason: err.to_string(),
        }
    }
}
