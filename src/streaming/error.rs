/// Streaming System Error Handling
///
/// Provides error utilities for the streaming subsystem.

use crate::error::{StreamingError, StreamingResult};
use crate::streaming::ResourceHandle;

/// Error context for streaming operations
pub trait StreamingErrorContext<T> {
    fn streaming_context(self, context: &str) -> StreamingResult<T>;
}

impl<T> StreamingErrorContext<T> for Option<T> {
    fn streaming_context(self, context: &str) -> StreamingResult<T> {
        self.ok_or_else(|| StreamingError::MalformedPage {
            reason: format!("{}: missing value", context),
        })
    }
}

impl<T, E> StreamingErrorContext<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn streaming_context(self, context: &str) -> StreamingResult<T> {
        self.map_err(|e| StreamingError::MalformedPage {
            reason: format!("{}: {}", context, e),
        })
    }
}

/// Create a stale handle error
pub fn stale_handle(handle: ResourceHandle) -> StreamingError {
    StreamingError::StaleHandle { handle: handle.raw() }
}

/// Create a malformed page error
pub fn malformed_page(reason: impl Into<String>) -> StreamingError {
    StreamingError::MalformedPage { reason: reason.into() }
}

/// Create an invalid resource error
pub fn invalid_resource(name: &str, reason: impl Into<String>) -> StreamingError {
    StreamingError::InvalidResource {
        name: name.to_string(),
        reason: reason.into(),
    }
}
