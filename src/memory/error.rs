//! Memory subsystem error handling
//!
//! Type aliases and helper constructors for allocator and device buffer failures.

use crate::error::{StreamingError, StreamingResult};
use crate::memory::PersistentBuffer;

/// Type alias for memory operation results
pub type MemoryResult<T> = StreamingResult<T>;

/// Create an out of capacity error
pub fn out_of_capacity_error(what: &'static str, requested: u64, ceiling: u64) -> StreamingError {
    StreamingError::CapacityExceeded {
        what,
        requested,
        ceiling,
    }
}

/// Create a device buffer error
pub fn device_error(buffer: PersistentBuffer, reason: impl std::fmt::Display) -> StreamingError {
    StreamingError::Device {
        buffer: buffer.label().to_string(),
        reason: reason.to_string(),
    }
}

/// Create an error for a write outside the current buffer extent
pub fn out_of_bounds_error(buffer: PersistentBuffer, offset: u64, len: usize, size: u64) -> StreamingError {
    device_error(
        buffer,
        format!("write of {} bytes at {} exceeds buffer size {}", len, offset, size),
    )
}
