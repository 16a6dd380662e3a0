/// Device Memory Management
///
/// Index-space allocators, the staging ring for in-flight reads, the
/// bandwidth throttle, and the persistent device buffers pages are
/// installed into.

pub mod bandwidth_throttle;
pub mod error;
pub mod persistent_buffer;
pub mod ring_allocator;
pub mod span_allocator;
pub mod wgpu_buffer;

pub use bandwidth_throttle::{BandwidthThrottle, ThrottleMetrics};
pub use error::{device_error, out_of_bounds_error, out_of_capacity_error, MemoryResult};
pub use persistent_buffer::{CommandStream, DeviceCommand, DeviceMemory, HostMemory, PersistentBuffer};
pub use ring_allocator::{RingAllocator, StagingSpan};
pub use span_allocator::SpanAllocator;
pub use wgpu_buffer::WgpuMemory;

/// Round `value` up to a multiple of `granularity`
pub fn round_up_to_multiple(value: u32, granularity: u32) -> u32 {
    debug_assert!(granularity > 0);
    value.div_ceil(granularity) * granularity
}

/// Round `value` up so that only its `bits` most significant bits may be set
pub fn round_up_to_significant_bits(value: u32, bits: u32) -> u32 {
    debug_assert!(bits > 0);
    if value == 0 {
        return 0;
    }
    let highest_bit = 31 - value.leading_zeros();
    let shift = (highest_bit + 1).saturating_sub(bits);
    let unit = 1u64 << shift;
    (((value as u64 + unit - 1) >> shift) << shift).min(u32::MAX as u64) as u32
}
