/// Staging Ring Allocator
///
/// Bounds the bytes held by in-flight reads. Allocations are released in
/// the order they were made, matching the FIFO completion of pending pages.

use std::collections::VecDeque;

/// Byte range inside the staging ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingSpan {
    pub offset: u32,
    pub size: u32,
}

/// FIFO ring buffer allocator
#[derive(Debug)]
pub struct RingAllocator {
    buffer_size: u32,
    read_offset: u32,
    write_offset: u32,
    live: VecDeque<StagingSpan>,
}

impl RingAllocator {
    pub fn new(buffer_size: u32) -> Self {
        Self {
            buffer_size,
            read_offset: 0,
            write_offset: 0,
            live: VecDeque::new(),
        }
    }

    /// Reserve `size` bytes, wrapping to the start when the tail is too short.
    /// One byte always stays unused so a full ring is distinguishable from an empty one.
    pub fn try_allocate(&mut self, size: u32) -> Option<StagingSpan> {
        if size == 0 || size >= self.buffer_size {
            return None;
        }

        if self.live.is_empty() {
            self.read_offset = 0;
            self.write_offset = 0;
        }

        let offset = if self.write_offset < self.read_offset {
            if size + 1 <= self.read_offset - self.write_offset {
                self.write_offset
            } else {
                return None;
            }
        } else if size + 1 <= self.buffer_size - self.write_offset {
            self.write_offset
        } else if size + 1 <= self.read_offset {
            0
        } else {
            return None;
        };

        let span = StagingSpan { offset, size };
        self.write_offset = offset + size;
        self.live.push_back(span);
        Some(span)
    }

    /// Release the oldest live allocation
    pub fn free(&mut self, span: StagingSpan) {
        let oldest = self.live.pop_front();
        debug_assert_eq!(oldest, Some(span), "staging spans must be freed in allocation order");

        match self.live.front() {
            Some(next) => self.read_offset = next.offset,
            None => {
                self.read_offset = 0;
                self.write_offset = 0;
            }
        }
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Bytes currently reserved by live spans
    pub fn used_bytes(&self) -> u64 {
        self.live.iter().map(|span| span.size as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
