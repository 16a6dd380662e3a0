/// Capacity Manager
///
/// Owns the root page and hierarchy allocators and sizes the persistent
/// device buffers from them. The page data buffer holds every streaming
/// slot first, followed by the root slots; only the root region changes
/// size. Growth is rounded to a coarse granularity and capped by a hard
/// ceiling, and shrinking is suppressed while admissions are pending.

use serde::Serialize;

use crate::config::StreamingConfig;
use crate::error::StreamingResult;
use crate::memory::{
    out_of_capacity_error, round_up_to_multiple, CommandStream, PersistentBuffer, SpanAllocator,
};
use crate::streaming::HierarchyNode;

/// Ranges assigned to a newly admitted resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootAdmission {
    pub root_page_start: u32,
    pub hierarchy_offset: u32,
}

/// Allocation counters across the registry and page table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CapacityCounters {
    pub num_resources: u32,
    pub root_pages_allocated: u32,
    pub root_pages_extent: u32,
    pub hierarchy_nodes_allocated: u32,
    pub hierarchy_nodes_extent: u32,
    pub virtual_pages_allocated: u32,
    pub virtual_pages_extent: u32,
}

#[derive(Debug)]
pub struct CapacityManager {
    root_allocator: SpanAllocator,
    hierarchy_allocator: SpanAllocator,

    max_streaming_pages: u32,
    streaming_page_size: u32,
    root_page_size: u32,
    num_initial_root_pages: u32,
    max_root_pages: u32,
    root_allocation_granularity: u32,

    /// Root slots backed by the current page data buffer
    committed_root_slots: u32,
    /// Hierarchy nodes backed by the current hierarchy buffer
    committed_hierarchy_nodes: u32,

    page_data_size: u64,
    hierarchy_size: u64,
}

impl CapacityManager {
    pub fn new(config: &StreamingConfig) -> Self {
        Self {
            root_allocator: SpanAllocator::new(),
            hierarchy_allocator: SpanAllocator::new(),
            max_streaming_pages: config.max_streaming_pages,
            streaming_page_size: config.streaming_page_size,
            root_page_size: config.root_page_size,
            num_initial_root_pages: config.num_initial_root_pages,
            max_root_pages: config.max_root_pages,
            root_allocation_granularity: config.root_allocation_granularity,
            committed_root_slots: 0,
            committed_hierarchy_nodes: 0,
            page_data_size: 0,
            hierarchy_size: 0,
        }
    }

    /// Allocate root and hierarchy ranges, refusing growth past the root ceiling
    pub fn admit(&mut self, name: &str, num_root_pages: u32, num_hierarchy_nodes: u32) -> StreamingResult<RootAdmission> {
        self.root_allocator.consolidate();

        let root_page_start = self.root_allocator.allocate(num_root_pages);
        let extent = self.root_allocator.max_size();
        if extent > self.max_root_pages {
            self.root_allocator.free(root_page_start, num_root_pages);
            self.root_allocator.consolidate();
            log::warn!(
                "[CapacityManager] Refusing '{}': {} root pages would extend the root region to {} slots, ceiling is {}",
                name,
                num_root_pages,
                extent,
                self.max_root_pages
            );
            return Err(out_of_capacity_error("root pages", extent as u64, self.max_root_pages as u64));
        }

        let hierarchy_offset = self.hierarchy_allocator.allocate(num_hierarchy_nodes);
        Ok(RootAdmission {
            root_page_start,
            hierarchy_offset,
        })
    }

    pub fn release(&mut self, admission: RootAdmission, num_root_pages: u32, num_hierarchy_nodes: u32) {
        self.root_allocator.free(admission.root_page_start, num_root_pages);
        self.hierarchy_allocator.free(admission.hierarchy_offset, num_hierarchy_nodes);
    }

    pub fn consolidate(&mut self) {
        self.root_allocator.consolidate();
        self.hierarchy_allocator.consolidate();
    }

    /// Root slots needed for the current allocations
    pub fn required_root_slots(&self) -> u32 {
        let needed = self.root_allocator.max_size();
        if needed <= self.num_initial_root_pages {
            self.num_initial_root_pages
        } else {
            round_up_to_multiple(needed, self.root_allocation_granularity).min(self.max_root_pages)
        }
    }

    /// Hierarchy nodes needed for the current allocations
    pub fn required_hierarchy_nodes(&self) -> u32 {
        match self.hierarchy_allocator.max_size() {
            0 => 0,
            needed => needed.next_power_of_two(),
        }
    }

    /// Record buffer resizes for the current commitments. Returns true if anything changed.
    pub fn resize_if_needed(&mut self, allow_shrink: bool, stream: &mut CommandStream) -> bool {
        self.consolidate();

        let mut root_slots = self.required_root_slots();
        let mut hierarchy_nodes = self.required_hierarchy_nodes();
        if !allow_shrink {
            root_slots = root_slots.max(self.committed_root_slots);
            hierarchy_nodes = hierarchy_nodes.max(self.committed_hierarchy_nodes);
        }

        let mut changed = false;

        let page_data_size = self.page_data_bytes(root_slots);
        if page_data_size != self.page_data_size {
            log::debug!(
                "[CapacityManager] Page data buffer {} -> {} bytes ({} root slots)",
                self.page_data_size,
                page_data_size,
                root_slots
            );
            stream.resize(PersistentBuffer::PageData, page_data_size);
            self.page_data_size = page_data_size;
            changed = true;
        }
        self.committed_root_slots = root_slots;

        let hierarchy_size = hierarchy_nodes as u64 * HierarchyNode::SIZE;
        if hierarchy_size != self.hierarchy_size {
            log::debug!(
                "[CapacityManager] Hierarchy buffer {} -> {} bytes",
                self.hierarchy_size,
                hierarchy_size
            );
            stream.resize(PersistentBuffer::Hierarchy, hierarchy_size);
            self.hierarchy_size = hierarchy_size;
            changed = true;
        }
        self.committed_hierarchy_nodes = hierarchy_nodes;

        changed
    }

    fn page_data_bytes(&self, root_slots: u32) -> u64 {
        self.max_streaming_pages as u64 * self.streaming_page_size as u64
            + root_slots as u64 * self.root_page_size as u64
    }

    /// Global slot index of a root slot
    pub fn root_global_slot(&self, root_slot: u32) -> u32 {
        self.max_streaming_pages + root_slot
    }

    /// Byte offset of a global slot in the page data buffer
    pub fn page_offset(&self, global_slot: u32) -> u64 {
        let streaming = global_slot.min(self.max_streaming_pages) as u64 * self.streaming_page_size as u64;
        let root = global_slot.saturating_sub(self.max_streaming_pages) as u64 * self.root_page_size as u64;
        streaming + root
    }

    pub fn hierarchy_byte_offset(&self, node_offset: u32) -> u64 {
        node_offset as u64 * HierarchyNode::SIZE
    }

    pub fn committed_root_slots(&self) -> u32 {
        self.committed_root_slots
    }

    pub fn page_data_size(&self) -> u64 {
        self.page_data_size
    }

    pub fn hierarchy_size(&self) -> u64 {
        self.hierarchy_size
    }

    pub fn root_pages_allocated(&self) -> u32 {
        self.root_allocator.num_allocated()
    }

    pub fn root_pages_extent(&self) -> u32 {
        self.root_allocator.max_size()
    }

    pub fn hierarchy_nodes_allocated(&self) -> u32 {
        self.hierarchy_allocator.num_allocated()
    }

    pub fn hierarchy_nodes_extent(&self) -> u32 {
        self.hierarchy_allocator.max_size()
    }
}
