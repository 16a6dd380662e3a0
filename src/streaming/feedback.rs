/// Feedback Ingestion
///
/// Consumers report the pages they touched as `{resource, first page, count,
/// priority}` records. The manager drains the shared queue once per cycle by
/// swapping buffers, then folds the records into per-page priorities using
/// max accumulation and splits the touched pages into "already registered"
/// and "needs loading" sets.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;

use crate::memory::round_up_to_significant_bits;
use crate::streaming::{PageKey, Resource, ResourceHandle, ResourceRegistry, VirtualPageTable, MAX_FEEDBACK_PRIORITY};

/// A single priority report as written by the consumer
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct FeedbackRecord {
    pub resource: u32,
    pub first_page: u32,
    pub page_count: u32,
    pub priority: u32,
}

impl FeedbackRecord {
    pub const SIZE: usize = std::mem::size_of::<FeedbackRecord>();

    pub fn new(resource: ResourceHandle, first_page: u32, page_count: u32, priority: u32) -> Self {
        Self {
            resource: resource.raw(),
            first_page,
            page_count,
            priority,
        }
    }

    pub fn handle(&self) -> ResourceHandle {
        ResourceHandle::from_raw(self.resource)
    }
}

/// Producer side of the feedback hand-off. Clones share one queue.
#[derive(Debug, Clone, Default)]
pub struct FeedbackQueue {
    records: Arc<Mutex<Vec<FeedbackRecord>>>,
}

impl FeedbackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: FeedbackRecord) {
        self.records.lock().push(record);
    }

    pub fn extend(&self, records: impl IntoIterator<Item = FeedbackRecord>) {
        self.records.lock().extend(records);
    }

    /// Append little-endian records read back from device memory.
    /// Trailing bytes that do not form a whole record are ignored.
    pub fn extend_from_bytes(&self, bytes: &[u8]) -> usize {
        let records: Vec<FeedbackRecord> = bytes
            .chunks_exact(FeedbackRecord::SIZE)
            .map(bytemuck::pod_read_unaligned::<FeedbackRecord>)
            .collect();
        let count = records.len();
        self.extend(records);
        count
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exchange the queued records with `spare`, which is cleared first
    pub fn swap(&self, spare: &mut Vec<FeedbackRecord>) {
        spare.clear();
        std::mem::swap(&mut *self.records.lock(), spare);
    }
}

/// Adapts the number of feedback records consumed per cycle
#[derive(Debug, Clone)]
pub struct FeedbackBufferSizer {
    current: u32,
    min_size: u32,
    max_size: u32,
    over_budget_cycles: u32,
    under_budget_cycles: u32,
}

impl FeedbackBufferSizer {
    /// Consecutive over-budget cycles tolerated before growing
    const GROW_AFTER: u32 = 2;
    /// Consecutive under-budget cycles before decaying
    const SHRINK_AFTER: u32 = 30;
    const GROWTH_FACTOR: f64 = 1.25;
    const DECAY_FACTOR: f64 = 0.98;

    pub fn new(min_size: u32, max_size: u32) -> Self {
        Self {
            current: min_size,
            min_size,
            max_size,
            over_budget_cycles: 0,
            under_budget_cycles: 0,
        }
    }

    /// Records accepted this cycle
    pub fn bound(&self) -> u32 {
        self.current
    }

    /// Feed the number of records the consumer produced this cycle
    pub fn update(&mut self, observed: u32) {
        if observed > self.current {
            self.under_budget_cycles = 0;
            self.over_budget_cycles += 1;
            if self.over_budget_cycles > Self::GROW_AFTER {
                let target = (observed as f64 * Self::GROWTH_FACTOR).min(u32::MAX as f64) as u32;
                self.current = round_up_to_significant_bits(target, 2);
                self.over_budget_cycles = 0;
            }
        } else if observed < self.current / 2 {
            self.over_budget_cycles = 0;
            self.under_budget_cycles += 1;
            if self.under_budget_cycles > Self::SHRINK_AFTER {
                self.current = (self.current as f64 * Self::DECAY_FACTOR) as u32;
            }
        } else {
            self.over_budget_cycles = 0;
            self.under_budget_cycles = 0;
        }

        self.current = self.current.clamp(self.min_size, self.max_size);
    }
}

/// A streaming page requested this cycle that has no slot yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub key: PageKey,
    pub virtual_page: u32,
}

/// Per-cycle output of ingestion
#[derive(Debug, Default)]
pub struct RequestSets {
    /// Virtual pages already registered, to refresh in the LRU
    pub registered_to_touch: Vec<u32>,
    /// Pages to consider for loading
    pub new_requests: Vec<PageRequest>,
}

impl RequestSets {
    pub fn clear(&mut self) {
        self.registered_to_touch.clear();
        self.new_requests.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.registered_to_touch.is_empty() && self.new_requests.is_empty()
    }
}

/// Counters from one ingestion pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub records: u32,
    pub stale_records: u32,
    pub invalid_records: u32,
    pub pages_requested: u32,
    pub dependency_requests: u32,
}

/// Fold feedback records into virtual page priorities and request sets
pub fn ingest(
    records: &[FeedbackRecord],
    registry: &ResourceRegistry,
    page_table: &mut VirtualPageTable,
    requests: &mut RequestSets,
) -> IngestStats {
    let mut stats = IngestStats {
        records: records.len() as u32,
        ..IngestStats::default()
    };
    let mut stack = Vec::new();

    for record in records {
        if record.priority == 0 || record.priority > MAX_FEEDBACK_PRIORITY {
            stats.invalid_records += 1;
            continue;
        }

        // Removal races with in-flight feedback; stale records are expected
        let Some(resource) = registry.resolve(record.handle()) else {
            stats.stale_records += 1;
            continue;
        };

        let end = record.first_page.saturating_add(record.page_count);
        if end > resource.num_pages() || record.page_count == 0 {
            stats.invalid_records += 1;
        }
        let end = end.min(resource.num_pages());

        for page_index in record.first_page..end {
            stack.push((page_index, record.priority));
            request_with_dependencies(resource, &mut stack, page_table, requests, &mut stats);
        }
    }

    stats
}

/// Raise priorities for a page and, one step higher, for its streaming dependencies
fn request_with_dependencies(
    resource: &Resource,
    stack: &mut Vec<(u32, u32)>,
    page_table: &mut VirtualPageTable,
    requests: &mut RequestSets,
    stats: &mut IngestStats,
) {
    let Some(handle) = resource.handle() else {
        stack.clear();
        return;
    };

    let mut is_dependency = false;
    while let Some((page_index, priority)) = stack.pop() {
        // Root pages are always resident
        let Some(virtual_page) = resource.virtual_page(page_index) else {
            continue;
        };
        let Some(entry) = page_table.get_mut(virtual_page) else {
            continue;
        };

        if entry.priority == 0 {
            if entry.is_registered() {
                requests.registered_to_touch.push(virtual_page);
            } else {
                requests.new_requests.push(PageRequest {
                    key: PageKey::new(handle, page_index),
                    virtual_page,
                });
            }
            stats.pages_requested += 1;
        }
        if is_dependency {
            stats.dependency_requests += 1;
        }
        is_dependency = true;

        // Dependencies were already raised past anything at or below the old value
        if priority <= entry.priority {
            continue;
        }
        entry.priority = priority;

        let dependency_priority = priority.saturating_add(1).min(MAX_FEEDBACK_PRIORITY);
        for &dependency in resource.page_dependencies(page_index) {
            stack.push((dependency, dependency_priority));
        }
    }
}
