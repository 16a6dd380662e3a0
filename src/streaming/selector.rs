/// Page Selection
///
/// Refreshes recency for requested pages that are already registered, then
/// pops new-page requests from a max-heap on priority until the cycle's
/// budget is used. Every priority consulted is reset to zero afterwards.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::streaming::feedback::PageRequest;
use crate::streaming::{LruOrder, PageKey, RequestSets, ResourceRegistry, VirtualPageTable};

/// A page chosen for loading this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedPage {
    pub key: PageKey,
    pub virtual_page: u32,
    pub priority: u32,
}

#[derive(Debug, PartialEq, Eq)]
struct Candidate {
    priority: u32,
    request: usize,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Ties are not meaningful; any order between equal priorities is acceptable
        self.priority.cmp(&other.priority)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Select up to `budget` pages to load, highest priority first
pub fn select_pages(
    requests: &RequestSets,
    registry: &ResourceRegistry,
    page_table: &mut VirtualPageTable,
    lru: &mut LruOrder,
    budget: usize,
) -> Vec<SelectedPage> {
    // Recency must reflect use whether or not anything is evicted
    for &virtual_page in &requests.registered_to_touch {
        if let Some(slot) = page_table.registered_slot(virtual_page) {
            lru.touch(slot);
        }
    }

    let mut heap: BinaryHeap<Candidate> = requests
        .new_requests
        .iter()
        .enumerate()
        .map(|(request, page)| Candidate {
            priority: page_table.get(page.virtual_page).map(|entry| entry.priority).unwrap_or(0),
            request,
        })
        .collect();

    let mut selected = Vec::with_capacity(budget.min(heap.len()));
    while selected.len() < budget {
        let Some(candidate) = heap.pop() else {
            break;
        };
        let PageRequest { key, virtual_page } = requests.new_requests[candidate.request];

        // Guard against removal between ingestion and selection
        let still_valid = registry
            .resolve(key.resource)
            .map(|resource| key.page_index < resource.num_pages())
            .unwrap_or(false);
        if !still_valid || page_table.registered_slot(virtual_page).is_some() {
            continue;
        }

        selected.push(SelectedPage {
            key,
            virtual_page,
            priority: candidate.priority,
        });
    }

    reset_priorities(requests, page_table);
    selected
}

/// Priorities are per-cycle snapshots; clear every one this cycle touched
pub fn reset_priorities(requests: &RequestSets, page_table: &mut VirtualPageTable) {
    let touched = requests
        .registered_to_touch
        .iter()
        .copied()
        .chain(requests.new_requests.iter().map(|request| request.virtual_page));
    for virtual_page in touched {
        if let Some(entry) = page_table.get_mut(virtual_page) {
            entry.priority = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamingConfig;
    use crate::streaming::feedback::ingest;
    use crate::streaming::{
        CapacityManager, FeedbackRecord, HierarchyNode, PageSpec, ResourceBuilder, ResourceHandle,
    };

    fn setup(num_streaming: u32) -> (ResourceRegistry, VirtualPageTable, ResourceHandle) {
        let config = StreamingConfig {
            max_streaming_pages: 8,
            max_pending_pages: 4,
            ..StreamingConfig::default()
        };
        let mut builder = ResourceBuilder::new("select");
        builder.hierarchy_nodes(vec![HierarchyNode::empty()]);
        builder.root_page(PageSpec::new(vec![0; 4]));
        for _ in 0..num_streaming {
            builder.streaming_page(PageSpec::new(vec![0; 4]));
        }
        let mut capacity = CapacityManager::new(&config);
        let mut page_table = VirtualPageTable::new();
        let mut registry = ResourceRegistry::new();
        let handle = registry
            .add(builder.build().expect("build"), &mut capacity, &mut page_table)
            .expect("add");
        (registry, page_table, handle)
    }

    #[test]
    fn test_higher_priority_wins_single_slot() {
        let (registry, mut page_table, handle) = setup(2);
        let mut lru = LruOrder::new(8);
        let mut requests = RequestSets::default();
        let records = [
            FeedbackRecord::new(handle, 2, 1, 2),
            FeedbackRecord::new(handle, 1, 1, 5),
        ];
        ingest(&records, &registry, &mut page_table, &mut requests);

        let selected = select_pages(&requests, &registry, &mut page_table, &mut lru, 1);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].key, handle.page(1));
        assert_eq!(selected[0].priority, 5);
    }

    #[test]
    fn test_priorities_reset_after_selection() {
        let (registry, mut page_table, handle) = setup(3);
        let mut lru = LruOrder::new(8);
        let mut requests = RequestSets::default();
        let records = [FeedbackRecord::new(handle, 1, 3, 7)];
        ingest(&records, &registry, &mut page_table, &mut requests);

        let selected = select_pages(&requests, &registry, &mut page_table, &mut lru, 1);
        assert_eq!(selected.len(), 1);
        for request in &requests.new_requests {
            assert_eq!(page_table.get(request.virtual_page).map(|entry| entry.priority), Some(0));
        }
    }

    #[test]
    fn test_registered_requests_refresh_lru() {
        let (registry, mut page_table, handle) = setup(2);
        let mut lru = LruOrder::new(4);
        lru.begin_cycle();

        let virtual_page = registry
            .resolve(handle)
            .and_then(|resource| resource.virtual_page(1))
            .expect("virtual page");
        page_table.get_mut(virtual_page).expect("entry").registered_slot = 0;

        let mut requests = RequestSets::default();
        ingest(&[FeedbackRecord::new(handle, 1, 1, 3)], &registry, &mut page_table, &mut requests);
        let selected = select_pages(&requests, &registry, &mut page_table, &mut lru, 4);

        assert!(selected.is_empty());
        assert!(lru.is_referenced_this_cycle(0));
        assert_eq!(lru.iter().last(), Some(0));
    }
}
