use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use page_streamer::memory::{HostMemory, PersistentBuffer};
use page_streamer::streaming::feedback::ingest;
use page_streamer::streaming::*;
use page_streamer::{StreamingConfig, StreamingError};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

const PAGE_BYTES: usize = 32;

fn small_config(slots: u32) -> StreamingConfig {
    StreamingConfig {
        max_streaming_pages: slots,
        max_pending_pages: slots,
        streaming_page_size: 256,
        root_page_size: 256,
        num_initial_root_pages: 8,
        max_root_pages: 32,
        root_allocation_granularity: 8,
        staging_buffer_size: 64 * 1024,
        ..StreamingConfig::default()
    }
}

fn payload(page: u32) -> Vec<u8> {
    vec![page as u8 + 1; PAGE_BYTES]
}

/// Root pages first, then independent streaming pages
fn builder(name: &str, roots: u32, streaming: u32) -> ResourceBuilder {
    let mut builder = ResourceBuilder::new(name);
    builder.hierarchy_nodes(vec![HierarchyNode::empty(); 2]);
    for page in 0..roots {
        builder.root_page(PageSpec::new(payload(page)));
    }
    for page in roots..roots + streaming {
        builder.streaming_page(PageSpec::new(payload(page)).with_units(1));
    }
    builder
}

fn manager(config: StreamingConfig) -> (StreamingManager, HostMemory) {
    StreamingManager::with_host_memory(config).expect("Failed to create manager")
}

fn cycle(manager: &mut StreamingManager) {
    manager.begin_update().expect("Failed to begin update");
    manager.end_update().expect("Failed to end update");
}

fn request(manager: &StreamingManager, handle: ResourceHandle, pages: &[(u32, u32)]) {
    let queue = manager.feedback_queue();
    for &(page, priority) in pages {
        queue.push(FeedbackRecord::new(handle, page, 1, priority));
    }
}

fn record_events(manager: &mut StreamingManager) -> Arc<Mutex<Vec<StreamingEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    manager.set_diagnostics(move |event| sink.lock().push(event.clone()));
    events
}

/// Fails its first `failures` reads
#[derive(Debug)]
struct FlakySource {
    bytes: Vec<u8>,
    failures: AtomicU32,
}

impl PageSource for FlakySource {
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> io::Result<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(io::Error::new(io::ErrorKind::Other, "injected read failure"));
        }
        let start = offset as usize;
        dst.copy_from_slice(&self.bytes[start..start + dst.len()]);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Accepts reads and never completes them
struct BlackHoleDispatcher;

impl ReadDispatcher for BlackHoleDispatcher {
    fn dispatch(&self, _request: ReadRequest, _completions: flume::Sender<ReadCompletion>) {}
}

type HeldRead = (ReadRequest, flume::Sender<ReadCompletion>);

/// Holds reads until the test releases them
#[derive(Clone, Default)]
struct HoldingDispatcher {
    held: Arc<Mutex<Vec<HeldRead>>>,
}

impl HoldingDispatcher {
    fn release_all(&self) -> usize {
        let held = std::mem::take(&mut *self.held.lock());
        let released = held.len();
        for (request, completions) in held {
            let _ = completions.send(request.execute());
        }
        released
    }
}

impl ReadDispatcher for HoldingDispatcher {
    fn dispatch(&self, request: ReadRequest, completions: flume::Sender<ReadCompletion>) {
        self.held.lock().push((request, completions));
    }
}

#[test]
fn test_capacity_invariant_under_random_feedback() {
    let (mut manager, _) = manager(small_config(8));
    let handles: Vec<ResourceHandle> = (0..3)
        .map(|index| {
            let resource = builder(&format!("r{}", index), 1, 12).build().expect("build");
            manager.add(resource).expect("add")
        })
        .collect();
    let mut rng = StdRng::seed_from_u64(42);

    for _ in 0..100 {
        let queue = manager.feedback_queue();
        for _ in 0..rng.gen_range(1..20) {
            let handle = handles[rng.gen_range(0..handles.len())];
            queue.push(FeedbackRecord::new(handle, rng.gen_range(1..13), rng.gen_range(1..4), rng.gen_range(1..100)));
        }
        cycle(&mut manager);

        let mut seen = Vec::new();
        for slot in 0..8 {
            if let Some(key) = manager.slot_page(slot) {
                assert!(!seen.contains(&key), "{:?} registered twice", key);
                assert_eq!(manager.page_slot(key.resource, key.page_index), Some(slot));
                seen.push(key);
            }
        }
        let resident: usize = handles
            .iter()
            .map(|&handle| (1..13).filter(|&page| manager.is_page_resident(handle, page)).count())
            .sum();
        assert!(resident <= 8);
        assert!(manager.stats().registered_pages <= 8);
    }
}

#[test]
fn test_lru_order_follows_touch_sequence() {
    let (mut manager, _) = manager(small_config(4));
    let handle = manager.add(builder("lru", 1, 4).build().expect("build")).expect("add");

    request(&manager, handle, &[(1, 9), (2, 8), (3, 7), (4, 6)]);
    cycle(&mut manager);
    let slot = |page| manager.page_slot(handle, page).expect("registered");
    let slots = [slot(1), slot(2), slot(3), slot(4)];

    // Touch all four in a new order with no evictions
    request(&manager, handle, &[(3, 1), (1, 1), (4, 1), (2, 1)]);
    cycle(&mut manager);
    assert_eq!(manager.lru_order(), vec![slots[2], slots[0], slots[3], slots[1]]);
    assert_eq!(manager.stats().evictions, 0);
}

#[test]
fn test_higher_priority_wins_the_only_slot() {
    let (mut manager, _) = manager(small_config(1));
    let handle = manager.add(builder("priority", 1, 2).build().expect("build")).expect("add");

    request(&manager, handle, &[(2, 2), (1, 5)]);
    cycle(&mut manager);

    assert!(manager.is_page_resident(handle, 1));
    assert!(!manager.is_page_resident(handle, 2));
    assert_eq!(manager.page_slot(handle, 2), None);
}

#[test]
fn test_duplicate_reports_select_at_max_priority() {
    let config = small_config(4);
    let mut capacity = CapacityManager::new(&config);
    let mut page_table = VirtualPageTable::new();
    let mut registry = ResourceRegistry::new();
    let mut lru = LruOrder::new(config.max_streaming_pages);
    let handle = registry
        .add(builder("dup", 1, 2).build().expect("build"), &mut capacity, &mut page_table)
        .expect("add");

    let records = [
        FeedbackRecord::new(handle, 1, 1, 1),
        FeedbackRecord::new(handle, 1, 1, 4),
    ];
    let mut requests = RequestSets::default();
    ingest(&records, &registry, &mut page_table, &mut requests);
    assert_eq!(requests.new_requests.len(), 1);

    let selected = select_pages(&requests, &registry, &mut page_table, &mut lru, 4);
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].key, handle.page(1));
    assert_eq!(selected[0].priority, 4);
}

#[test]
fn test_root_pages_never_evicted() {
    let (mut manager, _) = manager(small_config(2));
    let handle = manager.add(builder("roots", 2, 4).build().expect("build")).expect("add");
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..20 {
        let queue = manager.feedback_queue();
        queue.push(FeedbackRecord::new(handle, 0, 6, rng.gen_range(1..50)));
        queue.push(FeedbackRecord::new(handle, rng.gen_range(0..2), 1, MAX_FEEDBACK_PRIORITY));
        cycle(&mut manager);

        for slot in 0..2 {
            if let Some(key) = manager.slot_page(slot) {
                assert!(key.page_index >= 2, "root page {:?} in a streaming slot", key);
            }
        }
        assert!(manager.is_page_resident(handle, 0));
        assert!(manager.is_page_resident(handle, 1));
    }
}

#[test]
fn test_fixup_waits_for_dependency_install() {
    let (mut manager, memory) = manager(small_config(4));
    let mut builder = ResourceBuilder::new("fixups");
    builder.hierarchy_nodes(vec![HierarchyNode::empty()]);
    builder.root_page(PageSpec::new(payload(0)));
    builder.streaming_page(PageSpec::new(payload(1)).with_fixup(FixupSpec::new(1, 0, 0)));
    builder.streaming_page(PageSpec::new(payload(2)).with_fixup(FixupSpec::new(2, 0, 1).with_dependencies(&[1])));
    let handle = manager.add(builder.build().expect("build")).expect("add");

    let child_reference = |child| {
        memory
            .read_u32(PersistentBuffer::Hierarchy, HierarchyNode::child_reference_offset(0, child))
            .expect("hierarchy uploaded")
    };

    request(&manager, handle, &[(2, 3)]);
    cycle(&mut manager);
    assert!(manager.is_page_resident(handle, 2));
    assert_eq!(child_reference(1), CHILD_REFERENCE_NOT_RESIDENT);
    assert_eq!(manager.stats().fixups_deferred, 1);

    request(&manager, handle, &[(1, 3)]);
    cycle(&mut manager);
    let slot1 = manager.page_slot(handle, 1).expect("page 1 registered");
    let slot2 = manager.page_slot(handle, 2).expect("page 2 registered");
    assert_eq!(child_reference(0), slot1 << CHILD_REFERENCE_PART_BITS);
    assert_eq!(child_reference(1), slot2 << CHILD_REFERENCE_PART_BITS);
}

#[test]
fn test_add_then_remove_restores_counters() {
    let (mut manager, _) = manager(small_config(4));
    manager.add(builder("resident", 2, 3).build().expect("build")).expect("add");
    let before = manager.capacity_counters();

    let handle = manager.add(builder("transient", 3, 5).build().expect("build")).expect("add");
    assert_ne!(manager.capacity_counters(), before);
    manager.remove(handle).expect("remove");

    assert_eq!(manager.capacity_counters(), before);
}

#[test]
fn test_new_page_replaces_least_recently_used() {
    let (mut manager, _) = manager(small_config(4));
    let handle = manager.add(builder("scenario", 1, 5).build().expect("build")).expect("add");

    request(&manager, handle, &[(1, 10), (2, 9), (3, 8), (4, 7)]);
    cycle(&mut manager);
    assert!((1..=4).all(|page| manager.is_page_resident(handle, page)));

    let lru_slot = manager.lru_order()[0];
    let victim = manager.slot_page(lru_slot).expect("slot occupied");

    request(&manager, handle, &[(5, 3)]);
    cycle(&mut manager);

    assert_eq!(manager.page_slot(handle, 5), Some(lru_slot));
    assert!(manager.is_page_resident(handle, 5));
    assert!(!manager.is_page_resident(victim.resource, victim.page_index));
}

#[test]
fn test_parent_requested_first_and_pinned() {
    let (mut manager, _) = manager(small_config(2));
    let mut builder = builder("tree", 1, 0);
    let parent = builder.streaming_page(PageSpec::new(payload(1)));
    let child = builder.streaming_page(PageSpec::new(payload(2)).with_dependencies(&[parent]));
    let other = builder.streaming_page(PageSpec::new(payload(3)));
    let handle = manager.add(builder.build().expect("build")).expect("add");

    // Only the child is reported; its parent is pulled in ahead of it
    request(&manager, handle, &[(child, 4)]);
    cycle(&mut manager);
    assert!(manager.is_page_resident(handle, parent));
    assert!(manager.is_page_resident(handle, child));
    assert_eq!(manager.lru_order()[0], manager.page_slot(handle, parent).expect("parent slot"));

    // The parent is least recently used but pinned by its child
    request(&manager, handle, &[(other, 9)]);
    cycle(&mut manager);
    assert!(manager.is_page_resident(handle, parent));
    assert!(!manager.is_page_resident(handle, child));
    assert!(manager.is_page_resident(handle, other));
}

#[test]
fn test_stale_feedback_is_dropped() {
    let (mut manager, _) = manager(small_config(4));
    let old = manager.add(builder("old", 1, 2).build().expect("build")).expect("add");
    manager.remove(old).expect("remove");
    let new = manager.add(builder("new", 1, 2).build().expect("build")).expect("add");
    assert_eq!(old.slot(), new.slot());

    request(&manager, old, &[(1, 5)]);
    cycle(&mut manager);

    assert_eq!(manager.stats().stale_feedback, 1);
    assert!(!manager.is_page_resident(new, 1));
    assert!(!manager.is_page_resident(old, 1));
}

#[test]
fn test_read_for_removed_resource_is_discarded() {
    let dispatcher = HoldingDispatcher::default();
    let mut manager = StreamingManager::new(small_config(2), Box::new(HostMemory::new()), Box::new(dispatcher.clone()))
        .expect("Failed to create manager");
    let removed = manager.add(builder("removed", 1, 1).build().expect("build")).expect("add");

    request(&manager, removed, &[(1, 5)]);
    cycle(&mut manager);
    assert_eq!(manager.num_pending(), 1);

    manager.remove(removed).expect("remove");
    let replacement = manager.add(builder("replacement", 1, 1).build().expect("build")).expect("add");
    assert_eq!(dispatcher.release_all(), 1);
    cycle(&mut manager);

    let stats = manager.stats();
    assert_eq!(stats.pages_installed, 0);
    assert_eq!(stats.pages_discarded, 1);
    assert_eq!(manager.num_pending(), 0);
    assert!(!manager.is_page_resident(replacement, 1));
    assert!(!manager.is_page_resident(removed, 1));
    assert!((0..2).all(|slot| manager.slot_page(slot).is_none()));
}

#[test]
fn test_failed_read_returns_page_to_unregistered() {
    let (mut manager, _) = manager(small_config(2));
    let events = record_events(&mut manager);
    let (descriptor, streamable) = builder("flaky", 1, 2).build_parts().expect("build");
    let source = FlakySource {
        bytes: streamable,
        failures: AtomicU32::new(1),
    };
    let handle = manager.add(Resource::new(descriptor, Arc::new(source))).expect("add");

    request(&manager, handle, &[(1, 5)]);
    cycle(&mut manager);
    assert!(!manager.is_page_resident(handle, 1));
    assert_eq!(manager.page_slot(handle, 1), None);
    assert_eq!(manager.stats().read_failures, 1);
    assert!(matches!(events.lock().as_slice(), [StreamingEvent::ReadFailed { key, .. }] if *key == handle.page(1)));

    request(&manager, handle, &[(1, 5)]);
    cycle(&mut manager);
    assert!(manager.is_page_resident(handle, 1));
}

#[test]
fn test_checksum_mismatch_treated_as_failure() {
    let (mut manager, _) = manager(small_config(2));
    let events = record_events(&mut manager);
    let mut builder = builder("corrupt", 1, 1);
    builder.with_checksums(true);
    let (descriptor, mut streamable) = builder.build_parts().expect("build");
    let last = streamable.len() - 1;
    streamable[last] ^= 0x5A;
    let handle = manager
        .add(Resource::new(descriptor, Arc::new(MemorySource::new(streamable))))
        .expect("add");

    request(&manager, handle, &[(1, 5)]);
    cycle(&mut manager);

    assert!(!manager.is_page_resident(handle, 1));
    assert_eq!(manager.stats().checksum_failures, 1);
    let events = events.lock();
    assert!(matches!(&events[..], [StreamingEvent::ReadFailed { reason, .. }] if reason.contains("checksum")));
}

#[test]
fn test_read_timeout_reclaims_slot() {
    let config = StreamingConfig {
        read_timeout_ms: Some(1),
        ..small_config(2)
    };
    let mut manager = StreamingManager::new(config, Box::new(HostMemory::new()), Box::new(BlackHoleDispatcher))
        .expect("Failed to create manager");
    let events = record_events(&mut manager);
    let handle = manager.add(builder("slow", 1, 1).build().expect("build")).expect("add");

    request(&manager, handle, &[(1, 5)]);
    manager.begin_update().expect("begin");
    assert_eq!(manager.num_pending(), 1);
    std::thread::sleep(Duration::from_millis(10));
    manager.end_update().expect("end");

    assert_eq!(manager.num_pending(), 0);
    assert_eq!(manager.page_slot(handle, 1), None);
    assert_eq!(manager.stats().read_timeouts, 1);
    assert_eq!(*events.lock(), vec![StreamingEvent::ReadTimedOut { key: handle.page(1) }]);
}

#[test]
fn test_legacy_reads_capped_per_cycle() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().join("pages.bin");
    let (descriptor, streamable) = builder("legacy", 1, 3).build_parts().expect("build");
    std::fs::write(&path, &streamable).expect("Failed to write pages");

    let config = StreamingConfig {
        max_legacy_requests_per_update: 1,
        ..small_config(4)
    };
    let (mut manager, _) = manager(config);
    let source = FileSource::open(&path).expect("Failed to open pages");
    let handle = manager.add(Resource::new(descriptor, Arc::new(source))).expect("add");

    request(&manager, handle, &[(1, 3), (2, 2), (3, 1)]);
    cycle(&mut manager);
    assert_eq!(manager.stats().legacy_reads_issued, 1);
    assert_eq!((1..=3).filter(|&page| manager.is_page_resident(handle, page)).count(), 1);

    for _ in 0..2 {
        request(&manager, handle, &[(1, 3), (2, 2), (3, 1)]);
        cycle(&mut manager);
    }
    assert!((1..=3).all(|page| manager.is_page_resident(handle, page)));
    assert_eq!(manager.stats().legacy_reads_issued, 3);
}

#[test]
fn test_admission_refused_at_ceiling() {
    let config = StreamingConfig {
        num_initial_root_pages: 4,
        max_root_pages: 4,
        root_allocation_granularity: 4,
        ..small_config(2)
    };
    let (mut manager, _) = manager(config);
    let events = record_events(&mut manager);
    let existing = manager.add(builder("existing", 2, 1).build().expect("build")).expect("add");
    request(&manager, existing, &[(2, 1)]);
    cycle(&mut manager);

    let refused = manager.add(builder("too-big", 3, 1).build().expect("build"));
    assert!(matches!(refused, Err(StreamingError::CapacityExceeded { .. })));
    assert_eq!(manager.stats().admissions_refused, 1);
    assert!(matches!(
        events.lock().as_slice(),
        [StreamingEvent::AdmissionRefused { name, ceiling: 4, .. }] if name == "too-big"
    ));

    cycle(&mut manager);
    assert!(manager.is_page_resident(existing, 2));
    assert!(manager.add(builder("fits", 2, 1).build().expect("build")).is_ok());
}

#[test]
fn test_pack_backed_resource_streams_into_slot() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().join("mesh.pack");
    let mut builder = builder("packed", 1, 3);
    builder.with_checksums(true);
    let (descriptor, streamable) = builder.build_parts().expect("build");
    write_pack(&path, &descriptor, &streamable).expect("Failed to write pack");

    let config = small_config(4);
    let page_size = config.streaming_page_size as u64;
    let (mut manager, memory) = manager(config);
    let handle = manager.add(open_pack(&path).expect("Failed to open pack")).expect("add");

    request(&manager, handle, &[(3, 2)]);
    cycle(&mut manager);

    let slot = manager.page_slot(handle, 3).expect("page registered");
    assert!(manager.is_page_resident(handle, 3));
    assert_eq!(
        memory.read(PersistentBuffer::PageData, slot as u64 * page_size, PAGE_BYTES),
        Some(payload(3))
    );
    assert_eq!(manager.take_modified_resources(), vec![(handle, 1)]);
}

#[cfg(feature = "native")]
#[test]
fn test_tokio_dispatcher_completes_reads() {
    let dispatcher = TokioDispatcher::new(2).expect("Failed to start runtime");
    let mut manager = StreamingManager::new(small_config(4), Box::new(HostMemory::new()), Box::new(dispatcher))
        .expect("Failed to create manager");
    let handle = manager.add(builder("async", 1, 2).build().expect("build")).expect("add");

    request(&manager, handle, &[(1, 1), (2, 1)]);
    for _ in 0..500 {
        cycle(&mut manager);
        if manager.is_page_resident(handle, 1) && manager.is_page_resident(handle, 2) {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(manager.is_page_resident(handle, 1));
    assert!(manager.is_page_resident(handle, 2));
}
