/// Streaming Manager
///
/// An explicitly constructed context that owns every piece of streaming
/// state and drives one cycle per frame:
///
/// `begin_update` admits new resources, ingests feedback, selects pages and
/// issues reads. `end_update` collects completed reads, installs them and
/// submits the recorded device commands.
///
/// All state is mutated on the caller's thread. The only shared structure
/// is the feedback queue, handed off with a single swap per cycle.

use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;

use crate::config::StreamingConfig;
use crate::error::{StreamingError, StreamingResult};
use crate::memory::{CommandStream, DeviceMemory, HostMemory};
use crate::streaming::error::stale_handle;
use crate::streaming::feedback::ingest;
use crate::streaming::stream_pipeline::{FailedPage, ReadFailure, ReadyPage};
use crate::streaming::{
    select_pages, CapacityCounters, CapacityManager, FeedbackBufferSizer, FeedbackQueue, FeedbackRecord,
    InlineDispatcher, IoPipeline, LruOrder, PageInstaller, PageKey, ReadDispatcher, RegisteredPages,
    RequestSets, Resource, ResourceHandle, ResourceRegistry, SelectedPage, VirtualPageTable,
};

/// Conditions reported to the diagnostics callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamingEvent {
    /// A resource was refused because the root region would pass its ceiling
    AdmissionRefused {
        name: String,
        requested: u64,
        ceiling: u64,
    },
    ReadFailed {
        key: PageKey,
        reason: String,
    },
    ReadTimedOut {
        key: PageKey,
    },
}

/// Cumulative counters, plus gauges sampled at the end of the last cycle
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct StreamingStats {
    pub cycles: u64,

    pub feedback_records: u64,
    pub feedback_dropped: u64,
    pub stale_feedback: u64,
    pub invalid_feedback: u64,
    pub dependency_requests: u64,

    pub pages_selected: u64,
    pub pages_waiting_on_dependencies: u64,
    pub reads_issued: u64,
    pub legacy_reads_issued: u64,
    pub evictions: u64,

    pub pages_installed: u64,
    pub pages_discarded: u64,
    pub read_failures: u64,
    pub read_timeouts: u64,
    pub checksum_failures: u64,

    pub fixups_applied: u64,
    pub fixups_deferred: u64,
    pub fixups_reverted: u64,

    pub admissions_refused: u64,

    pub pending_pages: u32,
    pub registered_pages: u32,
    pub num_resources: u32,
    pub feedback_bound: u32,
}

type DiagnosticsCallback = Box<dyn FnMut(&StreamingEvent) + Send>;

pub struct StreamingManager {
    config: StreamingConfig,
    device: Box<dyn DeviceMemory>,
    stream: CommandStream,

    registry: ResourceRegistry,
    page_table: VirtualPageTable,
    capacity: CapacityManager,
    registered: RegisteredPages,
    lru: LruOrder,
    pipeline: IoPipeline,
    installer: PageInstaller,

    feedback: FeedbackQueue,
    feedback_records: Vec<FeedbackRecord>,
    feedback_sizer: FeedbackBufferSizer,
    requests: RequestSets,

    update_active: bool,
    diagnostics: Option<DiagnosticsCallback>,
    stats: StreamingStats,
}

impl StreamingManager {
    pub fn new(
        config: StreamingConfig,
        mut device: Box<dyn DeviceMemory>,
        dispatcher: Box<dyn ReadDispatcher>,
    ) -> StreamingResult<Self> {
        config.validate()?;

        let mut capacity = CapacityManager::new(&config);
        let mut stream = CommandStream::new();
        capacity.resize_if_needed(true, &mut stream);
        device.submit(stream.take())?;

        log::info!(
            "[StreamingManager] {} streaming slots of {} bytes, {} in flight, root ceiling {} pages",
            config.max_streaming_pages,
            config.streaming_page_size,
            config.max_pending_pages,
            config.max_root_pages
        );

        Ok(Self {
            registered: RegisteredPages::new(config.max_streaming_pages),
            lru: LruOrder::new(config.max_streaming_pages),
            pipeline: IoPipeline::new(&config, dispatcher),
            installer: PageInstaller::new(config.max_streaming_pages),
            feedback_sizer: FeedbackBufferSizer::new(config.feedback_buffer_min_size, config.feedback_buffer_max_size),
            feedback: FeedbackQueue::new(),
            feedback_records: Vec::new(),
            requests: RequestSets::default(),
            registry: ResourceRegistry::new(),
            page_table: VirtualPageTable::new(),
            capacity,
            device,
            stream,
            config,
            update_active: false,
            diagnostics: None,
            stats: StreamingStats::default(),
        })
    }

    /// Manager over host memory with inline reads. The returned `HostMemory`
    /// shares storage with the manager's device.
    pub fn with_host_memory(config: StreamingConfig) -> StreamingResult<(Self, HostMemory)> {
        let memory = HostMemory::new();
        let manager = Self::new(config, Box::new(memory.clone()), Box::new(InlineDispatcher))?;
        Ok((manager, memory))
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Register a resource. Its root pages are installed by the next `begin_update`.
    pub fn add(&mut self, resource: Resource) -> StreamingResult<ResourceHandle> {
        if self.update_active {
            return Err(StreamingError::UpdateAlreadyActive);
        }
        resource.validate(self.config.streaming_page_size, self.config.root_page_size)?;

        let staging_capacity = self.pipeline.staging_capacity();
        let oversized = (resource.num_root_pages()..resource.num_pages())
            .filter_map(|page_index| resource.page_state(page_index).map(|state| (page_index, state.bulk_size)))
            .find(|&(_, bulk_size)| bulk_size >= staging_capacity);
        if let Some((page_index, bulk_size)) = oversized {
            return Err(crate::streaming::error::invalid_resource(
                resource.name(),
                format!(
                    "page {} needs {} staging bytes, the staging ring holds {}",
                    page_index, bulk_size, staging_capacity
                ),
            ));
        }

        let name = resource.name().to_string();
        match self.registry.add(resource, &mut self.capacity, &mut self.page_table) {
            Ok(handle) => Ok(handle),
            Err(StreamingError::CapacityExceeded {
                what,
                requested,
                ceiling,
            }) => {
                self.stats.admissions_refused += 1;
                self.emit(StreamingEvent::AdmissionRefused {
                    name,
                    requested,
                    ceiling,
                });
                Err(StreamingError::CapacityExceeded {
                    what,
                    requested,
                    ceiling,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Unregister a resource and hand it back. Reads still in flight for it
    /// are discarded when they complete.
    pub fn remove(&mut self, handle: ResourceHandle) -> StreamingResult<Resource> {
        if self.update_active {
            return Err(StreamingError::UpdateAlreadyActive);
        }
        if self.registry.resolve(handle).is_none() {
            return Err(stale_handle(handle));
        }

        let freed = self
            .registered
            .unregister_resource(handle, &self.registry, &mut self.page_table);
        self.installer.forget_resource(handle);
        log::debug!("[StreamingManager] Released {} slots held by {:?}", freed.len(), handle);

        self.registry.remove(handle, &mut self.capacity, &mut self.page_table)
    }

    /// Ingest feedback, select pages and issue their reads
    pub fn begin_update(&mut self) -> StreamingResult<()> {
        if self.update_active {
            return Err(StreamingError::UpdateAlreadyActive);
        }
        self.update_active = true;
        self.stats.cycles += 1;

        self.lru.begin_cycle();
        self.pipeline.begin_cycle();
        self.page_table.consolidate();

        self.admit_pending_resources();

        // Feedback
        self.feedback.swap(&mut self.feedback_records);
        let observed = self.feedback_records.len();
        let bound = self.feedback_sizer.bound() as usize;
        if observed > bound {
            self.stats.feedback_dropped += (observed - bound) as u64;
            self.feedback_records.truncate(bound);
        }
        self.feedback_sizer.update(observed.min(u32::MAX as usize) as u32);

        self.requests.clear();
        let ingested = ingest(
            &self.feedback_records,
            &self.registry,
            &mut self.page_table,
            &mut self.requests,
        );
        self.stats.feedback_records += ingested.records as u64;
        self.stats.stale_feedback += ingested.stale_records as u64;
        self.stats.invalid_feedback += ingested.invalid_records as u64;
        self.stats.dependency_requests += ingested.dependency_requests as u64;

        // Selection
        let budget = self
            .config
            .max_pending_pages
            .saturating_sub(self.pipeline.num_pending()) as usize;
        let selected = select_pages(
            &self.requests,
            &self.registry,
            &mut self.page_table,
            &mut self.lru,
            budget,
        );
        self.stats.pages_selected += selected.len() as u64;

        let issued = self.issue_reads(&selected);
        self.lru.compact();

        log::debug!(
            "[StreamingManager] begin_update: {} records, {} new requests, {} selected, {} issued, {} in flight",
            ingested.records,
            self.requests.new_requests.len(),
            selected.len(),
            issued,
            self.pipeline.num_pending()
        );
        Ok(())
    }

    /// Install completed reads and submit the cycle's device commands
    pub fn end_update(&mut self) -> StreamingResult<()> {
        if !self.update_active {
            return Err(StreamingError::UpdateNotActive);
        }
        self.update_active = false;

        self.pipeline.poll(Instant::now());
        let (ready, failed) = self
            .pipeline
            .pop_ready(self.config.max_page_installs_per_update as usize);

        for failure in failed {
            self.handle_failed_read(failure);
        }

        let batch = self.verify_checksums(ready);
        let installed = self.installer.install_batch(
            batch,
            &mut self.registry,
            &self.registered,
            &self.capacity,
            &mut self.stream,
        );

        let commands = self.stream.len();
        let bytes = self.stream.bytes_written();
        self.device.submit(self.stream.take())?;

        self.refresh_stats();
        log::debug!(
            "[StreamingManager] end_update: {} installed, {} commands ({} bytes) submitted",
            installed,
            commands,
            bytes
        );
        Ok(())
    }

    /// Resize for new commitments and upload root pages of new resources
    fn admit_pending_resources(&mut self) {
        // Shrinking would drop root slots that pending resources are about to use
        let allow_shrink = self.registry.pending_adds().is_empty();
        self.capacity.resize_if_needed(allow_shrink, &mut self.stream);

        for handle in self.registry.take_pending_adds() {
            if let Err(e) = self
                .installer
                .install_root_pages(handle, &mut self.registry, &self.capacity, &mut self.stream)
            {
                log::error!("[StreamingManager] Failed to install root pages of {:?}: {}", handle, e);
            }
        }
    }

    /// Assign slots to selected pages and issue their reads, highest priority first
    fn issue_reads(&mut self, selected: &[SelectedPage]) -> u32 {
        let mut issued = 0;

        for page in selected {
            let Some(resource) = self.registry.resolve(page.key.resource) else {
                continue;
            };
            let page_index = page.key.page_index;

            // A dependency issued earlier this cycle may already cover it
            if self.page_table.registered_slot(page.virtual_page).is_some() {
                continue;
            }
            if !RegisteredPages::dependencies_registered(resource, page_index, &self.page_table) {
                self.stats.pages_waiting_on_dependencies += 1;
                continue;
            }
            if !self.pipeline.can_issue(resource.source.as_ref()) {
                log::trace!("[StreamingManager] Legacy read cap reached, deferring {:?}", page.key);
                continue;
            }
            let Some(state) = resource.page_state(page_index).copied() else {
                continue;
            };

            // Never evict the pages this one is about to depend on
            let dependency_slots: Vec<u32> = resource
                .page_dependencies(page_index)
                .iter()
                .filter_map(|&dependency| resource.virtual_page(dependency))
                .filter_map(|virtual_page| self.page_table.registered_slot(virtual_page))
                .collect();
            let registered = &self.registered;
            let Some(slot) = self
                .lru
                .find_evictable(|slot| registered.is_evictable(slot) && !dependency_slots.contains(&slot))
            else {
                log::trace!("[StreamingManager] No evictable slot, deferring remaining requests");
                break;
            };
            let Some(staging) = self.pipeline.reserve_staging(state.bulk_size) else {
                log::trace!("[StreamingManager] Staging ring full, deferring remaining requests");
                break;
            };

            if let Some(evicted) = self.registered.unregister(slot, &self.registry, &mut self.page_table) {
                log::trace!("[StreamingManager] Evicting {:?} from slot {}", evicted, slot);
                self.stats.evictions += 1;
            }

            self.pipeline
                .issue(page.key, slot, &state, resource.source.clone(), staging);
            self.registered
                .register(slot, resource, page_index, &mut self.page_table);
            self.lru.touch(slot);
            issued += 1;
        }

        issued
    }

    /// Return a failed page's slot to the unregistered state
    fn handle_failed_read(&mut self, failure: FailedPage) {
        if self.registered.key(failure.slot) == Some(failure.key) {
            self.registered
                .unregister(failure.slot, &self.registry, &mut self.page_table);
            self.installer
                .release_slot(failure.slot, &mut self.registry, &self.capacity, &mut self.stream);
        }

        let event = match failure.failure {
            ReadFailure::TimedOut => {
                self.stats.read_timeouts += 1;
                StreamingEvent::ReadTimedOut { key: failure.key }
            }
            ReadFailure::ChecksumMismatch { .. } => {
                self.stats.checksum_failures += 1;
                log::warn!("[StreamingManager] {:?}: {}", failure.key, failure.failure);
                StreamingEvent::ReadFailed {
                    key: failure.key,
                    reason: failure.failure.to_string(),
                }
            }
            ReadFailure::Io(ref reason) => {
                self.stats.read_failures += 1;
                StreamingEvent::ReadFailed {
                    key: failure.key,
                    reason: reason.clone(),
                }
            }
        };
        self.emit(event);
    }

    /// Split off pages whose bytes do not match their recorded checksum
    fn verify_checksums(&mut self, ready: Vec<ReadyPage>) -> Vec<ReadyPage> {
        let mismatches: Vec<Option<u32>> = ready
            .par_iter()
            .map(|page| {
                let expected = page.checksum?;
                let actual = crc32fast::hash(&page.data);
                (actual != expected).then_some(actual)
            })
            .collect();

        let mut batch = Vec::with_capacity(ready.len());
        for (page, mismatch) in ready.into_iter().zip(mismatches) {
            match (mismatch, page.checksum) {
                (Some(actual), Some(expected)) => self.handle_failed_read(FailedPage {
                    key: page.key,
                    slot: page.slot,
                    failure: ReadFailure::ChecksumMismatch { expected, actual },
                }),
                _ => batch.push(page),
            }
        }
        batch
    }

    fn refresh_stats(&mut self) {
        let pipeline = self.pipeline.stats();
        let installer = self.installer.stats();

        self.stats.reads_issued = pipeline.reads_issued;
        self.stats.legacy_reads_issued = pipeline.legacy_reads_issued;
        self.stats.pages_installed = installer.pages_installed;
        self.stats.pages_discarded = installer.pages_discarded + installer.malformed_pages;
        self.stats.fixups_applied = installer.fixups_applied;
        self.stats.fixups_deferred = installer.fixups_deferred;
        self.stats.fixups_reverted = installer.fixups_reverted;

        self.stats.pending_pages = self.pipeline.num_pending();
        self.stats.registered_pages = self.registered.num_registered();
        self.stats.num_resources = self.registry.num_resources();
        self.stats.feedback_bound = self.feedback_sizer.bound();
    }

    fn emit(&mut self, event: StreamingEvent) {
        if let Some(callback) = self.diagnostics.as_mut() {
            callback(&event);
        }
    }

    /// True for root pages of live resources and for streaming pages that are
    /// registered and installed in their slot
    pub fn is_page_resident(&self, handle: ResourceHandle, page_index: u32) -> bool {
        let Some(resource) = self.registry.resolve(handle) else {
            return false;
        };
        if resource.is_root_page(page_index) {
            return true;
        }
        self.page_slot(handle, page_index)
            .map(|slot| self.installer.slot_occupant(slot) == Some(handle.page(page_index)))
            .unwrap_or(false)
    }

    /// Streaming slot registered to a page, whether or not its read has completed
    pub fn page_slot(&self, handle: ResourceHandle, page_index: u32) -> Option<u32> {
        let virtual_page = self.registry.resolve(handle)?.virtual_page(page_index)?;
        self.page_table.registered_slot(virtual_page)
    }

    /// Page registered to a streaming slot
    pub fn slot_page(&self, slot: u32) -> Option<PageKey> {
        self.registered.key(slot)
    }

    /// Streaming slots from least to most recently used
    pub fn lru_order(&self) -> Vec<u32> {
        self.lru.iter().collect()
    }

    pub fn resource(&self, handle: ResourceHandle) -> Option<&Resource> {
        self.registry.resolve(handle)
    }

    /// Producer handle for feedback records
    pub fn feedback_queue(&self) -> FeedbackQueue {
        self.feedback.clone()
    }

    pub fn stats(&self) -> StreamingStats {
        self.stats
    }

    pub fn num_pending(&self) -> u32 {
        self.pipeline.num_pending()
    }

    pub fn is_update_active(&self) -> bool {
        self.update_active
    }

    /// Allocation counters after consolidating the allocators
    pub fn capacity_counters(&mut self) -> CapacityCounters {
        self.capacity.consolidate();
        self.page_table.consolidate();
        CapacityCounters {
            num_resources: self.registry.num_resources(),
            root_pages_allocated: self.capacity.root_pages_allocated(),
            root_pages_extent: self.capacity.root_pages_extent(),
            hierarchy_nodes_allocated: self.capacity.hierarchy_nodes_allocated(),
            hierarchy_nodes_extent: self.capacity.hierarchy_nodes_extent(),
            virtual_pages_allocated: self.page_table.num_allocated(),
            virtual_pages_extent: self.page_table.max_size(),
        }
    }

    pub fn set_diagnostics(&mut self, callback: impl FnMut(&StreamingEvent) + Send + 'static) {
        self.diagnostics = Some(Box::new(callback));
    }

    /// Resources whose resident unit count changed since the last call
    pub fn take_modified_resources(&mut self) -> Vec<(ResourceHandle, u32)> {
        let mut modified: Vec<(ResourceHandle, u32)> = self.installer.take_modified_resources().into_iter().collect();
        modified.sort_unstable_by_key(|&(handle, _)| handle);
        modified
    }
}
