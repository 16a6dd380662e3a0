/// Page Installer
///
/// Writes completed pages into their slots and keeps the hierarchy's child
/// references in step with what is resident. A fixup is applied only once
/// its target page and every page it depends on are installed; otherwise it
/// stays deferred and is retried at the end of each later batch. Evicting a
/// page reverts every applied fixup that refers to it.
///
/// Patch writes are coalesced per batch, so a child reference that is
/// reverted and re-patched in the same batch is written once.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

use crate::error::StreamingResult;
use crate::memory::{CommandStream, PersistentBuffer};
use crate::streaming::stream_pipeline::ReadyPage;
use crate::streaming::{
    CapacityManager, FixupChunk, HierarchyFixup, HierarchyNode, PageKey, RegisteredPages, Resource, ResourceHandle,
    ResourceRegistry, StreamingErrorContext, CHILD_REFERENCE_NOT_RESIDENT, CHILD_REFERENCE_PART_BITS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixupState {
    /// Not yet attempted
    New,
    /// Waiting on a page that is not installed
    Deferred,
    Applied,
}

#[derive(Debug)]
struct InstalledPage {
    /// Global slot in the page data buffer
    global_slot: u32,
    num_units: u32,
    fixups: Vec<HierarchyFixup>,
    states: Vec<FixupState>,
}

/// Installer counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InstallerStats {
    pub pages_installed: u64,
    pub pages_discarded: u64,
    pub pages_uninstalled: u64,
    pub fixups_applied: u64,
    pub fixups_deferred: u64,
    pub fixups_reverted: u64,
    pub malformed_pages: u64,
}

#[derive(Debug)]
pub struct PageInstaller {
    installed: FxHashMap<PageKey, InstalledPage>,

    /// Occupant of each streaming slot
    resident_slots: Vec<Option<PageKey>>,

    /// Page -> installed pages with applied fixups referring to it
    dependents: FxHashMap<PageKey, FxHashSet<PageKey>>,

    /// Installed pages holding fixups that are not applied
    deferred_owners: FxHashSet<PageKey>,

    /// Hierarchy byte offset -> child reference, flushed once per batch
    pending_patches: FxHashMap<u64, u32>,

    modified_resources: FxHashMap<ResourceHandle, u32>,
    stats: InstallerStats,
}

impl PageInstaller {
    pub fn new(num_streaming_slots: u32) -> Self {
        Self {
            installed: FxHashMap::default(),
            resident_slots: vec![None; num_streaming_slots as usize],
            dependents: FxHashMap::default(),
            deferred_owners: FxHashSet::default(),
            pending_patches: FxHashMap::default(),
            modified_resources: FxHashMap::default(),
            stats: InstallerStats::default(),
        }
    }

    pub fn is_installed(&self, key: PageKey) -> bool {
        self.installed.contains_key(&key)
    }

    /// Page whose bytes currently sit in a streaming slot
    pub fn slot_occupant(&self, slot: u32) -> Option<PageKey> {
        self.resident_slots.get(slot as usize).copied().flatten()
    }

    pub fn num_deferred_owners(&self) -> usize {
        self.deferred_owners.len()
    }

    pub fn stats(&self) -> InstallerStats {
        self.stats
    }

    /// Resources whose resident unit count changed, with the new count
    pub fn take_modified_resources(&mut self) -> FxHashMap<ResourceHandle, u32> {
        std::mem::take(&mut self.modified_resources)
    }

    /// Upload a newly admitted resource: root payloads, hierarchy nodes, root fixups
    pub fn install_root_pages(
        &mut self,
        handle: ResourceHandle,
        registry: &mut ResourceRegistry,
        capacity: &CapacityManager,
        stream: &mut CommandStream,
    ) -> StreamingResult<()> {
        let Some(resource) = registry.resolve(handle) else {
            return Ok(());
        };

        let hierarchy_start = capacity.hierarchy_byte_offset(resource.placement.hierarchy_offset);
        stream.write(
            PersistentBuffer::Hierarchy,
            hierarchy_start,
            bytemuck::cast_slice::<HierarchyNode, u8>(&resource.descriptor.hierarchy_nodes),
        );

        let mut units = 0;
        for page_index in 0..resource.num_root_pages() {
            let context = format!("root page {}", page_index);
            let bytes = resource.root_page_bytes(page_index).streaming_context(&context)?;
            let page_size = resource.page_state(page_index).streaming_context(&context)?.page_size;
            let (chunk, payload) = FixupChunk::parse(bytes, page_size)?;

            let global_slot = capacity.root_global_slot(resource.placement.root_page_start + page_index);
            stream.write(PersistentBuffer::PageData, capacity.page_offset(global_slot), payload);

            let key = handle.page(page_index);
            units += chunk.num_units();
            self.insert_installed(key, global_slot, chunk);
        }

        self.apply_deferred(registry, capacity);
        self.flush_patches(stream);
        self.add_units(registry, handle, units as i64);

        log::debug!(
            "[PageInstaller] Installed {} root pages of {:?}",
            registry.resolve(handle).map(|r| r.num_root_pages()).unwrap_or(0),
            handle
        );
        Ok(())
    }

    /// Install a batch of completed reads. Reads whose slot has since been
    /// handed to another page, or whose resource was removed, are discarded.
    pub fn install_batch(
        &mut self,
        batch: Vec<ReadyPage>,
        registry: &mut ResourceRegistry,
        registered: &RegisteredPages,
        capacity: &CapacityManager,
        stream: &mut CommandStream,
    ) -> u32 {
        // Later completions for the same slot supersede earlier ones
        let mut last_for_slot: FxHashMap<u32, usize> = FxHashMap::default();
        for (position, page) in batch.iter().enumerate() {
            last_for_slot.insert(page.slot, position);
        }

        let mut installed = 0;
        for (position, page) in batch.into_iter().enumerate() {
            if last_for_slot.get(&page.slot) != Some(&position) || registered.key(page.slot) != Some(page.key) {
                log::trace!("[PageInstaller] Slot {} no longer expects {:?}", page.slot, page.key);
                self.stats.pages_discarded += 1;
                continue;
            }
            if self.install_page(page, registry, capacity, stream) {
                installed += 1;
            }
        }

        self.apply_deferred(registry, capacity);
        self.flush_patches(stream);
        installed
    }

    fn install_page(
        &mut self,
        page: ReadyPage,
        registry: &mut ResourceRegistry,
        capacity: &CapacityManager,
        stream: &mut CommandStream,
    ) -> bool {
        let Some(resource) = registry.resolve(page.key.resource) else {
            log::trace!("[PageInstaller] Discarding {:?}: resource was removed", page.key);
            self.stats.pages_discarded += 1;
            return false;
        };
        let Some(state) = resource.page_state(page.key.page_index) else {
            self.stats.pages_discarded += 1;
            return false;
        };

        let parsed = FixupChunk::parse(&page.data, state.page_size)
            .and_then(|(chunk, payload)| resource.validate_fixups(&chunk).map(|_| (chunk, payload)));
        let (chunk, payload) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                log::error!("[PageInstaller] Discarding {:?} from '{}': {}", page.key, resource.name(), e);
                debug_assert!(false, "malformed page data for {:?}: {}", page.key, e);
                self.stats.malformed_pages += 1;
                return false;
            }
        };

        // The slot's previous occupant leaves before the new bytes land
        if let Some(previous) = self.slot_occupant(page.slot) {
            self.uninstall(previous, registry, capacity);
        }
        if self.is_installed(page.key) {
            self.uninstall(page.key, registry, capacity);
        }

        stream.write(PersistentBuffer::PageData, capacity.page_offset(page.slot), payload);

        let units = chunk.num_units();
        self.insert_installed(page.key, page.slot, chunk);
        if let Some(occupant) = self.resident_slots.get_mut(page.slot as usize) {
            *occupant = Some(page.key);
        }
        self.add_units(registry, page.key.resource, units as i64);
        self.stats.pages_installed += 1;
        true
    }

    /// Drop whatever occupies `slot`, reverting its fixups
    pub fn release_slot(
        &mut self,
        slot: u32,
        registry: &mut ResourceRegistry,
        capacity: &CapacityManager,
        stream: &mut CommandStream,
    ) {
        if let Some(previous) = self.slot_occupant(slot) {
            self.uninstall(previous, registry, capacity);
            self.flush_patches(stream);
        }
    }

    /// Remove an installed page and revert every applied fixup that refers to it
    fn uninstall(&mut self, key: PageKey, registry: &mut ResourceRegistry, capacity: &CapacityManager) {
        let Some(page) = self.installed.remove(&key) else {
            return;
        };
        if let Some(occupant) = self.resident_slots.get_mut(page.global_slot as usize) {
            if *occupant == Some(key) {
                *occupant = None;
            }
        }
        self.deferred_owners.remove(&key);
        self.stats.pages_uninstalled += 1;

        if let Some(resource) = registry.resolve(key.resource) {
            for (fixup, state) in page.fixups.iter().zip(&page.states) {
                if *state == FixupState::Applied {
                    self.queue_patch(resource, capacity, fixup, CHILD_REFERENCE_NOT_RESIDENT);
                    self.stats.fixups_reverted += 1;
                }
            }

            for owner in self.dependents.remove(&key).unwrap_or_default() {
                let Some(owner_page) = self.installed.get_mut(&owner) else {
                    continue;
                };
                let mut reverted = Vec::new();
                for (fixup, state) in owner_page.fixups.iter().zip(owner_page.states.iter_mut()) {
                    if *state == FixupState::Applied && fixup_refers_to(resource, fixup, key.page_index) {
                        *state = FixupState::Deferred;
                        reverted.push(*fixup);
                    }
                }
                if !reverted.is_empty() {
                    self.deferred_owners.insert(owner);
                }
                for fixup in &reverted {
                    self.queue_patch(resource, capacity, fixup, CHILD_REFERENCE_NOT_RESIDENT);
                    self.stats.fixups_reverted += 1;
                }
            }
        }

        self.add_units(registry, key.resource, -(page.num_units as i64));
    }

    /// Drop all state for a resource being removed. Its hierarchy range is
    /// released with it, so nothing is patched.
    pub fn forget_resource(&mut self, handle: ResourceHandle) {
        self.installed.retain(|key, _| key.resource != handle);
        for occupant in &mut self.resident_slots {
            if occupant.map(|key| key.resource) == Some(handle) {
                *occupant = None;
            }
        }
        self.dependents.retain(|key, _| key.resource != handle);
        self.deferred_owners.retain(|key| key.resource != handle);
        self.modified_resources.remove(&handle);
    }

    fn insert_installed(&mut self, key: PageKey, global_slot: u32, chunk: FixupChunk) {
        let has_fixups = !chunk.fixups.is_empty();
        self.installed.insert(
            key,
            InstalledPage {
                global_slot,
                num_units: chunk.num_units(),
                states: vec![FixupState::New; chunk.fixups.len()],
                fixups: chunk.fixups,
            },
        );
        if has_fixups {
            self.deferred_owners.insert(key);
        }
    }

    /// Try every unapplied fixup. Applying a fixup installs no pages, so one pass is enough.
    fn apply_deferred(&mut self, registry: &ResourceRegistry, capacity: &CapacityManager) {
        let owners: Vec<PageKey> = self.deferred_owners.iter().copied().collect();
        for owner in owners {
            let Some(resource) = registry.resolve(owner.resource) else {
                continue;
            };
            let Some(page) = self.installed.get(&owner) else {
                self.deferred_owners.remove(&owner);
                continue;
            };

            let mut applied = Vec::new();
            let mut newly_deferred = 0;
            for (index, (fixup, state)) in page.fixups.iter().zip(&page.states).enumerate() {
                if *state == FixupState::Applied {
                    continue;
                }
                match self.fixup_target_slot(resource, owner.resource, fixup) {
                    Some(target_slot) => applied.push((index, target_slot)),
                    None if *state == FixupState::New => newly_deferred += 1,
                    None => {}
                }
            }

            let mut remaining = 0;
            if let Some(page) = self.installed.get_mut(&owner) {
                for state in page.states.iter_mut() {
                    if *state == FixupState::New {
                        *state = FixupState::Deferred;
                    }
                }
                for &(index, _) in &applied {
                    page.states[index] = FixupState::Applied;
                }
                remaining = page.states.iter().filter(|state| **state != FixupState::Applied).count();
            }

            let fixups: Vec<HierarchyFixup> = self
                .installed
                .get(&owner)
                .map(|page| applied.iter().map(|&(index, _)| page.fixups[index]).collect())
                .unwrap_or_default();
            for (fixup, &(_, target_slot)) in fixups.iter().zip(&applied) {
                let reference = (target_slot << CHILD_REFERENCE_PART_BITS) | fixup.part_start;
                self.queue_patch(resource, capacity, fixup, reference);
                self.record_dependents(resource, owner, fixup);
            }

            self.stats.fixups_applied += applied.len() as u64;
            self.stats.fixups_deferred += newly_deferred;
            if newly_deferred > 0 {
                log::trace!("[PageInstaller] {:?} has {} deferred fixups", owner, newly_deferred);
            }
            if remaining == 0 {
                self.deferred_owners.remove(&owner);
            }
        }
    }

    /// Global slot the fixup should point at, if it can be applied now
    fn fixup_target_slot(&self, resource: &Resource, handle: ResourceHandle, fixup: &HierarchyFixup) -> Option<u32> {
        let dependencies = resource.dependency_range(fixup.dependency_start(), fixup.dependency_num())?;
        if !dependencies
            .iter()
            .all(|&dependency| self.is_installed(handle.page(dependency)))
        {
            return None;
        }
        self.installed
            .get(&handle.page(fixup.page_index))
            .map(|target| target.global_slot)
    }

    fn record_dependents(&mut self, resource: &Resource, owner: PageKey, fixup: &HierarchyFixup) {
        let handle = owner.resource;
        let dependencies = resource
            .dependency_range(fixup.dependency_start(), fixup.dependency_num())
            .unwrap_or(&[]);
        for &page_index in dependencies.iter().chain(std::iter::once(&fixup.page_index)) {
            if page_index != owner.page_index {
                self.dependents.entry(handle.page(page_index)).or_default().insert(owner);
            }
        }
    }

    fn queue_patch(&mut self, resource: &Resource, capacity: &CapacityManager, fixup: &HierarchyFixup, value: u32) {
        let offset = capacity.hierarchy_byte_offset(resource.placement.hierarchy_offset)
            + HierarchyNode::child_reference_offset(fixup.node_index(), fixup.child_index());
        self.pending_patches.insert(offset, value);
    }

    fn flush_patches(&mut self, stream: &mut CommandStream) {
        let mut patches: Vec<(u64, u32)> = self.pending_patches.drain().collect();
        patches.sort_unstable_by_key(|&(offset, _)| offset);
        for (offset, value) in patches {
            stream.write_u32(PersistentBuffer::Hierarchy, offset, value);
        }
    }

    fn add_units(&mut self, registry: &mut ResourceRegistry, handle: ResourceHandle, delta: i64) {
        if delta == 0 {
            return;
        }
        if let Some(resource) = registry.resolve_mut(handle) {
            let units = (resource.num_resident_units as i64 + delta).max(0) as u32;
            resource.num_resident_units = units;
            self.modified_resources.insert(handle, units);
        }
    }
}

fn fixup_refers_to(resource: &Resource, fixup: &HierarchyFixup, page_index: u32) -> bool {
    fixup.page_index == page_index
        || resource
            .dependency_range(fixup.dependency_start(), fixup.dependency_num())
            .map(|dependencies| dependencies.contains(&page_index))
            .unwrap_or(false)
}
