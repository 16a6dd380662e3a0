/// Resource Registry
///
/// Owns registered resources, keyed by the first root slot they occupy.
/// Each root slot keeps a generation counter that survives removal; a
/// handle only resolves while its generation matches the slot's owner, so
/// handles computed before a slot is reused fail closed.

use crate::error::StreamingResult;
use crate::streaming::error::{invalid_resource, stale_handle};
use crate::streaming::resource::ResourcePlacement;
use crate::streaming::{CapacityManager, Resource, ResourceHandle, RootAdmission, VirtualPageTable};

/// Binding of one root slot to the resource that owns it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RootPageInfo {
    pub owner: Option<ResourceHandle>,
    /// Which of the owner's root pages lives in this slot
    pub page_index: u32,
}

#[derive(Debug, Default)]
pub struct ResourceRegistry {
    /// Indexed by root slot
    root_pages: Vec<RootPageInfo>,

    /// Last generation handed out per root slot
    generations: Vec<u8>,

    /// Indexed by the first root slot of each resource
    resources: Vec<Option<Resource>>,

    /// Resources whose root pages still need installing
    pending_adds: Vec<ResourceHandle>,

    num_resources: u32,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource, allocating its root, hierarchy and virtual page ranges
    pub fn add(
        &mut self,
        mut resource: Resource,
        capacity: &mut CapacityManager,
        page_table: &mut VirtualPageTable,
    ) -> StreamingResult<ResourceHandle> {
        if resource.handle.is_some() {
            return Err(invalid_resource(resource.name(), "resource is already registered"));
        }

        let num_root_pages = resource.num_root_pages();
        let admission = capacity.admit(resource.name(), num_root_pages, resource.num_hierarchy_nodes())?;
        page_table.consolidate();
        let virtual_page_start = page_table.allocate(resource.num_streaming_pages());

        let slot = admission.root_page_start;
        let end = (slot + num_root_pages) as usize;
        if self.root_pages.len() < end {
            self.root_pages.resize(end, RootPageInfo::default());
            self.generations.resize(end, 0);
            self.resources.resize_with(end, || None);
        }

        let generation = self.generations[slot as usize].wrapping_add(1);
        self.generations[slot as usize] = generation;
        let handle = ResourceHandle::new(slot, generation);

        for page_index in 0..num_root_pages {
            self.root_pages[(slot + page_index) as usize] = RootPageInfo {
                owner: Some(handle),
                page_index,
            };
        }

        resource.handle = Some(handle);
        resource.placement = ResourcePlacement {
            root_page_start: admission.root_page_start,
            hierarchy_offset: admission.hierarchy_offset,
            virtual_page_start,
        };
        resource.num_resident_units = 0;

        log::info!(
            "[ResourceRegistry] Added '{}' as {:?}: {} root pages at slot {}, {} streaming pages at virtual page {}",
            resource.name(),
            handle,
            num_root_pages,
            slot,
            resource.num_streaming_pages(),
            virtual_page_start
        );

        self.resources[slot as usize] = Some(resource);
        self.pending_adds.push(handle);
        self.num_resources += 1;
        Ok(handle)
    }

    /// Unregister a resource and release its ranges. Its streaming pages must
    /// already be unregistered from their slots.
    pub fn remove(
        &mut self,
        handle: ResourceHandle,
        capacity: &mut CapacityManager,
        page_table: &mut VirtualPageTable,
    ) -> StreamingResult<Resource> {
        if self.resolve(handle).is_none() {
            return Err(stale_handle(handle));
        }
        let slot = handle.slot() as usize;
        let mut resource = self.resources[slot].take().ok_or_else(|| stale_handle(handle))?;

        let num_root_pages = resource.num_root_pages();
        for info in &mut self.root_pages[slot..slot + num_root_pages as usize] {
            *info = RootPageInfo::default();
        }

        let placement = resource.placement;
        capacity.release(
            RootAdmission {
                root_page_start: placement.root_page_start,
                hierarchy_offset: placement.hierarchy_offset,
            },
            num_root_pages,
            resource.num_hierarchy_nodes(),
        );
        page_table.free(placement.virtual_page_start, resource.num_streaming_pages());

        self.pending_adds.retain(|pending| *pending != handle);
        self.num_resources -= 1;

        log::info!("[ResourceRegistry] Removed '{}' ({:?})", resource.name(), handle);

        resource.handle = None;
        resource.placement = ResourcePlacement::default();
        resource.num_resident_units = 0;
        Ok(resource)
    }

    /// Look up a live resource; stale handles resolve to `None`
    pub fn resolve(&self, handle: ResourceHandle) -> Option<&Resource> {
        let slot = handle.slot() as usize;
        if self.root_pages.get(slot)?.owner != Some(handle) {
            return None;
        }
        self.resources.get(slot)?.as_ref()
    }

    pub fn resolve_mut(&mut self, handle: ResourceHandle) -> Option<&mut Resource> {
        let slot = handle.slot() as usize;
        if self.root_pages.get(slot)?.owner != Some(handle) {
            return None;
        }
        self.resources.get_mut(slot)?.as_mut()
    }

    pub fn root_page_info(&self, root_slot: u32) -> Option<&RootPageInfo> {
        self.root_pages.get(root_slot as usize)
    }

    /// Hand off the resources awaiting root page installation
    pub fn take_pending_adds(&mut self) -> Vec<ResourceHandle> {
        std::mem::take(&mut self.pending_adds)
    }

    pub fn pending_adds(&self) -> &[ResourceHandle] {
        &self.pending_adds
    }

    pub fn num_resources(&self) -> u32 {
        self.num_resources
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter().flatten()
    }
}
