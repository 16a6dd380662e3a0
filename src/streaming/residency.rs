/// Registered Pages
///
/// One entry per physical streaming slot. A registered page counts the
/// registered pages that depend on it; only slots with a zero count may be
/// evicted, so parents outlive their children.

use crate::streaming::{PageKey, Resource, ResourceHandle, ResourceRegistry, VirtualPageTable, INVALID_INDEX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredPage {
    pub key: Option<PageKey>,
    pub virtual_page: u32,
    /// Registered pages depending on this one
    pub ref_count: u32,
}

impl Default for RegisteredPage {
    fn default() -> Self {
        Self {
            key: None,
            virtual_page: INVALID_INDEX,
            ref_count: 0,
        }
    }
}

#[derive(Debug)]
pub struct RegisteredPages {
    pages: Vec<RegisteredPage>,
}

impl RegisteredPages {
    pub fn new(num_slots: u32) -> Self {
        Self {
            pages: vec![RegisteredPage::default(); num_slots as usize],
        }
    }

    pub fn num_slots(&self) -> u32 {
        self.pages.len() as u32
    }

    pub fn get(&self, slot: u32) -> Option<&RegisteredPage> {
        self.pages.get(slot as usize)
    }

    pub fn key(&self, slot: u32) -> Option<PageKey> {
        self.get(slot).and_then(|page| page.key)
    }

    pub fn ref_count(&self, slot: u32) -> u32 {
        self.get(slot).map(|page| page.ref_count).unwrap_or(0)
    }

    pub fn is_evictable(&self, slot: u32) -> bool {
        self.ref_count(slot) == 0
    }

    pub fn num_registered(&self) -> u32 {
        self.pages.iter().filter(|page| page.key.is_some()).count() as u32
    }

    /// True when every streaming dependency of `page_index` is registered
    pub fn dependencies_registered(resource: &Resource, page_index: u32, page_table: &VirtualPageTable) -> bool {
        resource
            .page_dependencies(page_index)
            .iter()
            .filter_map(|&dependency| resource.virtual_page(dependency))
            .all(|virtual_page| page_table.registered_slot(virtual_page).is_some())
    }

    /// Bind `slot` to a page. The slot must be empty and the page's
    /// streaming dependencies registered.
    pub fn register(&mut self, slot: u32, resource: &Resource, page_index: u32, page_table: &mut VirtualPageTable) {
        let Some(handle) = resource.handle() else {
            return;
        };
        let Some(virtual_page) = resource.virtual_page(page_index) else {
            return;
        };
        debug_assert!(self.pages[slot as usize].key.is_none(), "registering into an occupied slot");

        if let Some(entry) = page_table.get_mut(virtual_page) {
            debug_assert!(!entry.is_registered(), "virtual page registered twice");
            entry.registered_slot = slot;
        }

        for &dependency in resource.page_dependencies(page_index) {
            let dependency_slot = resource
                .virtual_page(dependency)
                .and_then(|virtual_page| page_table.registered_slot(virtual_page));
            if let Some(dependency_slot) = dependency_slot {
                self.pages[dependency_slot as usize].ref_count += 1;
            }
        }

        self.pages[slot as usize] = RegisteredPage {
            key: Some(PageKey::new(handle, page_index)),
            virtual_page,
            ref_count: 0,
        };
    }

    /// Return `slot` to the empty state. Returns the key it held.
    pub fn unregister(&mut self, slot: u32, registry: &ResourceRegistry, page_table: &mut VirtualPageTable) -> Option<PageKey> {
        let page = *self.pages.get(slot as usize)?;
        let key = page.key?;

        if let Some(entry) = page_table.get_mut(page.virtual_page) {
            if entry.registered_slot == slot {
                entry.registered_slot = INVALID_INDEX;
            }
        }

        if let Some(resource) = registry.resolve(key.resource) {
            for &dependency in resource.page_dependencies(key.page_index) {
                let dependency_slot = resource
                    .virtual_page(dependency)
                    .and_then(|virtual_page| page_table.registered_slot(virtual_page));
                if let Some(dependency_slot) = dependency_slot {
                    let dependency_page = &mut self.pages[dependency_slot as usize];
                    debug_assert!(dependency_page.ref_count > 0, "dependency reference count underflow");
                    dependency_page.ref_count = dependency_page.ref_count.saturating_sub(1);
                }
            }
        }

        self.pages[slot as usize] = RegisteredPage::default();
        Some(key)
    }

    /// Unregister every slot held by `handle`. Returns the freed slots.
    pub fn unregister_resource(
        &mut self,
        handle: ResourceHandle,
        registry: &ResourceRegistry,
        page_table: &mut VirtualPageTable,
    ) -> Vec<u32> {
        let slots: Vec<u32> = self
            .pages
            .iter()
            .enumerate()
            .filter(|(_, page)| page.key.map(|key| key.resource) == Some(handle))
            .map(|(slot, _)| slot as u32)
            .collect();

        for &slot in &slots {
            self.unregister(slot, registry, page_table);
        }
        slots
    }
}
