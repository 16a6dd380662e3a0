use crate::memory::SpanAllocator;
use crate::streaming::INVALID_INDEX;

/// Virtual page table entry - one per streaming page of every registered resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirtualPage {
    /// Highest priority requested this cycle, zero when no request is outstanding
    pub priority: u32,

    /// Registered slot backing this page, `INVALID_INDEX` if none
    pub registered_slot: u32,
}

impl Default for VirtualPage {
    fn default() -> Self {
        Self {
            priority: 0,
            registered_slot: INVALID_INDEX,
        }
    }
}

impl VirtualPage {
    pub fn is_registered(&self) -> bool {
        self.registered_slot != INVALID_INDEX
    }
}

/// Dense table of virtual pages addressed by a global id
#[derive(Debug, Default)]
pub struct VirtualPageTable {
    pages: Vec<VirtualPage>,
    allocator: SpanAllocator,
}

impl VirtualPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `count` contiguous ids and return the first
    pub fn allocate(&mut self, count: u32) -> u32 {
        let start = self.allocator.allocate(count);
        let end = (start + count) as usize;
        if self.pages.len() < end {
            self.pages.resize(end, VirtualPage::default());
        }
        start
    }

    /// Release ids; the entries must no longer be registered
    pub fn free(&mut self, start: u32, count: u32) {
        let range = start as usize..(start + count) as usize;
        for page in &mut self.pages[range] {
            debug_assert!(!page.is_registered(), "freeing a virtual page that is still registered");
            *page = VirtualPage::default();
        }
        self.allocator.free(start, count);
    }

    /// Merge freed ranges and drop table entries past the new extent
    pub fn consolidate(&mut self) {
        self.allocator.consolidate();
        self.pages.truncate(self.allocator.max_size() as usize);
    }

    pub fn get(&self, virtual_page: u32) -> Option<&VirtualPage> {
        self.pages.get(virtual_page as usize)
    }

    pub fn get_mut(&mut self, virtual_page: u32) -> Option<&mut VirtualPage> {
        self.pages.get_mut(virtual_page as usize)
    }

    pub fn registered_slot(&self, virtual_page: u32) -> Option<u32> {
        self.get(virtual_page)
            .filter(|page| page.is_registered())
            .map(|page| page.registered_slot)
    }

    pub fn num_allocated(&self) -> u32 {
        self.allocator.num_allocated()
    }

    /// Extent of the id space; exact only after `consolidate`
    pub fn max_size(&self) -> u32 {
        self.allocator.max_size()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_grows_table() {
        let mut table = VirtualPageTable::new();
        let a = table.allocate(10);
        let b = table.allocate(5);
        assert_eq!((a, b), (0, 10));
        assert_eq!(table.len(), 15);
        assert_eq!(table.get(14), Some(&VirtualPage::default()));
        assert!(table.get(15).is_none());
    }

    #[test]
    fn test_free_and_consolidate_restores_extent() {
        let mut table = VirtualPageTable::new();
        let a = table.allocate(4);
        let b = table.allocate(4);
        table.get_mut(b).expect("entry").priority = 9;

        table.free(b, 4);
        assert_eq!(table.num_allocated(), 4);
        assert_eq!(table.get(b).map(|page| page.priority), Some(0));

        table.consolidate();
        assert_eq!(table.max_size(), 4);
        assert_eq!(table.len(), 4);

        table.free(a, 4);
        table.consolidate();
        assert_eq!(table.max_size(), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_registered_slot_lookup() {
        let mut table = VirtualPageTable::new();
        let start = table.allocate(2);
        assert_eq!(table.registered_slot(start), None);
        table.get_mut(start).expect("entry").registered_slot = 3;
        assert_eq!(table.registered_slot(start), Some(3));
    }
}
