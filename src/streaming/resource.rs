/// Streamable Resources
///
/// A resource is a set of always-resident root pages, a larger set of
/// streamable pages read on demand from a `PageSource`, and the hierarchy
/// nodes whose child references are patched as pages come and go.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::StreamingResult;
use crate::streaming::error::invalid_resource;
use crate::streaming::{
    FixupChunk, HierarchyNode, PageKey, PageSource, PageStreamingState, HANDLE_SLOT_BITS,
    HANDLE_SLOT_MASK,
};

/// Runtime handle: first root slot plus a generation tag for that slot
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceHandle(u32);

impl ResourceHandle {
    pub fn new(slot: u32, generation: u8) -> Self {
        debug_assert!(slot <= HANDLE_SLOT_MASK);
        Self(((generation as u32) << HANDLE_SLOT_BITS) | (slot & HANDLE_SLOT_MASK))
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn slot(&self) -> u32 {
        self.0 & HANDLE_SLOT_MASK
    }

    pub fn generation(&self) -> u8 {
        (self.0 >> HANDLE_SLOT_BITS) as u8
    }

    pub fn page(&self, page_index: u32) -> PageKey {
        PageKey::new(*self, page_index)
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceHandle({}@{})", self.slot(), self.generation())
    }
}

/// Serializable description of a resource, independent of its backing store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub name: String,

    /// Pages `0..num_root_pages` are root pages
    pub num_root_pages: u32,

    /// One entry per page, root pages first
    pub page_streaming_states: Vec<PageStreamingState>,

    /// Flat dependency list indexed by `PageStreamingState` and fixup ranges
    pub page_dependencies: Vec<u32>,

    pub hierarchy_nodes: Vec<HierarchyNode>,

    /// Bulk bytes of the root pages, addressed by their `bulk_offset`
    pub root_data: Vec<u8>,
}

/// Where a registered resource lives inside the shared allocators
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ResourcePlacement {
    pub root_page_start: u32,
    pub hierarchy_offset: u32,
    pub virtual_page_start: u32,
}

/// A registered or registrable resource
pub struct Resource {
    pub descriptor: ResourceDescriptor,
    pub source: Arc<dyn PageSource>,

    pub(crate) handle: Option<ResourceHandle>,
    pub(crate) placement: ResourcePlacement,
    pub(crate) num_resident_units: u32,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.descriptor.name)
            .field("num_pages", &self.num_pages())
            .field("num_root_pages", &self.descriptor.num_root_pages)
            .field("handle", &self.handle)
            .finish()
    }
}

impl Resource {
    pub fn new(descriptor: ResourceDescriptor, source: Arc<dyn PageSource>) -> Self {
        Self {
            descriptor,
            source,
            handle: None,
            placement: ResourcePlacement::default(),
            num_resident_units: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn handle(&self) -> Option<ResourceHandle> {
        self.handle
    }

    pub fn num_pages(&self) -> u32 {
        self.descriptor.page_streaming_states.len() as u32
    }

    pub fn num_root_pages(&self) -> u32 {
        self.descriptor.num_root_pages
    }

    pub fn num_streaming_pages(&self) -> u32 {
        self.num_pages() - self.num_root_pages()
    }

    pub fn num_hierarchy_nodes(&self) -> u32 {
        self.descriptor.hierarchy_nodes.len() as u32
    }

    pub fn is_root_page(&self, page_index: u32) -> bool {
        page_index < self.descriptor.num_root_pages
    }

    pub fn page_state(&self, page_index: u32) -> Option<&PageStreamingState> {
        self.descriptor.page_streaming_states.get(page_index as usize)
    }

    /// Units currently resident, root pages included
    pub fn num_resident_units(&self) -> u32 {
        self.num_resident_units
    }

    /// Dependency pages of `page_index`
    pub fn page_dependencies(&self, page_index: u32) -> &[u32] {
        self.page_state(page_index)
            .and_then(|state| self.dependency_range(state.dependencies_start, state.dependencies_num))
            .unwrap_or(&[])
    }

    pub fn dependency_range(&self, start: u32, num: u32) -> Option<&[u32]> {
        let start = start as usize;
        self.descriptor
            .page_dependencies
            .get(start..start.checked_add(num as usize)?)
    }

    /// Virtual page id of a streaming page
    pub(crate) fn virtual_page(&self, page_index: u32) -> Option<u32> {
        if self.is_root_page(page_index) || page_index >= self.num_pages() {
            return None;
        }
        Some(self.placement.virtual_page_start + page_index - self.num_root_pages())
    }

    /// Bulk bytes of a root page
    pub(crate) fn root_page_bytes(&self, page_index: u32) -> Option<&[u8]> {
        if !self.is_root_page(page_index) {
            return None;
        }
        let state = self.page_state(page_index)?;
        let start = usize::try_from(state.bulk_offset).ok()?;
        self.descriptor
            .root_data
            .get(start..start.checked_add(state.bulk_size as usize)?)
    }

    /// Check structural consistency before registration.
    ///
    /// Streaming page bytes are not read here; those are validated when they arrive.
    pub fn validate(&self, streaming_page_size: u32, root_page_size: u32) -> StreamingResult<()> {
        let name = self.name();
        let num_pages = self.num_pages();

        if self.descriptor.num_root_pages == 0 {
            return Err(invalid_resource(name, "resource has no root pages"));
        }
        if self.descriptor.num_root_pages > num_pages {
            return Err(invalid_resource(
                name,
                format!("{} root pages declared but only {} pages", self.descriptor.num_root_pages, num_pages),
            ));
        }

        for (page_index, state) in self.descriptor.page_streaming_states.iter().enumerate() {
            let page_index = page_index as u32;
            let slot_size = if self.is_root_page(page_index) {
                root_page_size
            } else {
                streaming_page_size
            };
            if state.page_size > slot_size || state.page_size % 4 != 0 {
                return Err(invalid_resource(
                    name,
                    format!(
                        "page {} has size {}, slot size is {} and sizes must be 4-byte aligned",
                        page_index, state.page_size, slot_size
                    ),
                ));
            }
            if (state.bulk_size as usize) < FixupChunk::HEADER_SIZE + state.page_size as usize {
                return Err(invalid_resource(name, format!("page {} bulk size is too small", page_index)));
            }

            let dependencies = self
                .dependency_range(state.dependencies_start, state.dependencies_num)
                .ok_or_else(|| invalid_resource(name, format!("page {} dependency range out of bounds", page_index)))?;
            for &dependency in dependencies {
                if dependency >= num_pages || dependency == page_index {
                    return Err(invalid_resource(
                        name,
                        format!("page {} has invalid dependency {}", page_index, dependency),
                    ));
                }
                if self.is_root_page(page_index) && !self.is_root_page(dependency) {
                    return Err(invalid_resource(
                        name,
                        format!("root page {} depends on streaming page {}", page_index, dependency),
                    ));
                }
            }
        }

        debug_assert!(!self.has_dependency_cycle(), "page dependencies of '{}' contain a cycle", name);

        for page_index in 0..self.descriptor.num_root_pages {
            let state = self.descriptor.page_streaming_states[page_index as usize];
            let bytes = self
                .root_page_bytes(page_index)
                .ok_or_else(|| invalid_resource(name, format!("root page {} lies outside root data", page_index)))?;
            let (chunk, _) = FixupChunk::parse(bytes, state.page_size)
                .map_err(|e| invalid_resource(name, format!("root page {}: {}", page_index, e)))?;
            self.validate_fixups(&chunk)?;
        }

        Ok(())
    }

    /// Check every fixup names a real node, page and dependency range
    pub(crate) fn validate_fixups(&self, chunk: &FixupChunk) -> StreamingResult<()> {
        let name = self.name();
        for fixup in &chunk.fixups {
            if fixup.node_index() >= self.num_hierarchy_nodes() {
                return Err(invalid_resource(
                    name,
                    format!("fixup targets node {} of {}", fixup.node_index(), self.num_hierarchy_nodes()),
                ));
            }
            if fixup.page_index >= self.num_pages() {
                return Err(invalid_resource(name, format!("fixup targets page {}", fixup.page_index)));
            }
            let dependencies = self
                .dependency_range(fixup.dependency_start(), fixup.dependency_num())
                .ok_or_else(|| invalid_resource(name, "fixup dependency range out of bounds"))?;
            if dependencies.iter().any(|&dependency| dependency >= self.num_pages()) {
                return Err(invalid_resource(name, "fixup depends on a page outside the resource"));
            }
        }
        Ok(())
    }

    fn has_dependency_cycle(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let num_pages = self.num_pages() as usize;
        let mut marks = vec![Mark::Unvisited; num_pages];

        for root in 0..num_pages {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            // (page, next dependency position)
            let mut stack = vec![(root as u32, 0usize)];
            marks[root] = Mark::InProgress;

            while let Some((page, position)) = stack.pop() {
                let dependencies = self.page_dependencies(page);
                match dependencies.get(position) {
                    Some(&dependency) => {
                        stack.push((page, position + 1));
                        match marks.get(dependency as usize) {
                            Some(Mark::InProgress) => return true,
                            Some(Mark::Unvisited) => {
                                marks[dependency as usize] = Mark::InProgress;
                                stack.push((dependency, 0));
                            }
                            _ => {}
                        }
                    }
                    None => marks[page as usize] = Mark::Done,
                }
            }
        }
        false
    }
}
