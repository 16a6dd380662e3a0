/// Resource Builder
///
/// Assembles a resource from page payloads: lays out root bytes and
/// streamable bytes, packs dependency lists and fixup chunks, and
/// optionally stamps per-page checksums.

use std::sync::Arc;

use crate::error::StreamingResult;
use crate::streaming::error::invalid_resource;
use crate::streaming::{
    FixupChunk, HierarchyFixup, HierarchyNode, MemorySource, PageStreamingState, Resource,
    ResourceDescriptor,
};

/// A hierarchy patch to embed in a page
#[derive(Debug, Clone, Default)]
pub struct FixupSpec {
    /// Page the child reference will point at
    pub page_index: u32,
    pub node_index: u32,
    pub child_index: u32,
    pub part_start: u32,
    /// Pages that must be resident before the patch is applied
    pub dependencies: Vec<u32>,
}

impl FixupSpec {
    pub fn new(page_index: u32, node_index: u32, child_index: u32) -> Self {
        Self {
            page_index,
            node_index,
            child_index,
            ..Self::default()
        }
    }

    pub fn with_part_start(mut self, part_start: u32) -> Self {
        self.part_start = part_start;
        self
    }

    pub fn with_dependencies(mut self, dependencies: &[u32]) -> Self {
        self.dependencies = dependencies.to_vec();
        self
    }
}

/// One page's content
#[derive(Debug, Clone, Default)]
pub struct PageSpec {
    pub payload: Vec<u8>,
    pub num_units: u32,
    pub fixups: Vec<FixupSpec>,
    pub dependencies: Vec<u32>,
}

impl PageSpec {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }

    pub fn with_units(mut self, num_units: u32) -> Self {
        self.num_units = num_units;
        self
    }

    pub fn with_fixup(mut self, fixup: FixupSpec) -> Self {
        self.fixups.push(fixup);
        self
    }

    pub fn with_dependencies(mut self, dependencies: &[u32]) -> Self {
        self.dependencies = dependencies.to_vec();
        self
    }
}

/// Builder for `Resource` and its streamable bytes
#[derive(Debug, Default)]
pub struct ResourceBuilder {
    name: String,
    root_pages: Vec<PageSpec>,
    streaming_pages: Vec<PageSpec>,
    hierarchy_nodes: Vec<HierarchyNode>,
    checksums: bool,
    root_added_after_streaming: bool,
}

impl ResourceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Add a root page. Root pages must all be added before any streaming page.
    pub fn root_page(&mut self, page: PageSpec) -> u32 {
        if !self.streaming_pages.is_empty() {
            self.root_added_after_streaming = true;
        }
        self.root_pages.push(page);
        self.root_pages.len() as u32 - 1
    }

    pub fn streaming_page(&mut self, page: PageSpec) -> u32 {
        self.streaming_pages.push(page);
        (self.root_pages.len() + self.streaming_pages.len()) as u32 - 1
    }

    pub fn hierarchy_nodes(&mut self, nodes: Vec<HierarchyNode>) -> &mut Self {
        self.hierarchy_nodes = nodes;
        self
    }

    pub fn with_checksums(&mut self, enabled: bool) -> &mut Self {
        self.checksums = enabled;
        self
    }

    /// Produce the descriptor and the streamable bytes it addresses
    pub fn build_parts(&self) -> StreamingResult<(ResourceDescriptor, Vec<u8>)> {
        if self.root_added_after_streaming {
            return Err(invalid_resource(&self.name, "root pages must precede streaming pages"));
        }

        let mut descriptor = ResourceDescriptor {
            name: self.name.clone(),
            num_root_pages: self.root_pages.len() as u32,
            hierarchy_nodes: self.hierarchy_nodes.clone(),
            ..ResourceDescriptor::default()
        };
        let mut streamable = Vec::new();

        for (index, page) in self.root_pages.iter().chain(&self.streaming_pages).enumerate() {
            let dependencies_start = descriptor.page_dependencies.len() as u32;
            descriptor.page_dependencies.extend_from_slice(&page.dependencies);

            let mut fixups = Vec::with_capacity(page.fixups.len());
            for fixup in &page.fixups {
                let dependency_start = descriptor.page_dependencies.len() as u32;
                descriptor.page_dependencies.extend_from_slice(&fixup.dependencies);
                fixups.push(HierarchyFixup::new(
                    fixup.page_index,
                    fixup.node_index,
                    fixup.child_index,
                    fixup.part_start,
                    dependency_start,
                    fixup.dependencies.len() as u32,
                ));
            }

            let bulk = FixupChunk::new(page.num_units, fixups).encode(&page.payload);
            let target = if index < self.root_pages.len() {
                &mut descriptor.root_data
            } else {
                &mut streamable
            };

            descriptor.page_streaming_states.push(PageStreamingState {
                bulk_offset: target.len() as u64,
                bulk_size: bulk.len() as u32,
                page_size: page.payload.len() as u32,
                dependencies_start,
                dependencies_num: page.dependencies.len() as u32,
                checksum: self.checksums.then(|| crc32fast::hash(&bulk)),
            });
            target.extend_from_slice(&bulk);
        }

        Ok((descriptor, streamable))
    }

    /// Build a resource backed by an in-memory source
    pub fn build(&self) -> StreamingResult<Resource> {
        let (descriptor, streamable) = self.build_parts()?;
        Ok(Resource::new(descriptor, Arc::new(MemorySource::new(streamable))))
    }
}
