use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::error::StreamingResult;
use crate::streaming::error::malformed_page;
use crate::streaming::{
    ResourceHandle, CHILD_REFERENCE_NOT_RESIDENT, FIXUP_DEPENDENCY_NUM_BITS, FIXUP_MAGIC,
    HIERARCHY_CHILD_BITS, HIERARCHY_FANOUT,
};

/// Identifies one page of one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PageKey {
    pub resource: ResourceHandle,
    pub page_index: u32,
}

impl PageKey {
    pub fn new(resource: ResourceHandle, page_index: u32) -> Self {
        Self { resource, page_index }
    }
}

/// Where a page's bytes live and what it depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PageStreamingState {
    /// Offset of the fixup chunk in the resource's backing bytes
    pub bulk_offset: u64,

    /// Fixup chunk plus payload
    pub bulk_size: u32,

    /// Payload bytes written into the device slot
    pub page_size: u32,

    /// Range into the resource's page dependency list
    pub dependencies_start: u32,
    pub dependencies_num: u32,

    /// CRC-32 of the bulk bytes, verified on completion when present
    pub checksum: Option<u32>,
}

/// Node of a resource's spatial hierarchy as laid out in device memory
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct HierarchyNode {
    /// Bounding sphere per child (center xyz, radius)
    pub lod_bounds: [[f32; 4]; HIERARCHY_FANOUT],

    /// Resident slot and part start per child, or `CHILD_REFERENCE_NOT_RESIDENT`
    pub child_start_reference: [u32; HIERARCHY_FANOUT],

    /// First page and page count per child, packed
    pub page_range: [u32; HIERARCHY_FANOUT],
}

impl HierarchyNode {
    pub const SIZE: u64 = std::mem::size_of::<HierarchyNode>() as u64;

    /// Byte offset of `child_start_reference[0]` inside a node
    const CHILD_REFERENCE_OFFSET: u64 = std::mem::size_of::<[[f32; 4]; HIERARCHY_FANOUT]>() as u64;

    /// Node with every child marked not resident
    pub fn empty() -> Self {
        Self {
            lod_bounds: [[0.0; 4]; HIERARCHY_FANOUT],
            child_start_reference: [CHILD_REFERENCE_NOT_RESIDENT; HIERARCHY_FANOUT],
            page_range: [0; HIERARCHY_FANOUT],
        }
    }

    /// Offset of one child reference relative to the start of the node array
    pub fn child_reference_offset(node_index: u32, child_index: u32) -> u64 {
        node_index as u64 * Self::SIZE + Self::CHILD_REFERENCE_OFFSET + child_index as u64 * 4
    }
}

/// Pointer patch carried in a page's fixup chunk
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Pod, Zeroable, Serialize, Deserialize)]
pub struct HierarchyFixup {
    /// Page whose slot the patched child reference points at
    pub page_index: u32,

    /// node_index << HIERARCHY_CHILD_BITS | child_index
    pub node_and_child: u32,

    /// Part offset inside the target page
    pub part_start: u32,

    /// dependency_start << FIXUP_DEPENDENCY_NUM_BITS | dependency_num
    pub dependencies: u32,
}

impl HierarchyFixup {
    pub fn new(
        page_index: u32,
        node_index: u32,
        child_index: u32,
        part_start: u32,
        dependency_start: u32,
        dependency_num: u32,
    ) -> Self {
        debug_assert!((child_index as usize) < HIERARCHY_FANOUT);
        debug_assert!(dependency_num < 1 << FIXUP_DEPENDENCY_NUM_BITS);
        Self {
            page_index,
            node_and_child: (node_index << HIERARCHY_CHILD_BITS) | child_index,
            part_start,
            dependencies: (dependency_start << FIXUP_DEPENDENCY_NUM_BITS) | dependency_num,
        }
    }

    pub fn node_index(&self) -> u32 {
        self.node_and_child >> HIERARCHY_CHILD_BITS
    }

    pub fn child_index(&self) -> u32 {
        self.node_and_child & ((1 << HIERARCHY_CHILD_BITS) - 1)
    }

    pub fn dependency_start(&self) -> u32 {
        self.dependencies >> FIXUP_DEPENDENCY_NUM_BITS
    }

    pub fn dependency_num(&self) -> u32 {
        self.dependencies & ((1 << FIXUP_DEPENDENCY_NUM_BITS) - 1)
    }
}

/// Header at the start of every page's bulk bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct FixupChunkHeader {
    /// Units this page contributes to the resource's resident count
    pub num_units: u32,
    pub magic: u16,
    pub num_hierarchy_fixups: u16,
}

/// Decoded fixup chunk
#[derive(Debug, Clone, PartialEq)]
pub struct FixupChunk {
    pub header: FixupChunkHeader,
    pub fixups: Vec<HierarchyFixup>,
}

impl FixupChunk {
    pub const HEADER_SIZE: usize = std::mem::size_of::<FixupChunkHeader>();
    pub const FIXUP_SIZE: usize = std::mem::size_of::<HierarchyFixup>();

    pub fn new(num_units: u32, fixups: Vec<HierarchyFixup>) -> Self {
        Self {
            header: FixupChunkHeader {
                num_units,
                magic: FIXUP_MAGIC,
                num_hierarchy_fixups: fixups.len() as u16,
            },
            fixups,
        }
    }

    pub fn num_units(&self) -> u32 {
        self.header.num_units
    }

    /// Bytes occupied by the header and fixups
    pub fn byte_len(&self) -> usize {
        Self::HEADER_SIZE + self.fixups.len() * Self::FIXUP_SIZE
    }

    /// Split bulk page bytes into the chunk and a payload of exactly `page_size` bytes
    pub fn parse(bytes: &[u8], page_size: u32) -> StreamingResult<(FixupChunk, &[u8])> {
        if bytes.len() < Self::HEADER_SIZE {
            return Err(malformed_page(format!(
                "{} bytes is too short for a fixup chunk header",
                bytes.len()
            )));
        }

        let header: FixupChunkHeader = bytemuck::pod_read_unaligned(&bytes[..Self::HEADER_SIZE]);
        if header.magic != FIXUP_MAGIC {
            return Err(malformed_page(format!(
                "bad fixup chunk magic {:#06x}",
                header.magic
            )));
        }

        let fixups_end = Self::HEADER_SIZE + header.num_hierarchy_fixups as usize * Self::FIXUP_SIZE;
        let expected_len = fixups_end + page_size as usize;
        if bytes.len() != expected_len {
            return Err(malformed_page(format!(
                "page holds {} bytes, header declares {}",
                bytes.len(),
                expected_len
            )));
        }

        let fixups = bytes[Self::HEADER_SIZE..fixups_end]
            .chunks_exact(Self::FIXUP_SIZE)
            .map(bytemuck::pod_read_unaligned::<HierarchyFixup>)
            .collect();

        Ok((FixupChunk { header, fixups }, &bytes[fixups_end..]))
    }

    /// Serialize the chunk followed by the payload
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.byte_len() + payload.len());
        bytes.extend_from_slice(bytemuck::bytes_of(&self.header));
        bytes.extend_from_slice(bytemuck::cast_slice(&self.fixups));
        bytes.extend_from_slice(payload);
        bytes
    }
}
