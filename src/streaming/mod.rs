// Virtualized page streaming
// Keeps a sparse set of resource pages resident in a fixed pool of device slots

pub mod builder;
pub mod capacity;
pub mod dispatcher;
pub mod error;
pub mod feedback;
pub mod installer;
pub mod lru;
pub mod manager;
pub mod pack;
pub mod page;
pub mod page_source;
pub mod page_table;
pub mod registry;
pub mod residency;
pub mod resource;
pub mod selector;
pub mod stream_pipeline;

pub use builder::{FixupSpec, PageSpec, ResourceBuilder};
pub use capacity::{CapacityCounters, CapacityManager, RootAdmission};
pub use dispatcher::{InlineDispatcher, ReadCompletion, ReadDispatcher, ReadRequest};
#[cfg(feature = "native")]
pub use dispatcher::TokioDispatcher;
pub use error::StreamingErrorContext;
pub use feedback::{FeedbackBufferSizer, FeedbackQueue, FeedbackRecord, IngestStats, PageRequest, RequestSets};
pub use installer::{InstallerStats, PageInstaller};
pub use lru::LruOrder;
pub use manager::{StreamingEvent, StreamingManager, StreamingStats};
pub use pack::{open_pack, write_pack};
pub use page::{
    FixupChunk, FixupChunkHeader, HierarchyFixup, HierarchyNode, PageKey, PageStreamingState,
};
pub use page_source::{FileSource, MemorySource, MmapSource, PageSource};
pub use page_table::{VirtualPage, VirtualPageTable};
pub use registry::{ResourceRegistry, RootPageInfo};
pub use residency::{RegisteredPage, RegisteredPages};
pub use resource::{Resource, ResourceDescriptor, ResourceHandle};
pub use selector::{reset_priorities, select_pages, SelectedPage};
pub use stream_pipeline::{FailedPage, IoPipeline, PendingPage, PipelineStats, ReadFailure, ReadyPage};

/// Highest priority a feedback record may carry; zero means "no request"
pub const MAX_FEEDBACK_PRIORITY: u32 = 0x7FFF_FFFF;

/// Handle layout: low bits hold the first root slot, high bits the generation
pub const HANDLE_SLOT_BITS: u32 = 24;
pub const HANDLE_GENERATION_BITS: u32 = 32 - HANDLE_SLOT_BITS;
pub const HANDLE_SLOT_MASK: u32 = (1 << HANDLE_SLOT_BITS) - 1;

/// Children per hierarchy node
pub const HIERARCHY_FANOUT: usize = 4;
pub const HIERARCHY_CHILD_BITS: u32 = 2;

/// Child reference layout: slot in the high bits, part start in the low bits
pub const CHILD_REFERENCE_PART_BITS: u32 = 8;
pub const CHILD_REFERENCE_NOT_RESIDENT: u32 = u32::MAX;

/// Bits used for the dependency count inside a packed fixup
pub const FIXUP_DEPENDENCY_NUM_BITS: u32 = 8;

/// Tag at the start of every page's fixup chunk
pub const FIXUP_MAGIC: u16 = 0x5E7A;

/// Sentinel for "no slot" / "no LRU position"
pub const INVALID_INDEX: u32 = u32::MAX;
