pub mod config;
pub mod error;
pub mod memory;
pub mod streaming;

pub use config::StreamingConfig;
pub use error::{StreamingError, StreamingResult};
pub use memory::{CommandStream, DeviceMemory, HostMemory, PersistentBuffer, WgpuMemory};
pub use streaming::{
    open_pack, write_pack, FeedbackQueue, FeedbackRecord, FixupSpec, HierarchyNode, PageKey, PageSource, PageSpec,
    ReadDispatcher, Resource, ResourceBuilder, ResourceDescriptor, ResourceHandle, StreamingEvent, StreamingManager,
    StreamingStats,
};
#[cfg(feature = "native")]
pub use streaming::TokioDispatcher;

/// Initialize logging for binaries and examples
pub fn init_logging() {
    // Ignore the error when a logger is already installed
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}
