//! Streaming manager configuration
//!
//! All tunables live in one serde-backed struct that can be loaded from TOML.
//! Unspecified keys fall back to `StreamingConfig::default()`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{StreamingError, StreamingResult};

/// Streaming pool size used for the default slot count (MB)
const DEFAULT_STREAMING_POOL_MB: u64 = 512;

/// Root pool ceiling used for the default root page limit (MB)
const DEFAULT_MAX_ROOT_POOL_MB: u64 = 2048;

/// Root region grows in steps of this many bytes
const ROOT_ALLOCATION_GRANULARITY_BYTES: u64 = 16 << 20;

/// Configuration for `StreamingManager`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Number of physical streaming page slots
    pub max_streaming_pages: u32,

    /// Device bytes reserved per streaming slot
    pub streaming_page_size: u32,

    /// Device bytes reserved per root slot
    pub root_page_size: u32,

    /// Root slots allocated before any rounding kicks in
    pub num_initial_root_pages: u32,

    /// Hard ceiling on root slots
    pub max_root_pages: u32,

    /// Root region is rounded up to a multiple of this many slots
    pub root_allocation_granularity: u32,

    /// Maximum reads in flight at once
    pub max_pending_pages: u32,

    /// Maximum pages installed per `end_update`
    pub max_page_installs_per_update: u32,

    /// Maximum synchronous fallback reads issued per `begin_update`
    pub max_legacy_requests_per_update: u32,

    /// Staging ring size bounding in-flight bytes
    pub staging_buffer_size: u32,

    /// Simulated ingestion limit, unlimited when unset
    pub bandwidth_limit_mb_per_sec: Option<f32>,

    /// Reads outstanding longer than this are reclaimed as failed
    pub read_timeout_ms: Option<u64>,

    /// Worker threads for the async read dispatcher
    pub io_worker_threads: usize,

    /// Lower bound on feedback records consumed per cycle
    pub feedback_buffer_min_size: u32,

    /// Upper bound on feedback records consumed per cycle
    pub feedback_buffer_max_size: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        let streaming_page_size: u32 = 128 * 1024;
        let root_page_size: u32 = 32 * 1024;
        Self {
            max_streaming_pages: ((DEFAULT_STREAMING_POOL_MB << 20) / streaming_page_size as u64) as u32,
            streaming_page_size,
            root_page_size,
            num_initial_root_pages: 2048,
            max_root_pages: ((DEFAULT_MAX_ROOT_POOL_MB << 20) / root_page_size as u64) as u32,
            root_allocation_granularity: (ROOT_ALLOCATION_GRANULARITY_BYTES / root_page_size as u64) as u32,
            max_pending_pages: 128,
            max_page_installs_per_update: 128,
            max_legacy_requests_per_update: 32,
            staging_buffer_size: 32 << 20,
            bandwidth_limit_mb_per_sec: None,
            read_timeout_ms: None,
            io_worker_threads: num_cpus::get().clamp(1, 8),
            feedback_buffer_min_size: 4 * 1024,
            feedback_buffer_max_size: 1024 * 1024,
        }
    }
}

impl StreamingConfig {
    /// Parse a TOML document, filling unspecified keys with defaults
    pub fn from_toml_str(contents: &str) -> StreamingResult<Self> {
        let config: StreamingConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> StreamingResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        log::info!("[StreamingConfig] Loading configuration from {}", path.display());
        Self::from_toml_str(&contents)
    }

    /// Reject values the manager cannot operate with
    pub fn validate(&self) -> StreamingResult<()> {
        let fail = |reason: String| Err(StreamingError::Config { reason });

        if self.max_streaming_pages == 0 {
            return fail("max_streaming_pages must be non-zero".to_string());
        }
        if self.max_streaming_pages >= 1 << crate::streaming::HANDLE_SLOT_BITS {
            return fail(format!(
                "max_streaming_pages {} exceeds the addressable slot range",
                self.max_streaming_pages
            ));
        }
        if self.max_pending_pages == 0 || self.max_pending_pages > self.max_streaming_pages {
            return fail(format!(
                "max_pending_pages {} must be in 1..={}",
                self.max_pending_pages, self.max_streaming_pages
            ));
        }
        if self.streaming_page_size == 0 || self.streaming_page_size % 4 != 0 {
            return fail("streaming_page_size must be a non-zero multiple of 4".to_string());
        }
        if self.root_page_size == 0 || self.root_page_size % 4 != 0 {
            return fail("root_page_size must be a non-zero multiple of 4".to_string());
        }
        if self.max_root_pages == 0 || self.max_root_pages >= 1 << crate::streaming::HANDLE_SLOT_BITS {
            return fail(format!("max_root_pages {} is out of range", self.max_root_pages));
        }
        if self.num_initial_root_pages > self.max_root_pages {
            return fail(format!(
                "num_initial_root_pages {} exceeds max_root_pages {}",
                self.num_initial_root_pages, self.max_root_pages
            ));
        }
        if self.root_allocation_granularity == 0 {
            return fail("root_allocation_granularity must be non-zero".to_string());
        }
        if self.max_page_installs_per_update == 0 {
            return fail("max_page_installs_per_update must be non-zero".to_string());
        }
        if self.staging_buffer_size < 2 {
            return fail("staging_buffer_size is too small".to_string());
        }
        if let Some(limit) = self.bandwidth_limit_mb_per_sec {
            if !(limit > 0.0) {
                return fail(format!("bandwidth_limit_mb_per_sec must be positive, got {}", limit));
            }
        }
        if self.io_worker_threads == 0 {
            return fail("io_worker_threads must be non-zero".to_string());
        }
        if self.feedback_buffer_min_size == 0 || self.feedback_buffer_min_size > self.feedback_buffer_max_size {
            return fail(format!(
                "feedback buffer bounds {}..{} are inconsistent",
                self.feedback_buffer_min_size, self.feedback_buffer_max_size
            ));
        }
        Ok(())
    }

    /// Simulated bandwidth in bytes per second
    pub fn bandwidth_limit_bytes_per_sec(&self) -> Option<f64> {
        self.bandwidth_limit_mb_per_sec.map(|mb| mb as f64 * 1024.0 * 1024.0)
    }

    pub fn read_timeout(&self) -> Option<std::time::Duration> {
        self.read_timeout_ms.map(std::time::Duration::from_millis)
    }
}
