use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::StreamingConfig;
use crate::memory::{BandwidthThrottle, RingAllocator, StagingSpan, ThrottleMetrics};
use crate::streaming::{
    InlineDispatcher, PageKey, PageSource, PageStreamingState, ReadCompletion, ReadDispatcher, ReadRequest,
};

/// Why a pending page was reclaimed without installing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadFailure {
    Io(String),
    TimedOut,
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for ReadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadFailure::Io(e) => write!(f, "read failed: {}", e),
            ReadFailure::TimedOut => write!(f, "read timed out"),
            ReadFailure::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {:#010x}, got {:#010x}", expected, actual)
            }
        }
    }
}

#[derive(Debug)]
enum PendingState {
    InFlight,
    Completed(Vec<u8>),
    Failed(ReadFailure),
}

/// An issued read waiting to be installed
#[derive(Debug)]
pub struct PendingPage {
    pub key: PageKey,
    /// Streaming slot the page will occupy
    pub slot: u32,
    pub checksum: Option<u32>,
    ticket: u64,
    staging: StagingSpan,
    bytes_left_to_stream: u32,
    issued_at: Instant,
    state: PendingState,
}

impl PendingPage {
    pub fn is_ready(&self) -> bool {
        matches!(self.state, PendingState::Completed(_)) && self.bytes_left_to_stream == 0
    }
}

/// Completed read ready for installation
#[derive(Debug)]
pub struct ReadyPage {
    pub key: PageKey,
    pub slot: u32,
    pub checksum: Option<u32>,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct FailedPage {
    pub key: PageKey,
    pub slot: u32,
    pub failure: ReadFailure,
}

/// Pipeline statistics
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct PipelineStats {
    pub reads_issued: u64,
    pub legacy_reads_issued: u64,
    pub bytes_requested: u64,
    pub reads_completed: u64,
    pub reads_failed: u64,
    pub reads_timed_out: u64,
    pub late_completions: u64,
}

/// Issues bulk reads and tracks them until they can be installed.
/// Pages leave the pipeline strictly in issue order.
pub struct IoPipeline {
    pending: VecDeque<PendingPage>,
    staging: RingAllocator,
    throttle: BandwidthThrottle,

    dispatcher: Box<dyn ReadDispatcher>,
    legacy_dispatcher: InlineDispatcher,
    completion_tx: flume::Sender<ReadCompletion>,
    completion_rx: flume::Receiver<ReadCompletion>,

    next_ticket: u64,
    read_timeout: Option<Duration>,
    max_legacy_per_update: u32,
    legacy_issued: u32,

    stats: PipelineStats,
}

impl IoPipeline {
    pub fn new(config: &StreamingConfig, dispatcher: Box<dyn ReadDispatcher>) -> Self {
        let (completion_tx, completion_rx) = flume::unbounded();
        Self {
            pending: VecDeque::with_capacity(config.max_pending_pages as usize),
            staging: RingAllocator::new(config.staging_buffer_size),
            throttle: BandwidthThrottle::new(config.bandwidth_limit_bytes_per_sec()),
            dispatcher,
            legacy_dispatcher: InlineDispatcher,
            completion_tx,
            completion_rx,
            next_ticket: 0,
            read_timeout: config.read_timeout(),
            max_legacy_per_update: config.max_legacy_requests_per_update,
            legacy_issued: 0,
            stats: PipelineStats::default(),
        }
    }

    /// Reset per-cycle issue limits
    pub fn begin_cycle(&mut self) {
        self.legacy_issued = 0;
    }

    pub fn num_pending(&self) -> u32 {
        self.pending.len() as u32
    }

    /// Whether another synchronous fallback read may be issued this cycle
    pub fn can_issue(&self, source: &dyn PageSource) -> bool {
        source.supports_async() || self.legacy_issued < self.max_legacy_per_update
    }

    /// Reserve staging bytes for a read, `None` under back-pressure
    pub fn reserve_staging(&mut self, size: u32) -> Option<StagingSpan> {
        self.staging.try_allocate(size)
    }

    pub fn staging_capacity(&self) -> u32 {
        self.staging.buffer_size()
    }

    /// Issue a read for `key` into `slot` using previously reserved staging
    pub fn issue(
        &mut self,
        key: PageKey,
        slot: u32,
        state: &PageStreamingState,
        source: Arc<dyn PageSource>,
        staging: StagingSpan,
    ) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;

        self.pending.push_back(PendingPage {
            key,
            slot,
            checksum: state.checksum,
            ticket,
            staging,
            bytes_left_to_stream: state.bulk_size,
            issued_at: Instant::now(),
            state: PendingState::InFlight,
        });

        let legacy = !source.supports_async();
        let request = ReadRequest {
            ticket,
            source,
            offset: state.bulk_offset,
            len: state.bulk_size as usize,
        };

        self.stats.reads_issued += 1;
        self.stats.bytes_requested += state.bulk_size as u64;
        if legacy {
            self.legacy_issued += 1;
            self.stats.legacy_reads_issued += 1;
            self.legacy_dispatcher.dispatch(request, self.completion_tx.clone());
        } else {
            self.dispatcher.dispatch(request, self.completion_tx.clone());
        }
    }

    /// Collect completions, reclaim timed-out reads and advance the throttle
    pub fn poll(&mut self, now: Instant) {
        for completion in self.completion_rx.try_iter() {
            let pending = self
                .pending
                .iter_mut()
                .find(|page| page.ticket == completion.ticket && matches!(page.state, PendingState::InFlight));
            let Some(pending) = pending else {
                log::trace!("[IoPipeline] Dropping late completion for ticket {}", completion.ticket);
                self.stats.late_completions += 1;
                continue;
            };

            pending.state = match completion.result {
                Ok(data) => {
                    self.stats.reads_completed += 1;
                    PendingState::Completed(data)
                }
                Err(e) => {
                    self.stats.reads_failed += 1;
                    log::warn!("[IoPipeline] Read for {:?} failed: {}", pending.key, e);
                    PendingState::Failed(ReadFailure::Io(e.to_string()))
                }
            };
        }

        if let Some(timeout) = self.read_timeout {
            for pending in &mut self.pending {
                if matches!(pending.state, PendingState::InFlight)
                    && now.saturating_duration_since(pending.issued_at) > timeout
                {
                    log::warn!(
                        "[IoPipeline] Read for {:?} timed out after {:?}",
                        pending.key,
                        now.saturating_duration_since(pending.issued_at)
                    );
                    self.stats.reads_timed_out += 1;
                    pending.state = PendingState::Failed(ReadFailure::TimedOut);
                }
            }
        }

        // Simulated bandwidth is spent in issue order, completed or not
        self.throttle.begin_cycle_at(now);
        for pending in &mut self.pending {
            if matches!(pending.state, PendingState::Failed(_)) || pending.bytes_left_to_stream == 0 {
                continue;
            }
            if !self.throttle.consume(&mut pending.bytes_left_to_stream) {
                break;
            }
        }
    }

    /// Pop pages from the front of the queue: up to `max_ready` installable
    /// pages plus every failed page reached on the way. Stops at the first
    /// page that is still in flight or throttled.
    pub fn pop_ready(&mut self, max_ready: usize) -> (Vec<ReadyPage>, Vec<FailedPage>) {
        let mut ready = Vec::new();
        let mut failed = Vec::new();

        while let Some(front) = self.pending.front() {
            let is_failed = matches!(front.state, PendingState::Failed(_));
            if !is_failed && (!front.is_ready() || ready.len() >= max_ready) {
                break;
            }
            let Some(page) = self.pending.pop_front() else {
                break;
            };
            self.staging.free(page.staging);

            match page.state {
                PendingState::Completed(data) => ready.push(ReadyPage {
                    key: page.key,
                    slot: page.slot,
                    checksum: page.checksum,
                    data,
                }),
                PendingState::Failed(failure) => failed.push(FailedPage {
                    key: page.key,
                    slot: page.slot,
                    failure,
                }),
                PendingState::InFlight => unreachable!("in-flight pages are never popped"),
            }
        }

        (ready, failed)
    }

    pub fn pending_pages(&self) -> impl Iterator<Item = &PendingPage> {
        self.pending.iter()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn throttle_metrics(&self) -> ThrottleMetrics {
        self.throttle.metrics()
    }
}
