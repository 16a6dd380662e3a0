/// Span Allocator
///
/// Hands out contiguous index ranges from a growable id space. Frees are
/// deferred until `consolidate`, which merges adjacent free spans and trims
/// the reported extent when the tail becomes free.

/// A contiguous run of indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: u32,
    count: u32,
}

impl Span {
    fn end(&self) -> u32 {
        self.start + self.count
    }
}

/// First-fit allocator over a dense index space
#[derive(Debug, Default)]
pub struct SpanAllocator {
    /// Free spans, sorted by start after consolidation
    free_spans: Vec<Span>,

    /// Spans released since the last consolidation
    pending_free: Vec<Span>,

    /// One past the highest index ever handed out (after trimming)
    current_max_size: u32,

    /// Indices currently allocated
    num_allocated: u32,
}

impl SpanAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `count` contiguous indices and return the first
    pub fn allocate(&mut self, count: u32) -> u32 {
        if count == 0 {
            return 0;
        }

        self.num_allocated += count;

        if let Some(position) = self.free_spans.iter().position(|span| span.count >= count) {
            let span = &mut self.free_spans[position];
            let start = span.start;
            if span.count == count {
                self.free_spans.remove(position);
            } else {
                span.start += count;
                span.count -= count;
            }
            return start;
        }

        let start = self.current_max_size;
        self.current_max_size += count;
        start
    }

    /// Release a range; it becomes reusable after `consolidate`
    pub fn free(&mut self, start: u32, count: u32) {
        if count == 0 {
            return;
        }
        debug_assert!(start + count <= self.current_max_size, "freeing span beyond allocator extent");
        debug_assert!(self.num_allocated >= count, "freeing more than was allocated");

        self.num_allocated -= count;
        self.pending_free.push(Span { start, count });
    }

    /// Merge pending frees into the free list and trim the tail
    pub fn consolidate(&mut self) {
        if self.pending_free.is_empty() {
            return;
        }

        self.free_spans.append(&mut self.pending_free);
        self.free_spans.sort_unstable_by_key(|span| span.start);

        // Merge adjacent spans
        let mut merged: Vec<Span> = Vec::with_capacity(self.free_spans.len());
        for span in self.free_spans.drain(..) {
            match merged.last_mut() {
                Some(last) if last.end() == span.start => last.count += span.count,
                _ => merged.push(span),
            }
        }
        self.free_spans = merged;

        if let Some(last) = self.free_spans.last().copied() {
            if last.end() == self.current_max_size {
                self.current_max_size = last.start;
                self.free_spans.pop();
            }
        }
    }

    /// Extent of the id space; only exact after `consolidate`
    pub fn max_size(&self) -> u32 {
        self.current_max_size
    }

    pub fn num_allocated(&self) -> u32 {
        self.num_allocated
    }

    /// Number of free spans (fragmentation indicator)
    pub fn num_free_spans(&self) -> usize {
        self.free_spans.len() + self.pending_free.len()
    }
}
