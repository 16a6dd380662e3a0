/// LRU Order
///
/// Least-recently-used ordering of the physical streaming slots. Touching a
/// slot appends it to the end and invalidates its previous entry; `compact`
/// drops invalidated entries so the order is dense again.
///
/// "Referenced this cycle" is tracked with an epoch: each slot stores the
/// epoch it was last touched in and `begin_cycle` advances the current one,
/// so the marker is independent of when compaction runs.

use crate::streaming::INVALID_INDEX;

#[derive(Debug)]
pub struct LruOrder {
    /// Slots from least to most recently used; `INVALID_INDEX` marks moved entries
    order: Vec<u32>,

    /// Position of each slot in `order`
    slot_to_position: Vec<u32>,

    /// Epoch in which each slot was last touched
    touched_epoch: Vec<u64>,

    epoch: u64,

    /// Eviction scan resumes here within a cycle. A slot passed over because
    /// it was pinned stays skipped for the rest of the cycle, even if its
    /// dependents are unregistered later in that cycle; it is reconsidered
    /// after `begin_cycle` or `compact` resets the cursor.
    eviction_cursor: usize,
}

impl LruOrder {
    /// All slots start untouched, in index order
    pub fn new(num_slots: u32) -> Self {
        Self {
            order: (0..num_slots).collect(),
            slot_to_position: (0..num_slots).collect(),
            touched_epoch: vec![0; num_slots as usize],
            epoch: 1,
            eviction_cursor: 0,
        }
    }

    pub fn num_slots(&self) -> u32 {
        self.slot_to_position.len() as u32
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Start a new cycle; nothing is referenced in it yet
    pub fn begin_cycle(&mut self) {
        self.epoch += 1;
        self.eviction_cursor = 0;
    }

    /// Move a slot to the most-recently-used end
    pub fn touch(&mut self, slot: u32) {
        let Some(position) = self.slot_to_position.get(slot as usize).copied() else {
            return;
        };
        if position != INVALID_INDEX {
            self.order[position as usize] = INVALID_INDEX;
        }
        self.slot_to_position[slot as usize] = self.order.len() as u32;
        self.order.push(slot);
        self.touched_epoch[slot as usize] = self.epoch;
    }

    pub fn is_referenced_this_cycle(&self, slot: u32) -> bool {
        self.touched_epoch.get(slot as usize) == Some(&self.epoch)
    }

    /// Next slot from the least-recently-used end that was not referenced this
    /// cycle and passes `is_evictable`. Slots passed over stay skipped until
    /// the next cycle.
    pub fn find_evictable(&mut self, mut is_evictable: impl FnMut(u32) -> bool) -> Option<u32> {
        while self.eviction_cursor < self.order.len() {
            let slot = self.order[self.eviction_cursor];
            self.eviction_cursor += 1;
            if slot == INVALID_INDEX || self.is_referenced_this_cycle(slot) {
                continue;
            }
            if is_evictable(slot) {
                return Some(slot);
            }
        }
        None
    }

    /// Drop invalidated entries, keeping use order
    pub fn compact(&mut self) {
        self.order.retain(|&slot| slot != INVALID_INDEX);
        for (position, &slot) in self.order.iter().enumerate() {
            self.slot_to_position[slot as usize] = position as u32;
        }
        self.eviction_cursor = 0;
        assert_eq!(
            self.order.len(),
            self.slot_to_position.len(),
            "LRU order must hold every slot exactly once after compaction"
        );
    }

    /// Slots from least to most recently used
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.order.iter().copied().filter(|&slot| slot != INVALID_INDEX)
    }

    /// Entries including invalidated ones, the size compaction reclaims
    pub fn raw_len(&self) -> usize {
        self.order.len()
    }
}
