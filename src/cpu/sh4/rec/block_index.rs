//! Block index
//!
//! Maps guest program counters to compiled entry points. Addresses are
//! hashed into a power-of-two number of buckets with
//! `(addr >> shift) & mask`, which keeps sequential code spread over
//! neighbouring buckets. Each bucket is a small vector scanned linearly,
//! capped at `max_bucket_size` entries (least used entry is evicted).
//!
//! In front of every bucket sits one inline cache slot holding the
//! bucket's hottest block, so the common case is a single compare.
//! Slots live in a boxed array that never moves; generated code may read
//! it directly (see [`INLINE_SLOT_ABI_VERSION`]).

use serde::Serialize;

use super::config::BlockIndexConfig;
use super::types::{EntryPoint, SENTINEL_ADDR};

/// Layout version of [`InlineSlot`]. Bump when fields change so backends
/// that read the slot array from generated code can refuse a mismatch.
pub const INLINE_SLOT_ABI_VERSION: u32 = 1;

const NO_BLOCK: u32 = u32::MAX;

/// One inline cache slot.
///
/// Layout (`repr(C)`, 12 bytes): `addr` at +0, `code` at +4, `index` at +8.
/// An empty slot has `addr == SENTINEL_ADDR`, which no block can have.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InlineSlot {
    /// Guest address of the cached block
    pub addr: u32,
    /// Code buffer offset of the cached block
    pub code: u32,
    /// Position of the block inside its bucket
    pub index: u32,
}

impl InlineSlot {
    pub const EMPTY: InlineSlot = InlineSlot {
        addr: SENTINEL_ADDR,
        code: 0,
        index: NO_BLOCK,
    };

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.index == NO_BLOCK
    }
}

/// A cached translation
#[derive(Copy, Clone, Debug)]
pub struct TranslationBlock {
    pub addr: u32,
    pub entry: EntryPoint,
    /// Lookup count, only used to pick eviction victims and the inline slot
    pub use_count: u32,
    /// Insertion order, breaks eviction ties
    seq: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BlockIndexStats {
    pub inline_hits: u64,
    pub scan_hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub overwrites: u64,
    pub evictions: u64,
    pub removals: u64,
    pub invalidated: u64,
    pub resets: u64,
}

impl BlockIndexStats {
    /// Share of hits served by the inline cache
    pub fn inline_efficiency(&self) -> f64 {
        let hits = self.inline_hits + self.scan_hits;
        if hits == 0 {
            0.0
        } else {
            self.inline_hits as f64 / hits as f64
        }
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.inline_hits + self.scan_hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.inline_hits + self.scan_hits) as f64 / total as f64
        }
    }
}

pub struct BlockIndex {
    buckets: Vec<Vec<TranslationBlock>>,
    inline: Box<[InlineSlot]>,
    mask: u32,
    shift: u32,
    max_bucket_size: usize,
    promote_margin: u32,
    next_seq: u64,
    pub stats: BlockIndexStats,
}

impl Default for BlockIndex {
    fn default() -> Self {
        BlockIndex::new(&BlockIndexConfig::default())
    }
}

impl BlockIndex {
    pub fn new(config: &BlockIndexConfig) -> Self {
        let config = config.normalized();
        let buckets = (0..config.bucket_count)
            .map(|_| Vec::with_capacity(config.initial_bucket_capacity))
            .collect();

        BlockIndex {
            buckets,
            inline: vec![InlineSlot::EMPTY; config.bucket_count].into_boxed_slice(),
            mask: (config.bucket_count - 1) as u32,
            shift: config.shift,
            max_bucket_size: config.max_bucket_size,
            promote_margin: config.promote_margin,
            next_seq: 0,
            stats: BlockIndexStats::default(),
        }
    }

    #[inline(always)]
    pub fn bucket_index(&self, addr: u32) -> usize {
        ((addr >> self.shift) & self.mask) as usize
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub fn max_bucket_size(&self) -> usize {
        self.max_bucket_size
    }

    /// Find the entry point for `addr`.
    ///
    /// Hits on the inline slot touch nothing but the slot and the block's
    /// counter. The caller records the address of a miss before compiling.
    #[inline(always)]
    pub fn lookup(&mut self, addr: u32) -> Option<EntryPoint> {
        let idx = self.bucket_index(addr);
        let slot = self.inline[idx];
        if slot.addr == addr {
            if let Some(block) = self.buckets[idx].get_mut(slot.index as usize) {
                block.use_count = block.use_count.saturating_add(1);
                self.stats.inline_hits += 1;
                return Some(block.entry);
            }
        }
        self.lookup_scan(idx, addr)
    }

    #[inline(never)]
    fn lookup_scan(&mut self, idx: usize, addr: u32) -> Option<EntryPoint> {
        let holder = self.holder_use_count(idx);
        let margin = self.promote_margin;

        for (i, block) in self.buckets[idx].iter_mut().enumerate() {
            if block.addr != addr {
                continue;
            }
            block.use_count = block.use_count.saturating_add(1);
            // Hysteresis: only take the slot when clearly hotter than the holder
            if block.use_count > holder.saturating_add(margin) {
                self.inline[idx] = InlineSlot {
                    addr,
                    code: block.entry.offset(),
                    index: i as u32,
                };
            }
            self.stats.scan_hits += 1;
            return Some(block.entry);
        }

        self.stats.misses += 1;
        None
    }

    #[inline]
    fn holder_use_count(&self, idx: usize) -> u32 {
        let slot = self.inline[idx];
        if slot.is_empty() {
            return 0;
        }
        self.buckets[idx]
            .get(slot.index as usize)
            .map(|b| b.use_count)
            .unwrap_or(0)
    }

    /// Register a compiled block.
    ///
    /// An existing entry for `addr` is overwritten in place with its count
    /// reset. A full bucket evicts its least used entry (oldest first on
    /// ties). The bucket's inline slot is always emptied so the new block
    /// has to earn it.
    pub fn insert(&mut self, addr: u32, entry: EntryPoint) {
        debug_assert_ne!(addr, SENTINEL_ADDR);

        let idx = self.bucket_index(addr);
        let block = TranslationBlock {
            addr,
            entry,
            use_count: 0,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket.iter().position(|b| b.addr == addr) {
            bucket[pos] = block;
            self.stats.overwrites += 1;
        } else if bucket.len() >= self.max_bucket_size {
            let victim = bucket
                .iter()
                .enumerate()
                .min_by_key(|(_, b)| (b.use_count, b.seq))
                .map(|(i, _)| i);
            match victim {
                Some(pos) => {
                    bucket[pos] = block;
                    self.stats.evictions += 1;
                }
                None => bucket.push(block),
            }
        } else {
            bucket.push(block);
        }

        self.stats.inserts += 1;
        self.inline[idx] = InlineSlot::EMPTY;
    }

    /// Remove the block for `addr`. Returns false (and changes nothing) if
    /// there is none.
    pub fn remove(&mut self, addr: u32) -> bool {
        let idx = self.bucket_index(addr);
        match self.buckets[idx].iter().position(|b| b.addr == addr) {
            Some(pos) => {
                self.remove_at(idx, pos);
                self.stats.removals += 1;
                true
            }
            None => false,
        }
    }

    /// Swap-remove `pos` from bucket `idx`, keeping the inline slot valid
    fn remove_at(&mut self, idx: usize, pos: usize) {
        let bucket = &mut self.buckets[idx];
        let last = bucket.len() - 1;
        bucket.swap_remove(pos);

        let slot = &mut self.inline[idx];
        if slot.is_empty() {
            return;
        }
        if slot.index as usize == pos {
            *slot = InlineSlot::EMPTY;
        } else if slot.index as usize == last {
            slot.index = pos as u32;
        }
    }

    /// Drop every block that could start in `[lo, hi]`.
    ///
    /// A range inside one hash granule is filtered exactly. A wider range
    /// clears every bucket it hashes to, walking (and wrapping) from
    /// `bucket_index(lo)` to `bucket_index(hi)`; a range covering the whole
    /// table clears everything. Returns the number of blocks dropped.
    pub fn invalidate_range(&mut self, lo: u32, hi: u32) -> usize {
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };

        let granules = ((hi >> self.shift) - (lo >> self.shift)) as u64 + 1;
        let removed = if granules >= self.buckets.len() as u64 {
            let total = self.total_blocks();
            for idx in 0..self.buckets.len() {
                self.clear_bucket(idx);
            }
            total
        } else if granules == 1 {
            self.invalidate_in_bucket(self.bucket_index(lo), lo, hi)
        } else {
            let end = self.bucket_index(hi);
            let mut idx = self.bucket_index(lo);
            let mut removed = 0;
            for _ in 0..self.buckets.len() {
                removed += self.clear_bucket(idx);
                if idx == end {
                    break;
                }
                idx = (idx + 1) & self.mask as usize;
            }
            removed
        };

        self.stats.invalidated += removed as u64;
        removed
    }

    fn invalidate_in_bucket(&mut self, idx: usize, lo: u32, hi: u32) -> usize {
        let mut removed = 0;
        let mut i = 0;
        while i < self.buckets[idx].len() {
            let addr = self.buckets[idx][i].addr;
            if addr >= lo && addr <= hi {
                self.remove_at(idx, i);
                removed += 1;
            } else {
                i += 1;
            }
        }
        removed
    }

    fn clear_bucket(&mut self, idx: usize) -> usize {
        let n = self.buckets[idx].len();
        self.buckets[idx].clear();
        self.inline[idx] = InlineSlot::EMPTY;
        n
    }

    /// Drop every block. Must happen together with a code buffer reset.
    pub fn reset_all(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.inline.fill(InlineSlot::EMPTY);
        self.stats.resets += 1;
    }

    pub fn reset_stats(&mut self) {
        self.stats = BlockIndexStats::default();
    }

    /// Peek at a block without counting a lookup
    pub fn get(&self, addr: u32) -> Option<&TranslationBlock> {
        self.buckets[self.bucket_index(addr)]
            .iter()
            .find(|b| b.addr == addr)
    }

    #[inline]
    pub fn contains(&self, addr: u32) -> bool {
        self.get(addr).is_some()
    }

    pub fn total_blocks(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }

    pub fn bucket(&self, idx: usize) -> &[TranslationBlock] {
        &self.buckets[idx]
    }

    /// Block currently held by the inline slot of bucket `idx`
    pub fn inline_block(&self, idx: usize) -> Option<&TranslationBlock> {
        let slot = self.inline[idx];
        if slot.is_empty() {
            None
        } else {
            self.buckets[idx].get(slot.index as usize)
        }
    }

    /// Read-only view of the inline slot array
    pub fn inline_slots(&self) -> &[InlineSlot] {
        &self.inline
    }

    /// Stable address of the inline slot array for generated code.
    /// Valid for the lifetime of this index; entries change on every
    /// insert, remove and reset.
    pub fn inline_slots_ptr(&self) -> *const InlineSlot {
        self.inline.as_ptr()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TranslationBlock> {
        self.buckets.iter().flatten()
    }
}
