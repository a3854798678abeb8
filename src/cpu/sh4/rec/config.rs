//! Recompiler configuration
//!
//! Every tunable of the block cache and the compile driver lives here so the
//! thresholds stay visible instead of being buried in the hot path.

use serde::{Deserialize, Serialize};

/// Code buffer size (4 MB, sized for hosts with little RAM)
pub const CODE_SIZE: usize = 4 * 1024 * 1024;

/// Free space below which the driver clears the cache before compiling.
/// A single block never needs more than this, so compilation can't overflow
/// half-way through.
pub const LOW_SPACE_THRESHOLD: usize = 4096;

/// Occupancy (percent) above which cache pressure is reported
pub const PRESSURE_THRESHOLD_PERCENT: u32 = 90;

/// SH-4 cycles per scheduler slice
pub const SH4_TIMESLICE: u32 = 448;

/// Number of hash buckets in the block index
pub const BM_BLOCKLIST_COUNT: usize = 16384;

/// Address bits dropped before hashing (instructions are 2-byte aligned;
/// dropping 2 bits keeps adjacent blocks in neighbouring buckets)
pub const BM_BLOCKLIST_SHIFT: u32 = 2;

/// Initial capacity reserved per bucket
pub const BM_INITIAL_CAPACITY: usize = 16;

/// Hard cap on blocks per bucket
pub const BM_MAX_BLOCKS_PER_BUCKET: usize = 64;

/// Lookups a scanned block needs above the inline cache holder to replace it
pub const BM_PROMOTE_MARGIN: u32 = 2;

/// Mask applied to a pc before comparing with boot and debug addresses
pub const AREA_OFFSET_MASK: u32 = 0x00FF_FFFF;

/// Block index tuning
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIndexConfig {
    /// Bucket count, must be a power of two
    pub bucket_count: usize,
    /// Right shift applied to the address before masking
    pub shift: u32,
    /// Maximum blocks per bucket before eviction kicks in
    pub max_bucket_size: usize,
    /// Capacity reserved per bucket at init
    pub initial_bucket_capacity: usize,
    /// Promotion hysteresis for the inline cache
    pub promote_margin: u32,
}

impl Default for BlockIndexConfig {
    fn default() -> Self {
        BlockIndexConfig {
            bucket_count: BM_BLOCKLIST_COUNT,
            shift: BM_BLOCKLIST_SHIFT,
            max_bucket_size: BM_MAX_BLOCKS_PER_BUCKET,
            initial_bucket_capacity: BM_INITIAL_CAPACITY,
            promote_margin: BM_PROMOTE_MARGIN,
        }
    }
}

impl BlockIndexConfig {
    /// Returns a copy with `bucket_count` rounded up to a power of two and
    /// `max_bucket_size` at least one.
    pub fn normalized(&self) -> Self {
        let mut cfg = self.clone();
        cfg.bucket_count = cfg.bucket_count.max(1).next_power_of_two();
        cfg.max_bucket_size = cfg.max_bucket_size.max(1);
        cfg.shift = cfg.shift.min(31);
        cfg
    }
}

/// Dynarec driver configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynarecConfig {
    /// Code buffer capacity in bytes
    pub code_size: usize,
    /// See [`LOW_SPACE_THRESHOLD`]
    pub low_space_threshold: usize,
    /// See [`PRESSURE_THRESHOLD_PERCENT`]
    pub pressure_threshold_percent: u32,
    /// Cycle budget handed to the decoder for one block
    pub cycle_budget: u32,
    /// Boot transition points (masked with [`AREA_OFFSET_MASK`]).
    /// Compiling one of them clears the cache right after registration.
    pub boot_addresses: Vec<u32>,
    /// RAM offsets compiled with backend debug checks enabled
    pub debug_check_addresses: Vec<u32>,
    /// Whether the caller can step failed blocks in the interpreter
    pub interpreter_fallback: bool,
    /// Log every block lookup miss
    pub log_misses: bool,
    pub block_index: BlockIndexConfig,
}

impl Default for DynarecConfig {
    fn default() -> Self {
        DynarecConfig {
            code_size: CODE_SIZE,
            low_space_threshold: LOW_SPACE_THRESHOLD,
            pressure_threshold_percent: PRESSURE_THRESHOLD_PERCENT,
            cycle_budget: SH4_TIMESLICE / 2,
            boot_addresses: vec![0x0000_8300, 0x0001_0000],
            debug_check_addresses: vec![0x003D_AFC6, 0x003C_83F8],
            interpreter_fallback: true,
            log_misses: true,
            block_index: BlockIndexConfig::default(),
        }
    }
}

impl DynarecConfig {
    #[inline]
    pub fn is_boot_address(&self, pc: u32) -> bool {
        let offset = pc & AREA_OFFSET_MASK;
        self.boot_addresses.contains(&offset)
    }

    /// Whether the block at `pc` should be compiled with debug checks
    #[inline]
    pub fn wants_debug_check(&self, pc: u32) -> bool {
        is_on_ram(pc) && self.debug_check_addresses.contains(&(pc & AREA_OFFSET_MASK))
    }
}

/// System RAM lives in area 3 (0x0C000000 and its P1/P2/P3 mirrors)
#[inline(always)]
pub fn is_on_ram(addr: u32) -> bool {
    (addr >> 26) & 0x7 == 3
}
