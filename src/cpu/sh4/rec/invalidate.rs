//! Self-modifying code handling
//!
//! Guest writes are turned into block index range invalidations. The index
//! keys blocks by their start address only, so the range is widened
//! downwards by the longest block compiled since the last clear: a write
//! into the middle of a block must drop the block that starts before it.

use super::driver::Dynarec;
use crate::console_log;

impl Dynarec {
    /// Guest memory write of `len` bytes at `addr`. Returns the number of
    /// blocks dropped.
    pub fn on_guest_write(&mut self, addr: u32, len: u32) -> usize {
        if len == 0 {
            return 0;
        }
        let hi = addr.saturating_add(len - 1);
        self.invalidate_range(addr, hi)
    }

    /// Drop every block whose code may overlap `[lo, hi]`
    pub fn invalidate_range(&mut self, lo: u32, hi: u32) -> usize {
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        let lo = lo.saturating_sub(self.max_guest_span.saturating_sub(1));
        self.index.invalidate_range(lo, hi)
    }

    /// CCR.ICI write: the guest flushed its instruction cache
    pub fn on_icache_invalidate(&mut self) {
        console_log!("Dynarec: icache invalidated at pc {:08X}", self.ctx.pc);
        self.clear_cache(self.ctx.pc);
    }
}

#[cfg(test)]
mod tests {
    use crate::cpu::sh4::rec::testing::{scripted, small_config};

    #[test]
    fn test_write_to_block_start() {
        let (mut rec, _script) = scripted(small_config(4096));
        rec.compile_at(0x8C00_1000).unwrap();

        assert_eq!(rec.on_guest_write(0x8C00_1000, 2), 1);
        assert_eq!(rec.find_code(0x8C00_1000), None);
    }

    #[test]
    fn test_write_into_block_body() {
        let (mut rec, _script) = scripted(small_config(4096));
        // Covers 0x8C001000..0x8C001010
        rec.compile_at(0x8C00_1000).unwrap();

        rec.on_guest_write(0x8C00_100E, 2);
        assert!(!rec.index().contains(0x8C00_1000));
    }

    #[test]
    fn test_zero_length_write_is_ignored() {
        let (mut rec, _script) = scripted(small_config(4096));
        rec.compile_at(0x8C00_1000).unwrap();
        assert_eq!(rec.on_guest_write(0x8C00_1000, 0), 0);
        assert!(rec.index().contains(0x8C00_1000));
    }

    #[test]
    fn test_write_at_top_of_address_space() {
        let (mut rec, _script) = scripted(small_config(4096));
        rec.compile_at(0xFFFF_FFF0).unwrap();
        assert_eq!(rec.on_guest_write(0xFFFF_FFFC, 16), 1);
        assert!(rec.index().is_empty());
    }

    #[test]
    fn test_unrelated_write_keeps_block() {
        let (mut rec, _script) = scripted(small_config(4096));
        rec.compile_at(0x8C00_1000).unwrap();
        // 64 buckets << 2 = 256 bytes per hash cycle; stay clear of it
        rec.on_guest_write(0x8C00_1080, 4);
        assert!(rec.index().contains(0x8C00_1000));
    }

    #[test]
    fn test_icache_invalidate_clears_everything() {
        let (mut rec, script) = scripted(small_config(4096));
        rec.compile_at(0x8C00_1000).unwrap();
        rec.compile_at(0x8C00_2000).unwrap();

        rec.on_icache_invalidate();
        assert!(rec.index().is_empty());
        assert_eq!(rec.code().write_pos(), 0);
        assert_eq!(script.borrow().resets, 1);
    }
}
