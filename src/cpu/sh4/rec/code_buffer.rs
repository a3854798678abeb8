//! Code buffer
//!
//! A linear emission arena for host code. Blocks are appended one after
//! another and never freed individually; space is reclaimed only by a
//! reset, which must go together with a block index reset since every
//! cached entry point is an offset into this buffer.
//!
//! Positions (all byte offsets, `0 <= block_start <= write_pos <= capacity`):
//! - `baseline`: where a reset rewinds to. Code below it survives resets.
//! - `block_start`: start of the block being emitted, for rollback.
//! - `write_pos`: the write cursor.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;

use super::memory::CodeMemory;
use super::types::EntryPoint;

/// Emission would run past the end of the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeBufferError {
    Overflow { requested: usize, available: usize },
}

impl std::fmt::Display for CodeBufferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodeBufferError::Overflow { requested, available } => write!(
                f,
                "Code cache overflow: {} bytes requested, {} available",
                requested, available
            ),
        }
    }
}

impl std::error::Error for CodeBufferError {}

/// Code cache occupancy report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheUsage {
    pub total: usize,
    pub used: usize,
    pub free: usize,
    pub high_water: usize,
}

pub struct CodeBuffer {
    memory: Box<dyn CodeMemory>,
    baseline: usize,
    block_start: usize,
    write_pos: usize,
    high_water: usize,
    epoch: u32,
}

impl CodeBuffer {
    pub fn new(memory: Box<dyn CodeMemory>) -> Self {
        CodeBuffer {
            memory,
            baseline: 0,
            block_start: 0,
            write_pos: 0,
            high_water: 0,
            epoch: 1,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.memory.capacity()
    }

    /// Bytes left for emission
    #[inline]
    pub fn free_space(&self) -> usize {
        self.capacity() - self.write_pos
    }

    #[inline]
    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    #[inline]
    pub fn block_start(&self) -> usize {
        self.block_start
    }

    #[inline]
    pub fn baseline(&self) -> usize {
        self.baseline
    }

    /// Incremented on every reset
    #[inline]
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Highest write position seen since creation
    #[inline]
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Host pointer at the write cursor
    #[inline]
    pub fn current_write_pointer(&self) -> *const u8 {
        self.memory.as_ptr().wrapping_add(self.write_pos)
    }

    /// Entry point for code emitted at the write cursor
    #[inline]
    pub fn current_entry(&self) -> EntryPoint {
        EntryPoint::new(self.write_pos as u32, self.epoch)
    }

    /// Start emitting a block
    #[inline]
    pub(crate) fn begin_block(&mut self) {
        self.block_start = self.write_pos;
    }

    /// Accept the block emitted since `begin_block`
    #[inline]
    pub(crate) fn commit_block(&mut self) {
        self.block_start = self.write_pos;
        self.high_water = self.high_water.max(self.write_pos);
    }

    /// Discard everything emitted since `begin_block`. The bytes stay in
    /// memory and are overwritten by the next block.
    #[inline]
    pub(crate) fn rollback(&mut self) {
        self.write_pos = self.block_start;
    }

    /// Make the code emitted so far permanent: later resets rewind here
    /// instead of to zero.
    pub(crate) fn set_baseline(&mut self) {
        self.baseline = self.write_pos;
        self.block_start = self.write_pos;
        self.high_water = self.high_water.max(self.write_pos);
    }

    /// Rewind to the baseline. The caller must already have reset the block
    /// index, or cached entry points will point into reused memory.
    pub(crate) fn reset(&mut self) {
        self.reset_to(self.baseline);
    }

    /// Rewind the write cursor to `checkpoint` (clamped to the current
    /// write position).
    pub(crate) fn reset_to(&mut self, checkpoint: usize) {
        let checkpoint = checkpoint.min(self.write_pos);
        self.write_pos = checkpoint;
        self.block_start = checkpoint;
        self.baseline = self.baseline.min(checkpoint);
        self.epoch = self.epoch.wrapping_add(1);
    }

    #[inline]
    fn reserve(&self, len: usize) -> Result<usize, CodeBufferError> {
        let available = self.free_space();
        if len > available {
            return Err(CodeBufferError::Overflow {
                requested: len,
                available,
            });
        }
        Ok(self.write_pos)
    }

    /// Append bytes at the write cursor. Nothing is written on overflow.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<(), CodeBufferError> {
        let at = self.reserve(data.len())?;
        self.memory.as_mut_slice()[at..at + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
        Ok(())
    }

    #[inline]
    pub fn write_u8(&mut self, value: u8) -> Result<(), CodeBufferError> {
        self.write_bytes(&[value])
    }

    #[inline]
    pub fn write_u16(&mut self, value: u16) -> Result<(), CodeBufferError> {
        self.write_bytes(&value.to_ne_bytes())
    }

    #[inline]
    pub fn write_u32(&mut self, value: u32) -> Result<(), CodeBufferError> {
        self.write_bytes(&value.to_ne_bytes())
    }

    /// Advance the cursor without writing (e.g. alignment padding)
    pub fn skip(&mut self, len: usize) -> Result<(), CodeBufferError> {
        self.reserve(len)?;
        self.write_pos += len;
        Ok(())
    }

    /// Flush the instruction cache for code emitted since `from`
    pub fn flush_since(&mut self, from: usize) {
        let from = from.min(self.write_pos);
        let len = self.write_pos - from;
        if len > 0 {
            self.memory.flush_icache(from, len);
        }
    }

    /// Host address of an entry point, if it lies below the baseline or was
    /// emitted in the current epoch below the write cursor
    pub fn entry_ptr(&self, entry: EntryPoint) -> Option<*const u8> {
        let offset = entry.offset() as usize;
        let live = entry.epoch() == self.epoch && offset < self.write_pos;
        if offset < self.baseline || live {
            Some(self.memory.as_ptr().wrapping_add(offset))
        } else {
            None
        }
    }

    /// Emitted bytes in `[from, to)`
    pub fn bytes(&self, from: usize, to: usize) -> &[u8] {
        let to = to.min(self.write_pos);
        let from = from.min(to);
        &self.memory.as_slice()[from..to]
    }

    /// Occupancy in percent
    pub fn occupancy_percent(&self) -> u32 {
        if self.capacity() == 0 {
            return 100;
        }
        ((self.write_pos as u64 * 100) / self.capacity() as u64) as u32
    }

    pub fn usage(&self) -> CacheUsage {
        CacheUsage {
            total: self.capacity(),
            used: self.write_pos,
            free: self.free_space(),
            high_water: self.high_water.max(self.write_pos),
        }
    }

    /// Write the used part of the buffer to a file for offline disassembly
    pub fn dump(&self, path: &Path) -> io::Result<usize> {
        let mut f = File::create(path)?;
        f.write_all(&self.memory.as_slice()[..self.write_pos])?;
        Ok(self.write_pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::sh4::rec::memory::HeapCodeMemory;

    fn buffer(size: usize) -> CodeBuffer {
        CodeBuffer::new(Box::new(HeapCodeMemory::new(size)))
    }

    #[test]
    fn test_write_and_commit() {
        let mut code = buffer(64);
        code.begin_block();
        let entry = code.current_entry();
        code.write_bytes(&[1, 2, 3]).unwrap();
        code.write_u8(4).unwrap();
        code.commit_block();

        assert_eq!(entry.offset(), 0);
        assert_eq!(code.write_pos(), 4);
        assert_eq!(code.block_start(), 4);
        assert_eq!(code.bytes(0, 4), &[1, 2, 3, 4]);
        assert_eq!(code.free_space(), 60);
    }

    #[test]
    fn test_overflow_writes_nothing() {
        let mut code = buffer(8);
        code.write_u32(0xDEAD_BEEF).unwrap();
        let err = code.write_bytes(&[0; 5]).unwrap_err();
        assert_eq!(
            err,
            CodeBufferError::Overflow {
                requested: 5,
                available: 4
            }
        );
        assert_eq!(code.write_pos(), 4);
        assert!(code.skip(5).is_err());
        code.write_u32(1).unwrap();
        assert_eq!(code.free_space(), 0);
    }

    #[test]
    fn test_rollback_discards_partial_block() {
        let mut code = buffer(32);
        code.write_bytes(&[9; 4]).unwrap();
        code.commit_block();

        code.begin_block();
        code.write_bytes(&[7; 10]).unwrap();
        code.rollback();

        assert_eq!(code.write_pos(), 4);
        assert!(code.block_start() <= code.write_pos());
    }

    #[test]
    fn test_reset_keeps_baseline() {
        let mut code = buffer(64);
        code.write_bytes(&[0xAA; 16]).unwrap();
        code.set_baseline();
        code.write_bytes(&[0xBB; 16]).unwrap();
        code.commit_block();

        let epoch = code.epoch();
        code.reset();
        assert_eq!(code.write_pos(), 16);
        assert_eq!(code.block_start(), 16);
        assert_eq!(code.epoch(), epoch + 1);
        assert_eq!(code.bytes(0, 16), &[0xAA; 16]);
        assert_eq!(code.usage().high_water, 32);
    }

    #[test]
    fn test_reset_to_clamps() {
        let mut code = buffer(64);
        code.write_bytes(&[0; 8]).unwrap();
        code.reset_to(100);
        assert_eq!(code.write_pos(), 8);
        code.reset_to(0);
        assert_eq!(code.write_pos(), 0);
        assert_eq!(code.baseline(), 0);
    }

    #[test]
    fn test_entry_ptr_bounds() {
        let mut code = buffer(16);
        let entry = code.current_entry();
        code.write_bytes(&[1, 2]).unwrap();
        assert!(code.entry_ptr(entry).is_some());
        assert!(code.entry_ptr(code.current_entry()).is_none());
        // Epoch 0 is never live
        assert!(code.entry_ptr(EntryPoint::from_offset(0)).is_none());
    }

    #[test]
    fn test_stale_entry_does_not_resolve() {
        let mut code = buffer(64);
        let old = code.current_entry();
        code.write_bytes(&[0xAA; 8]).unwrap();
        code.commit_block();

        code.reset();
        let new = code.current_entry();
        code.write_bytes(&[0xBB; 8]).unwrap();
        code.commit_block();

        // Same offset, different code
        assert_eq!(old.offset(), new.offset());
        assert!(code.entry_ptr(old).is_none());
        assert!(code.entry_ptr(new).is_some());
    }

    #[test]
    fn test_occupancy() {
        let mut code = buffer(200);
        code.skip(180).unwrap();
        assert_eq!(code.occupancy_percent(), 90);
        let usage = code.usage();
        assert_eq!(usage.used + usage.free, usage.total);
    }
}
