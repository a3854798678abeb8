//! Core types for the SH-4 recompiler

use serde::{Deserialize, Serialize};

/// Guest address used as the "empty" inline cache key.
///
/// SH-4 instructions are 16-bit aligned, so an odd program counter can
/// never be the start of a translation block.
pub const SENTINEL_ADDR: u32 = 0xFFFF_FFFF;

/// Entry point of a compiled block.
///
/// A byte offset into the code buffer plus the buffer epoch it was emitted
/// in, not a host pointer. Unless it lies below the baseline it stops
/// resolving at the next coordinated reset; resolve it with
/// [`CodeBuffer::entry_ptr`](super::code_buffer::CodeBuffer::entry_ptr).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct EntryPoint {
    offset: u32,
    epoch: u32,
}

impl EntryPoint {
    #[inline(always)]
    pub const fn new(offset: u32, epoch: u32) -> Self {
        EntryPoint { offset, epoch }
    }

    /// Entry with epoch 0, which no buffer is ever in. For index-only use.
    #[inline(always)]
    pub const fn from_offset(offset: u32) -> Self {
        EntryPoint { offset, epoch: 0 }
    }

    #[inline(always)]
    pub const fn offset(self) -> u32 {
        self.offset
    }

    #[inline(always)]
    pub const fn epoch(self) -> u32 {
        self.epoch
    }
}

/// Decoder state that changes how guest opcodes are interpreted.
///
/// FPSCR.PR selects single/double precision and FPSCR.SZ the FMOV
/// transfer size, so the same bytes decode differently under each mode.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct DecodeContext {
    pub fpscr_pr: bool,
    pub fpscr_sz: bool,
}

impl DecodeContext {
    const FPSCR_PR: u32 = 1 << 19;
    const FPSCR_SZ: u32 = 1 << 20;

    #[inline]
    pub fn from_fpscr(fpscr: u32) -> Self {
        DecodeContext {
            fpscr_pr: fpscr & Self::FPSCR_PR != 0,
            fpscr_sz: fpscr & Self::FPSCR_SZ != 0,
        }
    }
}

/// How a decoded block hands control back to the dispatcher
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockExit {
    /// Block ended because the cycle budget ran out
    Fallthrough { next: u32 },
    /// Unconditional static branch (BRA, BSR)
    Jump { target: u32 },
    /// Conditional branch (BT, BF and their delay-slot forms)
    Branch { taken: u32, not_taken: u32 },
    /// Register-indirect jump (JMP, JSR, RTS, BRAF, BSRF)
    Dynamic,
    /// Exception, trap or mode switch (TRAPA, RTE, SLEEP, LDC to SR)
    System,
}

/// A run of guest instructions produced by the decoder
///
/// The backend may attach its own analysis results through `analysis`
/// before emitting code.
#[derive(Clone, Debug)]
pub struct DecodedBlock {
    /// Guest address of the first instruction
    pub start: u32,
    /// Guest address after the last instruction (exclusive)
    pub end: u32,
    /// Raw 16-bit opcodes
    pub opcodes: Vec<u16>,
    /// Estimated guest cycles
    pub cycles: u32,
    /// Terminator
    pub exit: BlockExit,
    /// Mode the block was decoded under
    pub context: DecodeContext,
    /// Backend scratch data filled in by `CodeEmitter::analyze`
    pub analysis: Vec<u32>,
}

impl DecodedBlock {
    #[inline]
    pub fn instruction_count(&self) -> usize {
        self.opcodes.len()
    }

    /// Guest byte length covered by this block
    #[inline]
    pub fn guest_len(&self) -> u32 {
        self.end.wrapping_sub(self.start)
    }
}
