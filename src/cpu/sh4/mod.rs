//! Hitachi SH-4 CPU

pub mod rec;

use serde::{Deserialize, Serialize};

use rec::types::DecodeContext;

/// SH-4 state the recompiler depends on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sh4Context {
    /// Program counter
    pub pc: u32,
    /// Floating-point status/control register
    pub fpscr: u32,
    /// Status register
    pub sr: u32,
}

impl Sh4Context {
    /// Power-on reset vector (P2, uncached)
    pub const RESET_PC: u32 = 0xA000_0000;
    /// MD=1, RB=1, BL=1, IMASK=0xF
    pub const RESET_SR: u32 = 0x7000_00F0;
    /// DN=1, RM=01 (round to zero)
    pub const RESET_FPSCR: u32 = 0x0004_0001;

    pub fn new() -> Self {
        Sh4Context {
            pc: Self::RESET_PC,
            fpscr: Self::RESET_FPSCR,
            sr: Self::RESET_SR,
        }
    }

    /// FPSCR mode bits that select how FPU opcodes decode
    #[inline]
    pub fn decode_context(&self) -> DecodeContext {
        DecodeContext::from_fpscr(self.fpscr)
    }
}

impl Default for Sh4Context {
    fn default() -> Self {
        Self::new()
    }
}
