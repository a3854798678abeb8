//! Trace replay
//!
//! Drives a [`Dynarec`] from a recorded text trace, with a synthetic decoder
//! and emitter standing in for the real backend. Used to size the code
//! cache and tune the block index without running a guest.
//!
//! Trace format, one command per line:
//!
//! ```text
//! # comment
//! x 8c010000     execute the block at this pc
//! w 8c0100a0 4   guest write of 4 bytes
//! v 8c010000     generated code reported a failed block check
//! i              instruction cache invalidate (CCR.ICI)
//! r              machine reset
//! ```
//!
//! Addresses are hex (with or without `0x`); lengths are decimal, or hex
//! with `0x`.

use serde::Serialize;

use crate::cpu::sh4::rec::block_index::BlockIndexStats;
use crate::cpu::sh4::rec::code_buffer::{CacheUsage, CodeBuffer};
use crate::cpu::sh4::rec::codegen::{BlockDecoder, CodeEmitter, CodegenError, DecodeError};
use crate::cpu::sh4::rec::config::DynarecConfig;
use crate::cpu::sh4::rec::dispatch::Dispatch;
use crate::cpu::sh4::rec::driver::{Dynarec, DynarecError, DynarecStats};
use crate::cpu::sh4::rec::memory::HeapCodeMemory;
use crate::cpu::sh4::rec::types::{BlockExit, DecodeContext, DecodedBlock, EntryPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceOp {
    Exec(u32),
    Write { addr: u32, len: u32 },
    Validate(u32),
    IcacheInvalidate,
    Reset,
}

fn parse_addr(s: &str) -> Result<u32, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|_| format!("bad address '{}'", s))
}

fn parse_len(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("bad length '{}'", s))
}

/// Parse one trace line. Blank lines and comments give `None`.
pub fn parse_line(line: &str) -> Result<Option<TraceOp>, String> {
    let line = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return Ok(None);
    };

    let mut arg = |what: &str| {
        parts
            .next()
            .ok_or_else(|| format!("'{}' needs {}", cmd, what))
    };

    let op = match cmd {
        "x" => TraceOp::Exec(parse_addr(arg("an address")?)?),
        "w" => {
            let addr = parse_addr(arg("an address")?)?;
            let len = parse_len(arg("a length")?)?;
            TraceOp::Write { addr, len }
        }
        "v" => TraceOp::Validate(parse_addr(arg("an address")?)?),
        "i" => TraceOp::IcacheInvalidate,
        "r" => TraceOp::Reset,
        other => return Err(format!("unknown command '{}'", other)),
    };

    if let Some(extra) = parts.next() {
        return Err(format!("unexpected '{}' after '{}'", extra, cmd));
    }
    Ok(Some(op))
}

/// Parse a whole trace. Errors carry the 1-based line number.
pub fn parse_trace(text: &str) -> Result<Vec<TraceOp>, String> {
    let mut ops = Vec::new();
    for (n, line) in text.lines().enumerate() {
        match parse_line(line) {
            Ok(Some(op)) => ops.push(op),
            Ok(None) => {}
            Err(e) => return Err(format!("line {}: {}", n + 1, e)),
        }
    }
    Ok(ops)
}

/// Every block is `block_bytes` of guest code ending in a fallthrough
pub struct TraceDecoder {
    block_bytes: u32,
}

impl TraceDecoder {
    pub fn new(block_bytes: u32) -> Self {
        // At least one instruction, 2-byte aligned
        TraceDecoder {
            block_bytes: block_bytes.max(2).saturating_add(1) & !1,
        }
    }
}

impl BlockDecoder for TraceDecoder {
    fn decode(
        &mut self,
        addr: u32,
        ctx: DecodeContext,
        cycle_budget: u32,
    ) -> Result<DecodedBlock, DecodeError> {
        if addr & 1 != 0 {
            return Err(DecodeError::InvalidAddress(addr));
        }
        // One cycle per instruction
        let count = (self.block_bytes / 2).min(cycle_budget.max(1));
        let end = addr.wrapping_add(count * 2);
        Ok(DecodedBlock {
            start: addr,
            end,
            opcodes: vec![0x0009; count as usize],
            cycles: count,
            exit: BlockExit::Fallthrough { next: end },
            context: ctx,
            analysis: Vec::new(),
        })
    }
}

/// Writes `bytes_per_insn` filler bytes per guest instruction
pub struct TraceEmitter {
    bytes_per_insn: usize,
}

impl TraceEmitter {
    pub fn new(bytes_per_insn: usize) -> Self {
        TraceEmitter {
            bytes_per_insn: bytes_per_insn.max(1),
        }
    }
}

impl CodeEmitter for TraceEmitter {
    fn emit(
        &mut self,
        block: &DecodedBlock,
        code: &mut CodeBuffer,
        _debug: bool,
    ) -> Result<EntryPoint, CodegenError> {
        let entry = code.current_entry();
        // Saturates so an oversized block fails as an overflow
        let len = block
            .instruction_count()
            .max(1)
            .saturating_mul(self.bytes_per_insn);
        code.skip(len)?;
        Ok(entry)
    }
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub code_size: usize,
    pub block_bytes: u32,
    pub bytes_per_insn: usize,
    pub interpreter_fallback: bool,
    pub log_misses: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        let config = DynarecConfig::default();
        ReplayOptions {
            code_size: config.code_size,
            block_bytes: 32,
            bytes_per_insn: 12,
            interpreter_fallback: true,
            log_misses: false,
        }
    }
}

impl ReplayOptions {
    /// Set the code cache size in KiB
    pub fn set_code_size_kib(&mut self, kib: usize) -> Result<(), String> {
        self.code_size = kib
            .checked_mul(1024)
            .filter(|&size| size > 0)
            .ok_or_else(|| format!("code size of {} KiB is out of range", kib))?;
        Ok(())
    }

    /// Set the guest bytes covered by each synthetic block
    pub fn set_block_bytes(&mut self, bytes: usize) -> Result<(), String> {
        self.block_bytes = u32::try_from(bytes)
            .map_err(|_| format!("block size of {} bytes is out of range", bytes))?;
        Ok(())
    }

    pub fn to_config(&self) -> DynarecConfig {
        DynarecConfig {
            code_size: self.code_size,
            interpreter_fallback: self.interpreter_fallback,
            log_misses: self.log_misses,
            ..DynarecConfig::default()
        }
    }
}

/// Replay results
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayStats {
    pub ops: u64,
    pub executed: u64,
    pub native: u64,
    pub interpreted: u64,
    pub writes: u64,
    pub blocks_invalidated: u64,
    pub validation_failures: u64,
    pub icache_flushes: u64,
    pub resets: u64,
    pub blocks_cached: usize,
    pub dynarec: DynarecStats,
    pub index: BlockIndexStats,
    pub cache: CacheUsage,
}

pub struct Replayer {
    rec: Dynarec,
    stats: ReplayStats,
}

impl Replayer {
    pub fn new(opts: &ReplayOptions) -> Self {
        let config = opts.to_config();
        let memory = Box::new(HeapCodeMemory::new(config.code_size));
        let rec = Dynarec::with_memory(
            config,
            Box::new(TraceDecoder::new(opts.block_bytes)),
            Box::new(TraceEmitter::new(opts.bytes_per_insn)),
            memory,
        );
        Replayer {
            rec,
            stats: ReplayStats::default(),
        }
    }

    pub fn dynarec(&self) -> &Dynarec {
        &self.rec
    }

    pub fn apply(&mut self, op: TraceOp) -> Result<(), DynarecError> {
        self.stats.ops += 1;
        match op {
            TraceOp::Exec(pc) => {
                self.rec.ctx.pc = pc;
                self.stats.executed += 1;
                match self.rec.find_or_compile(pc)? {
                    Dispatch::Native(_) => self.stats.native += 1,
                    Dispatch::Interpret(_) => self.stats.interpreted += 1,
                }
            }
            TraceOp::Write { addr, len } => {
                self.stats.writes += 1;
                self.stats.blocks_invalidated += self.rec.on_guest_write(addr, len) as u64;
            }
            TraceOp::Validate(pc) => {
                self.rec.ctx.pc = pc;
                self.stats.validation_failures += 1;
                self.rec.on_validation_failed(pc)?;
            }
            TraceOp::IcacheInvalidate => {
                self.stats.icache_flushes += 1;
                self.rec.on_icache_invalidate();
            }
            TraceOp::Reset => {
                self.stats.resets += 1;
                self.rec.reset();
            }
        }
        Ok(())
    }

    /// Apply every op, stopping at the first fatal error
    pub fn run(&mut self, ops: &[TraceOp]) -> Result<(), DynarecError> {
        for &op in ops {
            self.apply(op)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> ReplayStats {
        ReplayStats {
            blocks_cached: self.rec.index().total_blocks(),
            dynarec: self.rec.stats,
            index: self.rec.index().stats,
            cache: self.rec.usage(),
            ..self.stats.clone()
        }
    }
}
