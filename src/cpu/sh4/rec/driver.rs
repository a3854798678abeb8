//! Compile driver
//!
//! `Dynarec` owns the block index, the code buffer and the two backend
//! collaborators. It is the only place where the index and the buffer are
//! reset, and it always resets them together.

use std::fmt;

use serde::Serialize;

use super::block_index::BlockIndex;
use super::code_buffer::{CacheUsage, CodeBuffer, CodeBufferError};
use super::codegen::{BlockDecoder, CodeEmitter, CodegenError, DecodeError};
use super::config::DynarecConfig;
use super::dispatch::DispatchState;
use super::memory::{allocate_code_memory, CodeMemory};
use super::types::{DecodedBlock, EntryPoint};
use crate::cpu::sh4::Sh4Context;
use crate::{console_error, console_log, console_warn};

/// `compile_at` failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The decoder gave up; no retry
    Decode(DecodeError),
    /// Code generation failed even after clearing the cache
    Codegen { addr: u32, source: CodegenError },
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Decode(e) => write!(f, "{}", e),
            CompileError::Codegen { addr, source } => {
                write!(f, "Code generation failed at {:08X}: {}", addr, source)
            }
        }
    }
}

impl std::error::Error for CompileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CompileError::Decode(e) => Some(e),
            CompileError::Codegen { source, .. } => Some(source),
        }
    }
}

impl From<DecodeError> for CompileError {
    fn from(e: DecodeError) -> Self {
        CompileError::Decode(e)
    }
}

/// Fatal dispatch error. The emulator must stop; executing further would
/// mean jumping through a missing entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DynarecError {
    /// Compilation failed and interpreter fallback is disabled
    NoFallback { addr: u32, cause: CompileError },
    /// A previous fault hasn't been cleared by `reset()`
    Faulted { addr: u32 },
}

const NO_PATH: &str =
    "no native code could be generated and no fallback execution path is available";

impl fmt::Display for DynarecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DynarecError::NoFallback { addr, cause } => {
                write!(f, "Dynarec fault at {:08X}: {} ({})", addr, NO_PATH, cause)
            }
            DynarecError::Faulted { addr } => write!(
                f,
                "Dynarec halted after fault at {:08X}: {}; reset required",
                addr, NO_PATH
            ),
        }
    }
}

impl std::error::Error for DynarecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DynarecError::NoFallback { cause, .. } => Some(cause),
            DynarecError::Faulted { .. } => None,
        }
    }
}

/// Driver counters. Diagnostic only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DynarecStats {
    pub blocks_compiled: u64,
    pub cache_clears: u64,
    pub block_checks_failed: u64,
    pub decode_failures: u64,
    pub compile_failures: u64,
    pub fallbacks: u64,
    pub boot_clears: u64,
    pub low_space_clears: u64,
}

pub struct Dynarec {
    pub(super) config: DynarecConfig,
    pub(super) index: BlockIndex,
    pub(super) code: CodeBuffer,
    decoder: Box<dyn BlockDecoder>,
    emitter: Box<dyn CodeEmitter>,
    /// Guest state the decoder depends on
    pub ctx: Sh4Context,
    pub stats: DynarecStats,
    pub(super) state: DispatchState,
    /// Last pc that missed the block index
    pub(super) last_miss_pc: Option<u32>,
    /// Largest guest byte span of any block compiled since the last reset
    pub(super) max_guest_span: u32,
    pressure_warned: bool,
    /// Boot-address entry and its host address, valid until the next compile
    one_shot: Option<(EntryPoint, *const u8)>,
}

impl Dynarec {
    /// Create a dynarec with the best code memory this host offers
    pub fn new(
        config: DynarecConfig,
        decoder: Box<dyn BlockDecoder>,
        emitter: Box<dyn CodeEmitter>,
    ) -> Self {
        let memory = allocate_code_memory(config.code_size);
        Self::with_memory(config, decoder, emitter, memory)
    }

    /// Create a dynarec over caller-provided code memory. `config.code_size`
    /// is replaced by the memory's real capacity.
    pub fn with_memory(
        mut config: DynarecConfig,
        decoder: Box<dyn BlockDecoder>,
        emitter: Box<dyn CodeEmitter>,
        memory: Box<dyn CodeMemory>,
    ) -> Self {
        let code = CodeBuffer::new(memory);
        if code.capacity() != config.code_size {
            console_warn!(
                "Dynarec: code memory is {} bytes, config asked for {}; using {}",
                code.capacity(),
                config.code_size,
                code.capacity()
            );
            config.code_size = code.capacity();
        }
        let index = BlockIndex::new(&config.block_index);
        console_log!(
            "Dynarec: {} KB code cache at {:p}, {} buckets",
            code.capacity() / 1024,
            code.current_write_pointer(),
            index.bucket_count()
        );

        Dynarec {
            config,
            index,
            code,
            decoder,
            emitter,
            ctx: Sh4Context::new(),
            stats: DynarecStats::default(),
            state: DispatchState::Running,
            last_miss_pc: None,
            max_guest_span: 0,
            pressure_warned: false,
            one_shot: None,
        }
    }

    pub fn config(&self) -> &DynarecConfig {
        &self.config
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn code(&self) -> &CodeBuffer {
        &self.code
    }

    #[cfg(test)]
    pub(crate) fn code_mut(&mut self) -> &mut CodeBuffer {
        &mut self.code
    }

    /// Emit fixed code (a dispatcher prelude, shared stubs) at the write
    /// cursor and keep it across cache clears
    pub fn emit_prelude(&mut self, bytes: &[u8]) -> Result<EntryPoint, CodeBufferError> {
        let entry = self.code.current_entry();
        self.code.write_bytes(bytes)?;
        self.code.flush_since(entry.offset() as usize);
        self.code.set_baseline();
        Ok(entry)
    }

    /// Keep everything emitted so far across cache clears
    pub fn set_baseline(&mut self) {
        self.code.set_baseline();
    }

    /// Host address of an entry point returned by this dynarec. Entries from
    /// before a cache clear give `None`, except the entry returned by a
    /// boot-address compile, which resolves until the next compile.
    pub fn entry_ptr(&self, entry: EntryPoint) -> Option<*const u8> {
        match self.one_shot {
            Some((boot, ptr)) if boot == entry => Some(ptr),
            _ => self.code.entry_ptr(entry),
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn last_miss_pc(&self) -> Option<u32> {
        self.last_miss_pc
    }

    pub fn usage(&self) -> CacheUsage {
        self.code.usage()
    }

    /// Compile the block at `addr` and register it.
    ///
    /// Low free space clears the cache first. A decode failure returns
    /// immediately. A codegen failure clears the cache and tries once more.
    /// Compiling a boot address clears the cache right after registration;
    /// the returned entry point is then only good for one call.
    pub fn compile_at(&mut self, addr: u32) -> Result<EntryPoint, CompileError> {
        self.one_shot = None;
        let free = self.code.free_space();
        if free < self.config.low_space_threshold {
            console_log!("Dynarec: {} bytes of code cache left, clearing", free);
            self.stats.low_space_clears += 1;
            self.clear_cache(addr);
        }

        let result = self.compile_block(addr);
        self.decoder.cleanup();
        let (entry, span) = result?;

        self.index.insert(addr, entry);
        self.max_guest_span = self.max_guest_span.max(span);
        self.stats.blocks_compiled += 1;
        self.check_pressure();

        if self.config.is_boot_address(addr) {
            console_log!("Dynarec: boot transition at {:08X}, clearing code cache", addr);
            self.stats.boot_clears += 1;
            let ptr = self.code.entry_ptr(entry);
            self.clear_cache(addr);
            self.one_shot = ptr.map(|ptr| (entry, ptr));
        }

        Ok(entry)
    }

    fn compile_block(&mut self, addr: u32) -> Result<(EntryPoint, u32), CompileError> {
        let ctx = self.ctx.decode_context();
        let mut block = match self.decoder.decode(addr, ctx, self.config.cycle_budget) {
            Ok(block) => block,
            Err(e) => {
                self.stats.decode_failures += 1;
                console_warn!("Dynarec: decode failed at {:08X}: {}", addr, e);
                return Err(CompileError::Decode(e));
            }
        };
        self.emitter.analyze(&mut block);

        let debug = self.config.wants_debug_check(addr);
        let entry = match self.emit(&block, debug) {
            Ok(entry) => entry,
            Err(first) => {
                self.stats.compile_failures += 1;
                console_warn!(
                    "Dynarec: compile failed at {:08X} ({}), clearing cache and retrying",
                    addr,
                    first
                );
                self.clear_cache(addr);
                self.emit(&block, debug).map_err(|source| {
                    self.stats.compile_failures += 1;
                    console_error!("Dynarec: compile failed again at {:08X}: {}", addr, source);
                    CompileError::Codegen { addr, source }
                })?
            }
        };

        Ok((entry, block.guest_len()))
    }

    /// Emit one block, rolling the buffer back on failure
    fn emit(&mut self, block: &DecodedBlock, debug: bool) -> Result<EntryPoint, CodegenError> {
        self.code.begin_block();
        let start = self.code.write_pos();

        let entry = match self.emitter.emit(block, &mut self.code, debug) {
            Ok(entry) => entry,
            Err(e) => {
                self.code.rollback();
                return Err(e);
            }
        };

        let offset = entry.offset() as usize;
        if entry.epoch() != self.code.epoch() {
            self.code.rollback();
            return Err(CodegenError::BackendError(format!(
                "entry point {:#x} from epoch {}, buffer is at {}",
                offset,
                entry.epoch(),
                self.code.epoch()
            )));
        }
        if offset < start || offset >= self.code.write_pos() {
            self.code.rollback();
            return Err(CodegenError::BackendError(format!(
                "entry point {:#x} outside emitted code",
                offset
            )));
        }

        self.code.flush_since(start);
        self.code.commit_block();
        Ok(entry)
    }

    fn check_pressure(&mut self) {
        let percent = self.code.occupancy_percent();
        if percent >= self.config.pressure_threshold_percent && !self.pressure_warned {
            self.pressure_warned = true;
            let usage = self.code.usage();
            console_warn!(
                "Dynarec: code cache {}% full ({} of {} KB)",
                percent,
                usage.used / 1024,
                usage.total / 1024
            );
        }
    }

    /// Coordinated reset of the block index and the code buffer
    pub fn clear_cache(&mut self, pc: u32) {
        console_log!(
            "Dynarec: clearing code cache at pc {:08X} ({} blocks, {} KB used)",
            pc,
            self.index.total_blocks(),
            self.code.write_pos() / 1024
        );
        self.index.reset_all();
        self.code.reset();
        self.one_shot = None;
        self.emitter.reset_blocks();
        self.max_guest_span = 0;
        self.pressure_warned = false;
        self.stats.cache_clears += 1;
    }

    /// Machine reset: drop every block and leave the fault state
    pub fn reset(&mut self) {
        self.clear_cache(self.ctx.pc);
        self.state = DispatchState::Running;
        self.last_miss_pc = None;
    }

    pub fn log_summary(&self) {
        let usage = self.code.usage();
        let idx = &self.index.stats;
        console_log!("=== Dynarec Summary ===");
        console_log!("Blocks compiled:     {}", self.stats.blocks_compiled);
        console_log!(
            "Cache clears:        {} (low space {}, boot {})",
            self.stats.cache_clears,
            self.stats.low_space_clears,
            self.stats.boot_clears
        );
        console_log!("Block checks failed: {}", self.stats.block_checks_failed);
        console_log!(
            "Failures:            {} decode, {} compile, {} fallbacks",
            self.stats.decode_failures,
            self.stats.compile_failures,
            self.stats.fallbacks
        );
        console_log!(
            "Code cache:          {} / {} KB (high water {} KB)",
            usage.used / 1024,
            usage.total / 1024,
            usage.high_water / 1024
        );
        console_log!(
            "Block index:         {} blocks, {} inline hits, {} scan hits, {} misses",
            self.index.total_blocks(),
            idx.inline_hits,
            idx.scan_hits,
            idx.misses
        );
        console_log!(
            "Inline efficiency:   {:.1}%",
            idx.inline_efficiency() * 100.0
        );
    }
}
