//! Scripted decoder and emitter for unit tests

use std::cell::RefCell;
use std::rc::Rc;

use super::code_buffer::CodeBuffer;
use super::codegen::{BlockDecoder, CodeEmitter, CodegenError, DecodeError};
use super::config::{BlockIndexConfig, DynarecConfig};
use super::driver::Dynarec;
use super::memory::HeapCodeMemory;
use super::types::{BlockExit, DecodeContext, DecodedBlock, EntryPoint};

/// Counters and failure switches shared between a test and its collaborators
#[derive(Default, Debug)]
pub struct Script {
    pub decodes: u32,
    pub cleanups: u32,
    pub emits: u32,
    pub resets: u32,
    /// Addresses the decoder refuses
    pub bad_addrs: Vec<u32>,
    /// Number of upcoming emits that fail
    pub fail_emits: u32,
    /// Return an entry point outside the emitted bytes
    pub bogus_entry: bool,
    /// Return an entry point tagged with the previous buffer epoch
    pub stale_epoch: bool,
    pub last_debug: bool,
}

pub type Shared = Rc<RefCell<Script>>;

pub struct ScriptDecoder {
    pub script: Shared,
    pub block_bytes: u32,
}

impl BlockDecoder for ScriptDecoder {
    fn decode(
        &mut self,
        addr: u32,
        ctx: DecodeContext,
        _cycle_budget: u32,
    ) -> Result<DecodedBlock, DecodeError> {
        let mut script = self.script.borrow_mut();
        script.decodes += 1;
        if script.bad_addrs.contains(&addr) {
            return Err(DecodeError::IllegalInstruction {
                addr,
                opcode: 0xFFFD,
            });
        }
        let end = addr.wrapping_add(self.block_bytes);
        Ok(DecodedBlock {
            start: addr,
            end,
            opcodes: vec![0x0009; (self.block_bytes / 2) as usize],
            cycles: self.block_bytes / 2,
            exit: BlockExit::Fallthrough { next: end },
            context: ctx,
            analysis: Vec::new(),
        })
    }

    fn cleanup(&mut self) {
        self.script.borrow_mut().cleanups += 1;
    }
}

pub struct ScriptEmitter {
    pub script: Shared,
    pub bytes_per_block: usize,
}

impl CodeEmitter for ScriptEmitter {
    fn emit(
        &mut self,
        _block: &DecodedBlock,
        code: &mut CodeBuffer,
        debug: bool,
    ) -> Result<EntryPoint, CodegenError> {
        let mut script = self.script.borrow_mut();
        script.emits += 1;
        script.last_debug = debug;
        let entry = code.current_entry();
        // Leave partial output behind, like a backend failing mid-block
        code.write_u8(0x90)?;
        if script.fail_emits > 0 {
            script.fail_emits -= 1;
            return Err(CodegenError::TooComplex);
        }
        code.write_bytes(&vec![0x90; self.bytes_per_block - 1])?;
        if script.bogus_entry {
            return Ok(EntryPoint::from_offset(u32::MAX));
        }
        if script.stale_epoch {
            return Ok(EntryPoint::new(entry.offset(), entry.epoch().wrapping_sub(1)));
        }
        Ok(entry)
    }

    fn reset_blocks(&mut self) {
        self.script.borrow_mut().resets += 1;
    }
}

pub fn small_config(code_size: usize) -> DynarecConfig {
    DynarecConfig {
        code_size,
        low_space_threshold: 64,
        log_misses: false,
        block_index: BlockIndexConfig {
            bucket_count: 64,
            shift: 2,
            max_bucket_size: 4,
            initial_bucket_capacity: 4,
            promote_margin: 2,
        },
        ..DynarecConfig::default()
    }
}

/// Dynarec over heap memory: 16-byte guest blocks, 32-byte host blocks
pub fn scripted(config: DynarecConfig) -> (Dynarec, Shared) {
    let script = Shared::default();
    let memory = Box::new(HeapCodeMemory::new(config.code_size));
    let rec = Dynarec::with_memory(
        config,
        Box::new(ScriptDecoder {
            script: script.clone(),
            block_bytes: 16,
        }),
        Box::new(ScriptEmitter {
            script: script.clone(),
            bytes_per_block: 32,
        }),
        memory,
    );
    (rec, script)
}
