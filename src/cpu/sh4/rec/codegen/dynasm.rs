//! Dynasm-rs native thunk backend for x86_64
//!
//! Emits one tiny x86_64 function per block that hands the dispatcher the
//! guest pc to continue at. It carries no opcode semantics; it exists to
//! drive the code buffer, the executable mapping and the dispatch loop end
//! to end on real hardware. Only available on native builds with the
//! `jit-dynasm` feature.

use dynasm::dynasm;
use dynasmrt::{x64::X64Relocation, DynasmApi, VecAssembler};
use std::mem;

use super::{CodeEmitter, CodegenError};
use crate::cpu::sh4::rec::code_buffer::CodeBuffer;
use crate::cpu::sh4::rec::types::{BlockExit, DecodedBlock, EntryPoint};

/// Signature of an emitted thunk: returns the next guest pc
pub type ThunkFn = unsafe extern "sysv64" fn() -> u32;

/// Emits `mov eax, next_pc; ret` for blocks with a static successor
#[derive(Default)]
pub struct ThunkEmitter {
    /// Blocks emitted since the last reset
    pub emitted: u64,
}

impl ThunkEmitter {
    pub fn new() -> Self {
        ThunkEmitter::default()
    }
}

impl CodeEmitter for ThunkEmitter {
    fn emit(
        &mut self,
        block: &DecodedBlock,
        code: &mut CodeBuffer,
        debug: bool,
    ) -> Result<EntryPoint, CodegenError> {
        let next = match block.exit {
            BlockExit::Fallthrough { next } => next,
            BlockExit::Jump { target } => target,
            // Needs guest register state to resolve
            _ => return Err(CodegenError::TooComplex),
        };

        let entry = code.current_entry();
        let mut ops: VecAssembler<X64Relocation> =
            VecAssembler::new(code.current_write_pointer() as usize);

        if debug {
            // Breakpoint-friendly marker in front of checked blocks
            dynasm!(ops
                ; nop
                ; nop
            );
        }
        dynasm!(ops
            ; mov eax, next as i32
            ; ret
        );

        let bytes = ops
            .finalize()
            .map_err(|e| CodegenError::BackendError(format!("{:?}", e)))?;
        code.write_bytes(&bytes)?;

        self.emitted += 1;
        Ok(entry)
    }

    fn reset_blocks(&mut self) {
        self.emitted = 0;
    }
}

/// Call an emitted thunk.
///
/// # Safety
/// `ptr` must point at a thunk produced by [`ThunkEmitter`] inside
/// executable memory that has not been reused since.
pub unsafe fn run_thunk(ptr: *const u8) -> u32 {
    let func: ThunkFn = mem::transmute(ptr);
    func()
}
