//! Decoder and code generation seams
//!
//! The recompiler core does not know SH-4 opcode semantics or any host
//! instruction set. It drives two collaborators:
//! - a [`BlockDecoder`] that turns a guest pc into a [`DecodedBlock`]
//! - a [`CodeEmitter`] that writes host code for it into the code buffer
//!
//! Backends:
//! - dynasm-rs thunk emitter (native x86-64, feature-gated)

use super::code_buffer::{CodeBuffer, CodeBufferError};
use super::types::{DecodeContext, DecodedBlock, EntryPoint};

#[cfg(all(not(target_arch = "wasm32"), feature = "jit-dynasm", target_arch = "x86_64"))]
pub mod dynasm;

/// Decoder failure. The block is stepped in the interpreter instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Pc doesn't map to fetchable memory
    InvalidAddress(u32),
    /// Opcode the decoder can't express
    IllegalInstruction { addr: u32, opcode: u16 },
    Other(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::InvalidAddress(addr) => {
                write!(f, "Can't fetch instructions at {:08X}", addr)
            }
            DecodeError::IllegalInstruction { addr, opcode } => {
                write!(f, "Illegal instruction {:04X} at {:08X}", opcode, addr)
            }
            DecodeError::Other(msg) => write!(f, "Decode error: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Error during code generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodegenError {
    /// Block too complex to compile
    TooComplex,
    /// Unsupported instruction
    UnsupportedInstruction(u16),
    /// Ran out of code buffer
    Overflow(CodeBufferError),
    /// Backend-specific error
    BackendError(String),
}

impl std::fmt::Display for CodegenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodegenError::TooComplex => write!(f, "Block too complex to compile"),
            CodegenError::UnsupportedInstruction(op) => {
                write!(f, "Unsupported instruction: 0x{:04x}", op)
            }
            CodegenError::Overflow(e) => write!(f, "{}", e),
            CodegenError::BackendError(msg) => write!(f, "Backend error: {}", msg),
        }
    }
}

impl std::error::Error for CodegenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodegenError::Overflow(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodeBufferError> for CodegenError {
    fn from(e: CodeBufferError) -> Self {
        CodegenError::Overflow(e)
    }
}

/// Turns a guest address into a block of decoded instructions
pub trait BlockDecoder {
    /// Decode from `addr` until a block terminator or until `cycle_budget`
    /// guest cycles have been collected.
    fn decode(
        &mut self,
        addr: u32,
        ctx: DecodeContext,
        cycle_budget: u32,
    ) -> Result<DecodedBlock, DecodeError>;

    /// Release per-block scratch state. Called after every compile attempt.
    fn cleanup(&mut self) {}
}

/// Generates host code for decoded blocks
pub trait CodeEmitter {
    /// Static analysis pass run before `emit`
    fn analyze(&mut self, _block: &mut DecodedBlock) {}

    /// Write host code for `block` at the code buffer's write cursor and
    /// return its entry point. `debug` asks for extra runtime checks.
    ///
    /// On error the driver rolls the buffer back, so partial output may be
    /// left behind.
    fn emit(
        &mut self,
        block: &DecodedBlock,
        code: &mut CodeBuffer,
        debug: bool,
    ) -> Result<EntryPoint, CodegenError>;

    /// Forget any state tied to previously emitted code (link tables,
    /// constant pools). Called on every coordinated reset.
    fn reset_blocks(&mut self) {}
}
