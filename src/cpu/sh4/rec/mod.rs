//! SH-4 dynamic recompiler core
//!
//! Block caching and compile orchestration for the SH-4 dynarec. Opcode
//! decoding and host code generation are supplied by the embedder through
//! [`BlockDecoder`] and [`CodeEmitter`]; this module decides when to
//! compile, where the code goes, how it is found again and when it has to
//! be thrown away.
//!
//! - [`BlockIndex`]: guest pc to entry point, hashed buckets with one inline
//!   cache slot each
//! - [`CodeBuffer`]: linear arena for emitted host code
//! - [`Dynarec`]: compile driver, dispatch state machine and SMC handling
//!
//! The index stores offsets into the code buffer, so the two are only ever
//! reset together (see [`Dynarec::clear_cache`]).

pub mod block_index;
pub mod code_buffer;
pub mod codegen;
pub mod config;
pub mod dispatch;
pub mod driver;
mod invalidate;
pub mod memory;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use block_index::{BlockIndex, BlockIndexStats, InlineSlot, INLINE_SLOT_ABI_VERSION};
pub use code_buffer::{CacheUsage, CodeBuffer, CodeBufferError};
pub use codegen::{BlockDecoder, CodeEmitter, CodegenError, DecodeError};
pub use config::{BlockIndexConfig, DynarecConfig};
pub use dispatch::{Dispatch, DispatchState};
pub use driver::{CompileError, Dynarec, DynarecError, DynarecStats};
pub use types::{BlockExit, DecodeContext, DecodedBlock, EntryPoint};
