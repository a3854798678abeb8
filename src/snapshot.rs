//! Recompiler save states
//!
//! Only the guest state the recompiler depends on and its configuration are
//! saved. Compiled code is never serialized: it is host specific and
//! cheaper to rebuild from guest memory than to validate after a restore.

use serde::{Deserialize, Serialize};

use crate::console_log;
use crate::cpu::sh4::rec::codegen::{BlockDecoder, CodeEmitter};
use crate::cpu::sh4::rec::config::DynarecConfig;
use crate::cpu::sh4::rec::driver::Dynarec;
use crate::cpu::Sh4Context;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RecompilerSnapshot {
    /// Version for compatibility checking
    pub version: u32,
    /// Decoder-relevant CPU state
    pub context: Sh4Context,
    /// Configuration the cache was running with
    pub config: DynarecConfig,
}

impl RecompilerSnapshot {
    /// Current snapshot version
    pub const VERSION: u32 = 1;

    pub fn new(context: Sh4Context, config: DynarecConfig) -> Self {
        RecompilerSnapshot {
            version: Self::VERSION,
            context,
            config,
        }
    }

    /// Serialize to bytes (compressed with zstd)
    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        let serialized =
            bincode::serialize(self).map_err(|e| format!("Serialization error: {}", e))?;

        zstd::stream::encode_all(&serialized[..], 3)
            .map_err(|e| format!("Compression error: {}", e))
    }

    /// Deserialize from bytes (compressed with zstd)
    pub fn from_bytes(data: &[u8]) -> Result<Self, String> {
        let decompressed =
            zstd::stream::decode_all(data).map_err(|e| format!("Decompression error: {}", e))?;

        let snapshot: RecompilerSnapshot = bincode::deserialize(&decompressed)
            .map_err(|e| format!("Deserialization error: {}", e))?;

        if snapshot.version != Self::VERSION {
            return Err(format!(
                "Snapshot version mismatch: expected {}, got {}",
                Self::VERSION,
                snapshot.version
            ));
        }
        Ok(snapshot)
    }
}

impl Dynarec {
    pub fn snapshot(&self) -> RecompilerSnapshot {
        RecompilerSnapshot::new(self.ctx, self.config().clone())
    }

    /// Load guest state from a snapshot. Every cached block is dropped so
    /// code is rebuilt against the restored memory.
    pub fn restore(&mut self, snapshot: &RecompilerSnapshot) {
        if snapshot.config != *self.config() {
            console_log!("Snapshot: config differs from the running dynarec, keeping current");
        }
        self.ctx = snapshot.context;
        self.reset();
        console_log!("Snapshot: restored at pc {:08X}", self.ctx.pc);
    }

    /// Build a dynarec with the snapshot's configuration and state
    pub fn from_snapshot(
        snapshot: &RecompilerSnapshot,
        decoder: Box<dyn BlockDecoder>,
        emitter: Box<dyn CodeEmitter>,
    ) -> Self {
        let mut rec = Dynarec::new(snapshot.config.clone(), decoder, emitter);
        rec.ctx = snapshot.context;
        rec
    }
}
