//! Dispatch state machine
//!
//! ```text
//! Running --miss--> Miss --compiled--> Running
//!                        --failed, fallback--> Running (interpreter steps the block)
//!                        --failed, no fallback--> Faulted
//! Running --check failed--> ValidationFailed --remove + compile--> Running
//! ```
//!
//! `Faulted` is sticky until [`Dynarec::reset`].

use serde::Serialize;

use super::driver::{Dynarec, DynarecError};
use super::types::EntryPoint;
use crate::{console_error, console_log, console_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DispatchState {
    /// Executing cached code
    Running,
    /// No cached entry for the current pc
    Miss,
    /// Generated code found its assumptions stale
    ValidationFailed,
    Compiling,
    /// Compilation failed with no fallback
    Faulted,
}

/// Where the CPU loop should go next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Call compiled code
    Native(EntryPoint),
    /// Step the block at this pc in the interpreter
    Interpret(u32),
}

impl Dynarec {
    /// Cached entry point for `addr`, without compiling
    #[inline(always)]
    pub fn find_code(&mut self, addr: u32) -> Option<EntryPoint> {
        self.index.lookup(addr)
    }

    /// Entry point for `addr`, compiling on a miss
    #[inline]
    pub fn find_or_compile(&mut self, addr: u32) -> Result<Dispatch, DynarecError> {
        self.check_faulted()?;
        if let Some(entry) = self.index.lookup(addr) {
            self.state = DispatchState::Running;
            return Ok(Dispatch::Native(entry));
        }
        self.on_miss(addr)
    }

    #[inline(never)]
    fn on_miss(&mut self, addr: u32) -> Result<Dispatch, DynarecError> {
        self.last_miss_pc = Some(addr);
        self.state = DispatchState::Miss;
        if self.config.log_misses {
            console_log!("Dynarec: failed to find block at {:08X}", addr);
        }
        self.compile_for_dispatch(addr)
    }

    /// Called by generated code whose runtime check failed for the block at
    /// `addr`. The stale block is dropped and rebuilt.
    pub fn on_validation_failed(&mut self, addr: u32) -> Result<Dispatch, DynarecError> {
        self.check_faulted()?;
        self.state = DispatchState::ValidationFailed;
        self.stats.block_checks_failed += 1;
        console_warn!("Dynarec: block check failed at {:08X}, recompiling", addr);
        self.index.remove(addr);
        self.compile_for_dispatch(addr)
    }

    fn compile_for_dispatch(&mut self, addr: u32) -> Result<Dispatch, DynarecError> {
        self.state = DispatchState::Compiling;
        match self.compile_at(addr) {
            Ok(entry) => {
                self.state = DispatchState::Running;
                Ok(Dispatch::Native(entry))
            }
            Err(cause) if self.config.interpreter_fallback => {
                self.stats.fallbacks += 1;
                console_warn!("Dynarec: interpreting block at {:08X} ({})", addr, cause);
                self.state = DispatchState::Running;
                Ok(Dispatch::Interpret(addr))
            }
            Err(cause) => {
                self.state = DispatchState::Faulted;
                self.last_miss_pc = Some(addr);
                let err = DynarecError::NoFallback { addr, cause };
                console_error!("{}", err);
                Err(err)
            }
        }
    }

    #[inline(always)]
    fn check_faulted(&self) -> Result<(), DynarecError> {
        if self.state == DispatchState::Faulted {
            return Err(DynarecError::Faulted {
                addr: self.last_miss_pc.unwrap_or(self.ctx.pc),
            });
        }
        Ok(())
    }
}
