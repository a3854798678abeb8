//! SH-4 Dynarec Block Cache
//!
//! The translation block cache and compile driver of an SH-4 dynamic
//! recompiler: a hashed block index with per-bucket inline caches, a linear
//! code buffer, the compile/retry policy and self-modifying code
//! invalidation. Targets native hosts and WebAssembly.

use wasm_bindgen::prelude::*;

pub mod cpu;
pub mod replay;
pub mod snapshot;

pub use cpu::sh4::rec::{Dispatch, Dynarec, DynarecConfig, DynarecError};
pub use cpu::Sh4Context;

/// Initialize panic hook for better error messages in browser console
#[wasm_bindgen(start)]
pub fn init() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// Log to browser console
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace = console)]
    pub fn log(s: &str);

    #[wasm_bindgen(js_namespace = console)]
    pub fn warn(s: &str);

    #[wasm_bindgen(js_namespace = console)]
    pub fn error(s: &str);
}

#[cfg(not(target_arch = "wasm32"))]
pub fn log(s: &str) {
    println!("LOG: {}", s);
}

#[cfg(not(target_arch = "wasm32"))]
pub fn warn(s: &str) {
    eprintln!("WARN: {}", s);
}

#[cfg(not(target_arch = "wasm32"))]
pub fn error(s: &str) {
    eprintln!("ERROR: {}", s);
}

/// Helper macro for console logging
#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => ($crate::log(&format!($($t)*)))
}

#[macro_export]
macro_rules! console_warn {
    ($($t:tt)*) => ($crate::warn(&format!($($t)*)))
}

#[macro_export]
macro_rules! console_error {
    ($($t:tt)*) => ($crate::error(&format!($($t)*)))
}

/// Trace replayer exposed to JavaScript
#[wasm_bindgen]
pub struct TraceReplayer {
    inner: replay::Replayer,
}

#[wasm_bindgen]
impl TraceReplayer {
    /// Create a replayer with a `code_size_kb` code cache. Synthetic blocks
    /// cover `block_bytes` of guest code and take `bytes_per_insn` host
    /// bytes per guest instruction.
    #[wasm_bindgen(constructor)]
    pub fn new(code_size_kb: u32, block_bytes: u32, bytes_per_insn: u32) -> TraceReplayer {
        let opts = replay::ReplayOptions {
            code_size: (code_size_kb as usize).saturating_mul(1024),
            block_bytes,
            bytes_per_insn: bytes_per_insn as usize,
            ..replay::ReplayOptions::default()
        };
        TraceReplayer {
            inner: replay::Replayer::new(&opts),
        }
    }

    /// Replay a text trace
    pub fn run(&mut self, trace: &str) -> Result<(), JsValue> {
        let ops = replay::parse_trace(trace).map_err(|e| JsValue::from_str(&e))?;
        self.inner
            .run(&ops)
            .map_err(|e| JsValue::from_str(&e.to_string()))
    }

    /// Counters as a plain JS object
    pub fn stats(&self) -> Result<JsValue, JsValue> {
        serde_wasm_bindgen::to_value(&self.inner.stats())
            .map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
    }

    pub fn log_summary(&self) {
        self.inner.dynarec().log_summary();
    }
}

/// Decompress zstd-compressed data (compressed traces)
#[wasm_bindgen]
pub fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>, JsValue> {
    zstd::stream::decode_all(data)
        .map_err(|e| JsValue::from_str(&format!("Zstd decompression error: {}", e)))
}
