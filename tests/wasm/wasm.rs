#![cfg(target_arch = "wasm32")]

use sh4rec::TraceReplayer;
use wasm_bindgen_test::*;

#[wasm_bindgen_test]
fn test_replayer_in_browser() {
    let mut replayer = TraceReplayer::new(64, 32, 8);
    replayer.run("x 8c020000\nx 8c020020\nx 8c020000\n").unwrap();
    let stats = replayer.stats().unwrap();
    assert!(stats.is_object());
}

#[wasm_bindgen_test]
fn test_bad_trace_is_an_error() {
    let mut replayer = TraceReplayer::new(64, 32, 8);
    assert!(replayer.run("bogus\n").is_err());
}
