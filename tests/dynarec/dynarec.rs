use sh4rec::cpu::sh4::rec::block_index::BlockIndex;
use sh4rec::cpu::sh4::rec::code_buffer::CodeBuffer;
use sh4rec::cpu::sh4::rec::codegen::{BlockDecoder, CodeEmitter, CodegenError, DecodeError};
use sh4rec::cpu::sh4::rec::config::BlockIndexConfig;
use sh4rec::cpu::sh4::rec::memory::HeapCodeMemory;
use sh4rec::cpu::sh4::rec::types::{BlockExit, DecodeContext, DecodedBlock, EntryPoint};
use sh4rec::replay::{parse_trace, ReplayOptions, Replayer};
use sh4rec::snapshot::RecompilerSnapshot;
use sh4rec::{Dispatch, Dynarec, DynarecConfig, DynarecError};

/// 8 NOPs per block
struct NopDecoder;

impl BlockDecoder for NopDecoder {
    fn decode(
        &mut self,
        addr: u32,
        ctx: DecodeContext,
        _cycle_budget: u32,
    ) -> Result<DecodedBlock, DecodeError> {
        if addr & 1 != 0 {
            return Err(DecodeError::InvalidAddress(addr));
        }
        Ok(DecodedBlock {
            start: addr,
            end: addr + 16,
            opcodes: vec![0x0009; 8],
            cycles: 8,
            exit: BlockExit::Jump { target: addr + 16 },
            context: ctx,
            analysis: Vec::new(),
        })
    }
}

/// Writes the guest pc as a 4 byte tag plus padding
struct TagEmitter {
    size: usize,
}

impl CodeEmitter for TagEmitter {
    fn emit(
        &mut self,
        block: &DecodedBlock,
        code: &mut CodeBuffer,
        _debug: bool,
    ) -> Result<EntryPoint, CodegenError> {
        let entry = code.current_entry();
        code.write_u32(block.start)?;
        code.skip(self.size - 4)?;
        Ok(entry)
    }
}

fn config(code_size: usize) -> DynarecConfig {
    DynarecConfig {
        code_size,
        low_space_threshold: 256,
        log_misses: false,
        block_index: BlockIndexConfig {
            bucket_count: 256,
            ..BlockIndexConfig::default()
        },
        ..DynarecConfig::default()
    }
}

fn dynarec(code_size: usize) -> Dynarec {
    Dynarec::with_memory(
        config(code_size),
        Box::new(NopDecoder),
        Box::new(TagEmitter { size: 64 }),
        Box::new(HeapCodeMemory::new(code_size)),
    )
}

fn native(rec: &mut Dynarec, pc: u32) -> EntryPoint {
    match rec.find_or_compile(pc) {
        Ok(Dispatch::Native(entry)) => entry,
        other => panic!("expected native code at {:08X}, got {:?}", pc, other),
    }
}

/// The code at an entry point really belongs to the block it was returned for
fn assert_tag(rec: &Dynarec, entry: EntryPoint, pc: u32) {
    let at = entry.offset() as usize;
    let bytes = rec.code().bytes(at, at + 4);
    assert_eq!(bytes, &pc.to_ne_bytes()[..]);
}

#[test]
fn test_lookup_matches_compiled_code() {
    let mut rec = dynarec(64 * 1024);
    let pcs: Vec<u32> = (0..100).map(|i| 0x8C10_0000 + i * 0x40).collect();

    for &pc in &pcs {
        let entry = native(&mut rec, pc);
        assert_tag(&rec, entry, pc);
    }
    for &pc in &pcs {
        let entry = rec.find_code(pc).unwrap();
        assert_tag(&rec, entry, pc);
    }
    assert_eq!(rec.stats.blocks_compiled, 100);
}

#[test]
fn test_cache_fills_and_recovers() {
    // Room for roughly 60 blocks
    let mut rec = dynarec(4096);
    for i in 0..500u32 {
        let pc = 0x8C20_0000 + i * 0x10;
        let entry = native(&mut rec, pc);
        assert_tag(&rec, entry, pc);
    }
    assert!(rec.stats.low_space_clears > 0);
    assert_eq!(rec.stats.cache_clears, rec.stats.low_space_clears);
    assert!(rec.usage().used <= rec.usage().total);
    // Every cached entry is still valid after all those resets
    for block in rec.index().iter() {
        assert_tag(&rec, block.entry, block.addr);
    }
}

#[test]
fn test_self_modifying_code() {
    let mut rec = dynarec(64 * 1024);
    let a = native(&mut rec, 0x8C30_0000);
    let b = native(&mut rec, 0x8C30_0100);

    // Patch the last instruction of the first block
    assert!(rec.on_guest_write(0x8C30_000E, 2) >= 1);
    assert_eq!(rec.find_code(0x8C30_0000), None);
    assert_eq!(rec.find_code(0x8C30_0100), Some(b));

    let a2 = native(&mut rec, 0x8C30_0000);
    assert_ne!(a, a2);
    assert_tag(&rec, a2, 0x8C30_0000);
}

#[test]
fn test_invalidate_everything_with_wide_range() {
    let mut rec = dynarec(64 * 1024);
    for i in 0..32u32 {
        native(&mut rec, 0x8C40_0000 + i * 0x1000);
    }
    rec.invalidate_range(0x8C00_0000, 0x8CFF_FFFF);
    assert!(rec.index().is_empty());
}

#[test]
fn test_fatal_error_reports_address() {
    let mut cfg = config(64 * 1024);
    cfg.interpreter_fallback = false;
    let mut rec = Dynarec::with_memory(
        cfg,
        Box::new(NopDecoder),
        Box::new(TagEmitter { size: 64 }),
        Box::new(HeapCodeMemory::new(64 * 1024)),
    );

    let err = rec.find_or_compile(0x8C00_0123).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("8C000123"));
    assert!(msg.contains("no fallback execution path is available"));
    assert!(matches!(
        rec.find_or_compile(0x8C00_0200),
        Err(DynarecError::Faulted { .. })
    ));
}

#[test]
fn test_snapshot_restore_rebuilds_cache() {
    let mut rec = dynarec(64 * 1024);
    rec.ctx.pc = 0x8C50_0000;
    native(&mut rec, 0x8C50_0000);

    let bytes = rec.snapshot().to_bytes().unwrap();
    let snap = RecompilerSnapshot::from_bytes(&bytes).unwrap();

    let mut other = dynarec(64 * 1024);
    native(&mut other, 0x8C60_0000);
    other.restore(&snap);

    assert_eq!(other.ctx.pc, 0x8C50_0000);
    assert!(other.index().is_empty());
    let entry = native(&mut other, 0x8C50_0000);
    assert_tag(&other, entry, 0x8C50_0000);
}

#[test]
fn test_index_uniqueness_under_churn() {
    let mut index = BlockIndex::new(&BlockIndexConfig {
        bucket_count: 8,
        shift: 2,
        max_bucket_size: 3,
        initial_bucket_capacity: 1,
        promote_margin: 2,
    });

    // Small LCG so the sequence is fixed
    let mut seed = 0x1234_5678u32;
    let mut next = || {
        seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        seed >> 8
    };

    for round in 0..2000u32 {
        let addr = (next() % 256) * 2;
        match next() % 4 {
            0 | 1 => index.insert(addr, EntryPoint::from_offset(round)),
            2 => {
                index.lookup(addr);
            }
            _ => {
                index.remove(addr);
            }
        }

        for idx in 0..index.bucket_count() {
            let bucket = index.bucket(idx);
            assert!(bucket.len() <= 3);
            for (i, a) in bucket.iter().enumerate() {
                assert!(bucket[i + 1..].iter().all(|b| b.addr != a.addr));
            }
            if let Some(hot) = index.inline_block(idx) {
                assert_eq!(index.bucket_index(hot.addr), idx);
                assert_eq!(index.inline_slots()[idx].addr, hot.addr);
            }
        }
    }
}

#[test]
fn test_replay_trace() {
    let trace = "\
# a loop over three blocks with a patched literal pool
x 8c020000
x 8c020020
x 8c020040
x 8c020000
x 8c020020
x 8c020040
w 8c020044 4
x 8c020040
v 8c020000
i
x 8c020000
";
    let ops = parse_trace(trace).unwrap();
    let mut replayer = Replayer::new(&ReplayOptions {
        code_size: 256 * 1024,
        ..ReplayOptions::default()
    });
    replayer.run(&ops).unwrap();

    let stats = replayer.stats();
    assert_eq!(stats.executed, 8);
    assert_eq!(stats.interpreted, 0);
    assert_eq!(stats.validation_failures, 1);
    assert_eq!(stats.icache_flushes, 1);
    assert_eq!(stats.blocks_cached, 1);
    assert_eq!(stats.dynarec.block_checks_failed, 1);
}
