use std::env;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::process;

use sh4rec::replay::{parse_trace, ReplayOptions, Replayer};

fn usage(program: &str) -> ! {
    eprintln!(
        "Usage: {} <trace[.zst]> [--code-size <KiB>] [--block-bytes <n>] \
         [--bytes-per-insn <n>] [--no-fallback] [--quiet] [--dump <file>]",
        program
    );
    process::exit(1);
}

fn parse_num(program: &str, flag: &str, value: Option<&String>) -> usize {
    match value.map(|v| v.parse::<usize>()) {
        Some(Ok(n)) => n,
        _ => {
            eprintln!("Invalid value for {}", flag);
            usage(program)
        }
    }
}

fn read_trace(path: &str) -> io::Result<String> {
    let mut f = File::open(path)?;
    let mut data = Vec::new();
    f.read_to_end(&mut data)?;

    if path.ends_with(".zst") {
        data = zstd::stream::decode_all(&data[..])?;
    }
    String::from_utf8(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn main() -> io::Result<()> {
    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("sh4rec-replay");
    let mut trace_path = String::new();
    let mut dump_path = String::new();
    let mut opts = ReplayOptions {
        log_misses: true,
        ..ReplayOptions::default()
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--code-size" => {
                i += 1;
                let kib = parse_num(program, "--code-size", args.get(i));
                if let Err(e) = opts.set_code_size_kib(kib) {
                    eprintln!("{}", e);
                    usage(program);
                }
            }
            "--block-bytes" => {
                i += 1;
                let bytes = parse_num(program, "--block-bytes", args.get(i));
                if let Err(e) = opts.set_block_bytes(bytes) {
                    eprintln!("{}", e);
                    usage(program);
                }
            }
            "--bytes-per-insn" => {
                i += 1;
                opts.bytes_per_insn = parse_num(program, "--bytes-per-insn", args.get(i));
            }
            "--no-fallback" => {
                opts.interpreter_fallback = false;
            }
            "--quiet" => {
                opts.log_misses = false;
            }
            "--dump" => {
                i += 1;
                match args.get(i) {
                    Some(path) => dump_path = path.clone(),
                    None => usage(program),
                }
            }
            arg if !arg.starts_with('-') => {
                trace_path = arg.to_string();
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
            }
        }
        i += 1;
    }

    if trace_path.is_empty() {
        usage(program);
    }

    println!("SH-4 dynarec trace replay");
    println!("Trace: {}", trace_path);
    println!(
        "Code cache: {} KB, {} guest bytes per block, {} host bytes per instruction",
        opts.code_size / 1024,
        opts.block_bytes,
        opts.bytes_per_insn
    );

    let text = read_trace(&trace_path)?;
    let ops = parse_trace(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    println!("{} trace commands", ops.len());
    println!("-------------------------------------");

    let mut replayer = Replayer::new(&opts);
    let result = replayer.run(&ops);

    let stats = replayer.stats();
    println!("-------------------------------------");
    println!(
        "Executed {} blocks: {} native, {} interpreted",
        stats.executed, stats.native, stats.interpreted
    );
    println!(
        "Guest writes: {} ({} blocks invalidated), block checks failed: {}",
        stats.writes, stats.blocks_invalidated, stats.validation_failures
    );
    println!(
        "Hit rate: {:.2}%, {} blocks cached",
        stats.index.hit_rate() * 100.0,
        stats.blocks_cached
    );
    replayer.dynarec().log_summary();

    if !dump_path.is_empty() {
        let written = replayer.dynarec().code().dump(Path::new(&dump_path))?;
        println!("Code cache dumped ({} bytes).", written);
    }

    if let Err(e) = result {
        eprintln!("{}", e);
        process::exit(2);
    }
    Ok(())
}
