use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use zrecon::error::Error;
use zrecon::rcksum::{run, JobParams};

/// Reconstruct a target file from a local seed plus a per-block checksum
/// stream, reporting the block ranges that still have to be fetched.
#[derive(Parser, Debug)]
#[command(name = "zrecon", version)]
struct Args {
    /// Packed per-block checksum stream (weak + truncated MD4 records).
    #[arg(long)]
    checksums: PathBuf,

    /// Local file to scan for reusable blocks.
    #[arg(long)]
    seed: PathBuf,

    /// Under-construction output file; created and sized if needed.
    #[arg(long)]
    output: PathBuf,

    #[arg(long)]
    block_size: usize,

    /// Number of target blocks covered by this job.
    #[arg(long)]
    blocks: usize,

    #[arg(long, default_value_t = 0)]
    block_id_offset: usize,

    #[arg(long, default_value_t = 4)]
    weak_bytes: usize,

    #[arg(long, default_value_t = 16)]
    strong_bytes: usize,

    #[arg(long, default_value_t = 1)]
    seq_matches: usize,

    /// Print the MD4 prefix of every missing block.
    #[arg(long)]
    print_checksums: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let params = JobParams {
        block_size: args.block_size,
        block_id_offset: args.block_id_offset,
        blocks: args.blocks,
        weak_bytes: args.weak_bytes,
        strong_bytes: args.strong_bytes,
        seq_matches: args.seq_matches,
    };

    let checksum_stream = match File::open(&args.checksums) {
        Ok(f) => f,
        Err(e) => {
            let err = Error::ChecksumStreamOpenFailed { path: args.checksums, source: e };
            eprintln!("zrecon: {}", err);
            return exit_code(err.code());
        }
    };

    let target = match open_target(&args.output, &params) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("zrecon: cannot prepare output {}: {}", args.output.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let result = run(params, checksum_stream, &args.seed, target);

    if let Some(err) = &result.error {
        eprintln!("zrecon: {}", err);
    }
    println!("got {} of {} blocks from seed", result.got_blocks, args.blocks);

    match &result.required_ranges {
        None if result.is_success() => println!("target fully assembled from seed"),
        None => {}
        Some(ranges) => {
            for range in ranges {
                println!("missing blocks {}-{}", range.from, range.to);
                if args.print_checksums {
                    for (id, sum) in (range.from..=range.to).zip(&range.checksums) {
                        let hex: String = sum.iter().map(|b| format!("{:02x}", b)).collect();
                        println!("  {} {}", id, hex);
                    }
                }
            }
        }
    }

    exit_code(result.error_code())
}

// Open the output for writing and make sure every block this job owns fits.
fn open_target(path: &PathBuf, params: &JobParams) -> std::io::Result<File> {
    let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
    let needed = ((params.blocks + params.block_id_offset) * params.block_size) as u64;
    if file.metadata()?.len() < needed {
        file.set_len(needed)?;
    }
    Ok(file)
}

fn exit_code(code: i16) -> ExitCode {
    ExitCode::from(code.unsigned_abs().min(u8::MAX as u16) as u8)
}
