use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};

use nskit_formats::archive::discover_volumes;
use nskit_formats::extract::{extract_volume, ExtractOptions, SpbMode, SpbOptions};
use nskit_formats::image::{SpbPlane, SpbScan};

/// NSA archive extractor
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Arguments {
    /// Directory containing arc.nsa / arc#.nsa
    #[arg(short, long, default_value = ".")]
    input_dir: PathBuf,

    /// Output root directory
    #[arg(short, long, default_value = "arc")]
    output_dir: PathBuf,

    /// Max numbered volumes to scan (arc0..arcN)
    #[arg(long, default_value_t = 100)]
    max_volumes: u32,

    /// Skip N bytes before reading object_count
    #[arg(long, default_value_t = 0)]
    hdr_skip: usize,

    /// If the initial object_count is 0, read another u16 for object_count
    #[arg(long, default_value_t = false)]
    objcount_fallback: bool,

    /// Process only this entry index in each volume (debug)
    #[arg(long)]
    only_index: Option<usize>,

    /// Print first N bytes of each raw entry (debug)
    #[arg(long)]
    hexdump: Option<usize>,

    /// SPB conversion policy
    #[arg(long, value_enum, default_value_t = SpbModeArg::Auto)]
    spb_mode: SpbModeArg,

    /// Per-image SPB decode time budget in ms. 0 = unlimited.
    #[arg(long, default_value_t = 1500)]
    spb_timeout_ms: u64,

    /// Attempt SPB->BMP even if the header looks implausible (advanced)
    #[arg(long, default_value_t = false)]
    spb_skip_plausibility: bool,

    /// Ignore expanded_size vs expected 24bpp BMP mismatch (advanced)
    #[arg(long, default_value_t = false)]
    spb_skip_sizecheck: bool,

    /// SPB pixel order mapping
    #[arg(long, value_enum, default_value_t = SpbScanArg::Zigzag)]
    spb_scan: SpbScanArg,

    /// SPB plane order
    #[arg(long, value_enum, default_value_t = SpbPlaneArg::Bgr)]
    spb_plane: SpbPlaneArg,

    /// If set, save original bytes of skipped entries here as
    /// *.skip-<reason>.bin
    #[arg(long)]
    save_skips_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SpbModeArg {
    Auto,
    Convert,
    Copy,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SpbScanArg {
    Zigzag,
    Linear,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SpbPlaneArg {
    Bgr,
    Rgb,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Arguments::parse();

    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("nsaex: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Arguments) -> anyhow::Result<ExitCode> {
    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating {}", args.output_dir.display()))?;

    let vols = discover_volumes(&args.input_dir, args.max_volumes);
    if vols.is_empty() {
        eprintln!("No NSA volumes found (expected arc.nsa or arc0.nsa, etc.).");
        return Ok(ExitCode::from(2));
    }

    let opts = ExtractOptions {
        hdr_skip: args.hdr_skip,
        objcount_fallback: args.objcount_fallback,
        only_index: args.only_index,
        hexdump: args.hexdump,
        spb: SpbOptions {
            mode: match args.spb_mode {
                SpbModeArg::Auto => SpbMode::Auto,
                SpbModeArg::Convert => SpbMode::Convert,
                SpbModeArg::Copy => SpbMode::Copy,
            },
            timeout: match args.spb_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            skip_plausibility: args.spb_skip_plausibility,
            skip_sizecheck: args.spb_skip_sizecheck,
            scan: match args.spb_scan {
                SpbScanArg::Zigzag => SpbScan::Zigzag,
                SpbScanArg::Linear => SpbScan::Linear,
            },
            plane: match args.spb_plane {
                SpbPlaneArg::Bgr => SpbPlane::Bgr,
                SpbPlaneArg::Rgb => SpbPlane::Rgb,
            },
        },
        save_skips_dir: args.save_skips_dir.clone(),
    };

    for vol in &vols {
        if let Err(e) = extract_volume(vol, &args.output_dir, &opts) {
            let name = vol.file_name().unwrap_or_default().to_string_lossy();
            eprintln!("[{name}] ERROR: {e}");
        }
    }

    println!("Finished extracting.");
    Ok(ExitCode::SUCCESS)
}
