//! hdr - tone-map an image on the GPU or with the CPU reference

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use hdr_compute::{Algorithm, DeviceClass, Method, PlatformDevice};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

mod commands;

#[derive(Parser)]
#[command(name = "hdr")]
#[command(author, version, about = "HDR tone mapping on the GPU with CPU reference checks")]
#[command(long_about = "
Tone-maps an image with one of four operators, either on a wgpu device or
with the CPU reference implementation.

Filters: histEq, reinhardGlobal, reinhardLocal, gradDom
Methods: gpu (alias opencl), reference

Examples:
  hdr run reinhardGlobal gpu --image memorial.png --verify
  hdr run gradDom reference --image memorial.png -o out.png
  hdr run histEq gpu --image lena.jpg --kernels 1,5 --device 0:1
  hdr devices --class gpu

Stages selected with --kernels still run in pipeline order, not in the order
listed. Verification is only meaningful when every stage runs.
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Also write the log to this file
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    /// Number of threads for the reference path (0 = auto)
    #[arg(short = 'j', long, global = true, default_value = "0")]
    threads: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Tone-map one image
    #[command(visible_alias = "r")]
    Run(RunArgs),

    /// List platforms and devices (like clinfo)
    #[command(visible_alias = "d")]
    Devices(DevicesArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Operator: histEq, reinhardGlobal, reinhardLocal, gradDom
    filter: Algorithm,

    /// Execution path: gpu or reference
    method: Method,

    /// Input image
    #[arg(short, long)]
    image: PathBuf,

    /// Output image (default: <input>_<filter>.jpg next to the input)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Platform and device index as reported by `hdr devices`
    #[arg(long, value_name = "P:D")]
    device: Option<PlatformDevice>,

    /// Device class: all, gpu, cpu, other
    #[arg(long, default_value = "all")]
    class: DeviceClass,

    /// Comma-separated 1-based stage indices to run (must name at least one; omit for all)
    #[arg(long, value_name = "I,J,...")]
    kernels: Option<String>,

    /// Compare GPU output against the reference
    #[arg(long)]
    verify: bool,

    /// Recompute the mapping statistics
    #[arg(long)]
    remap: bool,

    /// Override the compute-unit estimate used for launch geometry
    #[arg(long)]
    compute_units: Option<u32>,
}

#[derive(Args)]
struct DevicesArgs {
    /// Device class: all, gpu, cpu, other
    #[arg(long, default_value = "all")]
    class: DeviceClass,
}

fn init_logging(verbose: u8, log: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let Some(path) = log else {
        tracing_subscriber::registry().with(filter).with(stderr).init();
        return Ok(None);
    };
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let name = path
        .file_name()
        .with_context(|| format!("Log path has no file name: {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(Some(guard))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.verbose, cli.log.as_deref())?;

    // Configure thread pool
    if cli.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(cli.threads)
            .build_global()
            .context("Failed to configure thread pool")?;
    }

    match cli.command {
        Commands::Run(args) => commands::run::run(args, cli.verbose > 0),
        Commands::Devices(args) => commands::devices::run(args, cli.verbose > 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "hdr", "-vv", "run", "gradDom", "opencl", "--image", "in.png", "--device", "0:1",
            "--kernels", "3,1", "--verify",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.filter, Algorithm::GradDom);
        assert_eq!(args.method, Method::Gpu);
        assert_eq!(args.device, Some(PlatformDevice { platform: 0, device: 1 }));
        assert_eq!(args.class, DeviceClass::All);
        assert_eq!(args.kernels.as_deref(), Some("3,1"));
        assert!(args.verify);
        assert!(!args.remap);
    }

    #[test]
    fn test_rejects_unknown_filter() {
        assert!(Cli::try_parse_from(["hdr", "run", "drago", "gpu", "--image", "a.png"]).is_err());
        let bad_device = ["hdr", "run", "histEq", "gpu", "--image", "a.png", "--device", "1"];
        assert!(Cli::try_parse_from(bad_device).is_err());
    }

    #[test]
    fn test_empty_stage_list_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("scene.png");
        let img = hdr_core::Image::new(4, 4).unwrap();
        commands::save_image(&input, &img).unwrap();

        let cli = Cli::try_parse_from([
            "hdr", "run", "histEq", "gpu", "--image", input.to_str().unwrap(), "--kernels", "",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let err = commands::run::run(args, false).unwrap_err();
        assert!(err.to_string().contains("stage list is empty"), "{err}");
    }

    #[test]
    fn test_reference_run_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("scene.png");
        let output = dir.path().join("mapped.png");
        let mut img = hdr_core::Image::new(24, 16).unwrap();
        for y in 0..16 {
            for x in 0..24 {
                img.set(x, y, [(x * 10) as u8, (y * 15) as u8, 200, 255]);
            }
        }
        commands::save_image(&input, &img).unwrap();

        let cli = Cli::try_parse_from([
            "hdr",
            "run",
            "reinhardGlobal",
            "reference",
            "--image",
            input.to_str().unwrap(),
            "--output",
            output.to_str().unwrap(),
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        commands::run::run(args, false).unwrap();

        let mapped = commands::load_image(&output).unwrap();
        assert_eq!(mapped.size(), img.size());
        assert_ne!(mapped, img);
    }
}
