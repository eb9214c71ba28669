mod batch;
mod error;
mod manifest;
mod matcher;
mod progress;
mod remux;
mod title;
mod util;

use anyhow::{Context, Result};
use batch::{BatchConfig, BatchSummary, DEFAULT_EXTENSION};
use clap::Parser;
use progress::{ProgressConfig, ProgressMode, ProgressOutcome, ProgressReporter};
use remux::FfmpegRemuxer;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(
    name = "cachemux",
    version,
    about = "Merge offline video caches (entry.json + video.m4s/audio.m4s) into playable files without re-encoding"
)]
struct Cli {
    /// Cache root to scan (e.g. the app's `download` directory). Prompted for when omitted.
    input: Option<String>,

    /// Output directory. Default: `MergedVideos` next to the input directory.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// ffmpeg binary to use instead of searching next to the executable and PATH.
    #[arg(long, env = "CACHEMUX_FFMPEG")]
    ffmpeg: Option<PathBuf>,

    /// Container extension of merged files.
    #[arg(long, default_value = DEFAULT_EXTENSION)]
    extension: String,

    /// Cache units merged concurrently. 0 = one per CPU core.
    #[arg(short, long, default_value_t = 1)]
    workers: usize,

    /// Kill an ffmpeg run after this many seconds. 0 = no limit.
    #[arg(long, default_value_t = 0)]
    timeout_secs: u64,

    /// List matched cache units without merging anything.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Exit with status 2 when any item failed.
    #[arg(long, default_value_t = false)]
    fail_on_error: bool,

    /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
    #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
    progress: ProgressMode,

    /// Debug logging.
    #[arg(short, long, default_value_t = false, conflicts_with = "quiet")]
    verbose: bool,

    /// Errors only.
    #[arg(short, long, default_value_t = false)]
    quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let ffmpeg = if cli.dry_run {
        None
    } else {
        let ffmpeg = util::resolve_ffmpeg(cli.ffmpeg.as_deref())?;
        match util::probe_ffmpeg(&ffmpeg) {
            Ok(version) => info!(path = %ffmpeg.display(), %version, "found ffmpeg"),
            Err(err) => warn!(path = %ffmpeg.display(), error = %err, "ffmpeg -version failed"),
        }
        Some(ffmpeg)
    };

    let raw_input = match cli.input {
        Some(input) => input,
        None => prompt_for_input().context("failed to read input path")?,
    };
    let root = util::validate_root(&raw_input)?;

    let Some(ffmpeg) = ffmpeg else {
        dry_run(&root, &cli.extension);
        return Ok(());
    };

    let preferred = cli.output.or_else(|| util::default_output_dir(&root));
    let fallback = util::exe_dir().join(util::OUTPUT_DIR_NAME);
    let output_dir = util::prepare_output_dir(preferred, fallback)?;
    println!("Output directory: {}", output_dir.display());

    let workers = if cli.workers == 0 {
        num_cpus::get().max(1)
    } else {
        cli.workers
    };
    let mut config = BatchConfig::new(output_dir);
    config.extension = cli.extension;
    config.workers = workers;
    let remuxer = FfmpegRemuxer::new(ffmpeg, Some(Duration::from_secs(cli.timeout_secs)));

    let reporter = ProgressReporter::new("merge", ProgressConfig::new(cli.progress));
    let handle = reporter.handle();
    handle.set_stage("scanning and merging");
    let summary = batch::run_batch(&root, &config, &remuxer, &handle);
    let outcome = reporter.finish("all cache units processed");

    print_summary(&summary, &outcome);

    if cli.fail_on_error && summary.failed > 0 {
        std::process::exit(2);
    }
    Ok(())
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn prompt_for_input() -> Result<String> {
    eprintln!("Drag the cache folder (e.g. the app's 'download' directory) here and press Enter:");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line)
}

fn dry_run(root: &Path, extension: &str) {
    let mut complete = 0usize;
    let mut total = 0usize;
    for (manifest, matched) in matcher::scan(root) {
        total += 1;
        match matched {
            Ok(unit) => match unit.stream_pair() {
                Some(_) => {
                    complete += 1;
                    println!(
                        "[MATCH] {} -> {}.{} [{}]",
                        unit.unit_dir().display(),
                        unit.title.file_stem(),
                        extension.trim_start_matches('.'),
                        unit.title.kind()
                    );
                }
                None => println!(
                    "[INCOMPLETE] {} (missing {})",
                    unit.unit_dir().display(),
                    unit.missing_streams().join(", ")
                ),
            },
            Err(err) => println!("[ERROR] {}: {}", manifest.display(), err),
        }
    }
    println!("Dry run: manifests={} complete={}", total, complete);
}

fn print_summary(summary: &BatchSummary, outcome: &ProgressOutcome) {
    println!(
        "Merge summary: success={} failed={} skipped={} incomplete={} manifests={} duration={} warnings={}",
        summary.success,
        summary.failed,
        summary.skipped,
        summary.incomplete,
        summary.discovered,
        progress::format_duration(outcome.elapsed),
        outcome.warning_count,
    );
    for (manifest, reason) in &summary.failures {
        println!("  failed: {}: {}", manifest.display(), reason);
    }
    if outcome.tally.finished() < outcome.total_items {
        println!(
            "  warning: only {} of {} discovered manifests reported an outcome",
            outcome.tally.finished(),
            outcome.total_items
        );
    }
    for warning in outcome.warnings.iter().filter(|w| w.starts_with("IDLE")) {
        println!("  warning: {}", warning);
    }
}
