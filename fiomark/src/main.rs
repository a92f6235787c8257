//! fiomark command-line front end.
#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use fiomark::bench::runner::{FioRunner, locate_tool};
use fiomark::bench::{BenchmarkController, BenchmarkEvent, BenchmarkProfile, Preset, TestMode};
use fiomark::report::Report;
use fiomark_common::{BlockSize, FillPolicy, FiomarkConfig, LogConfig, Pattern, init_logging};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "fiomark")]
#[command(author, version, about = "Storage benchmarks driven through fio")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file (defaults to <config dir>/fiomark/config.toml)
    #[arg(long, global = true, env = "FIOMARK_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a benchmark battery
    Run(RunArgs),

    /// List the built-in presets
    Presets,

    /// Locate fio and print its version
    Check {
        /// fio binary to use instead of searching PATH
        #[arg(long)]
        fio: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Directory that will hold the test file
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    /// Starting point for the profile
    #[arg(short, long, default_value = "default")]
    preset: Preset,

    /// Add the sequential and random mix patterns
    #[arg(long)]
    mix: bool,

    /// Keep only reads or only writes
    #[arg(long, default_value = "read-write")]
    mode: TestMode,

    /// Patterns to run, overriding the preset (e.g. seq-read,rnd-write)
    #[arg(long = "pattern", value_delimiter = ',')]
    patterns: Vec<Pattern>,

    /// Block sizes, overriding the preset (e.g. 1M,4K)
    #[arg(short, long = "block-size", value_delimiter = ',')]
    block_sizes: Vec<BlockSize>,

    /// I/O queue depth
    #[arg(short, long)]
    queue_depth: Option<u32>,

    /// Number of fio threads
    #[arg(short, long)]
    threads: Option<u32>,

    /// Measuring time per job (e.g. 5s)
    #[arg(long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// Pause between jobs (e.g. 5s, 0s)
    #[arg(long, value_parser = humantime::parse_duration)]
    interval: Option<Duration>,

    /// Repeats per pattern and block size
    #[arg(short, long)]
    repeat: Option<u32>,

    /// Test file size (e.g. 1G, 512M)
    #[arg(long, value_parser = fiomark_common::parse_byte_size)]
    file_size: Option<u64>,

    /// Share of reads in mix patterns, in percent
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    mix_read: Option<u8>,

    /// Fill the test file with zeros instead of random data
    #[arg(long)]
    zeros: bool,

    /// fio binary to use instead of searching PATH
    #[arg(long)]
    fio: Option<PathBuf>,

    /// Leave the test file in place afterwards
    #[arg(long)]
    keep_test_file: bool,

    /// Drop the page cache before every job (needs root)
    #[arg(long)]
    flush_cache: bool,

    /// Report format
    #[arg(long, default_value = "text")]
    format: OutputFormat,

    /// Stream events as JSON lines on stdout
    #[arg(long)]
    events: bool,

    /// Also write the report to this file
    #[arg(long)]
    save: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("warn").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    let mut config = FiomarkConfig::load(cli.config.as_deref()).context("loading settings")?;
    for err in config.apply_env() {
        warn!("{err}");
    }

    match cli.command {
        Commands::Run(args) => run(config, args).await,
        Commands::Presets => {
            list_presets();
            Ok(())
        }
        Commands::Check { fio } => {
            if let Some(path) = fio {
                config.override_fio_path(path);
            }
            check(&config).await
        }
    }
}

fn build_profile(args: &RunArgs) -> BenchmarkProfile {
    let mut profile = args.preset.profile(&args.dir, args.mix, args.mode);
    if !args.patterns.is_empty() {
        profile.patterns = args.patterns.clone();
    }
    if !args.block_sizes.is_empty() {
        profile.block_sizes = args.block_sizes.clone();
    }
    if let Some(queue_depth) = args.queue_depth {
        profile.queue_depth = queue_depth;
    }
    if let Some(threads) = args.threads {
        profile.threads = threads;
    }
    if let Some(duration) = args.duration {
        profile.duration = duration;
    }
    if let Some(interval) = args.interval {
        profile.interval = interval;
    }
    if let Some(repeat) = args.repeat {
        profile.repeat_count = repeat;
    }
    if let Some(file_size) = args.file_size {
        profile.file_size = file_size;
    }
    if let Some(mix_read) = args.mix_read {
        profile.random_read_percentage = mix_read;
    }
    if args.zeros {
        profile.fill = FillPolicy::Zeros;
    }
    profile
}

async fn run(mut config: FiomarkConfig, args: RunArgs) -> Result<()> {
    if let Some(path) = &args.fio {
        config.override_fio_path(path.clone());
    }
    config.keep_test_file |= args.keep_test_file;
    config.flush_page_cache |= args.flush_cache;

    if !args.dir.is_dir() {
        bail!("{} is not a directory", args.dir.display());
    }
    let profile = build_profile(&args);

    let fio_version = match locate_tool(&config) {
        Ok(tool) => FioRunner::new(tool, &config).version().await.ok(),
        Err(_) => None,
    };

    let controller = BenchmarkController::new(config);
    let events = controller.subscribe();

    let canceller = controller.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping benchmark");
            canceller.cancel();
        }
    });

    let bar = if args.events {
        ProgressBar::hidden()
    } else {
        progress_bar(profile.job_count() as u64)
    };
    let observer = tokio::spawn(observe(events, bar, args.events));

    let outcome = controller.start(profile.clone()).await;
    if let Err(e) = observer.await {
        warn!(error = %e, "Progress observer stopped abnormally");
    }
    let summary = outcome.context("benchmark failed")?;

    let report = Report::new(&profile, &summary, fio_version.as_deref());
    let rendered = match args.format {
        OutputFormat::Text => report.to_text(),
        OutputFormat::Json => report.to_json().context("serializing report")?,
    };
    println!("{rendered}");

    if let Some(path) = &args.save {
        std::fs::write(path, &rendered)
            .with_context(|| format!("writing report to {}", path.display()))?;
        info!(path = %path.display(), "Saved report");
    }

    Ok(())
}

fn progress_bar(total_jobs: u64) -> ProgressBar {
    let bar = ProgressBar::new(total_jobs);
    let style = ProgressStyle::default_bar()
        .template("{spinner} [{elapsed_precise}] {bar:30} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

async fn observe(mut events: broadcast::Receiver<BenchmarkEvent>, bar: ProgressBar, json: bool) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event observer lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if json {
            match event.to_json_line() {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "Failed to serialize event"),
            }
        }

        match &event {
            BenchmarkEvent::Progress {
                job_index,
                total_jobs,
                label,
                elapsed,
                remaining,
            } => {
                bar.set_length(*total_jobs as u64);
                bar.set_position(*job_index as u64);
                bar.set_message(format!(
                    "{label} {}/{} sec",
                    elapsed.as_secs(),
                    elapsed.saturating_add(*remaining).as_secs()
                ));
            }
            BenchmarkEvent::Interval { elapsed, total } => {
                bar.set_message(format!(
                    "Interval time {}/{} sec",
                    elapsed.as_secs(),
                    total.as_secs()
                ));
            }
            BenchmarkEvent::ResultUpdated { .. } | BenchmarkEvent::JobFailed { .. } => bar.inc(1),
            BenchmarkEvent::StateChanged { .. } => {}
            BenchmarkEvent::Finished { .. } => {
                bar.finish_and_clear();
                break;
            }
        }
    }
}

fn list_presets() {
    for preset in Preset::ALL {
        let profile = preset.profile(".", false, TestMode::ReadWrite);
        let sizes: Vec<String> = profile.block_sizes.iter().map(|b| b.short()).collect();
        println!(
            "{:<12} {:<48} Q{}T{} [{}] {} jobs, ~{}",
            preset.name(),
            preset.description(),
            profile.queue_depth,
            profile.threads,
            sizes.join(", "),
            profile.job_count(),
            humantime::format_duration(profile.estimated_duration()),
        );
    }
}

async fn check(config: &FiomarkConfig) -> Result<()> {
    let tool = locate_tool(config)?;
    let version = FioRunner::new(tool.clone(), config).version().await?;
    let origin = match config.fio_path {
        Some(_) => format!("set by {}", config.fio_path_source),
        None => "found on PATH".to_string(),
    };
    println!("{} ({}), {}", tool.display(), version, origin);
    Ok(())
}
