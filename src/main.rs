//! Frame Pipeline CLI
//!
//! Runs simulated frames through an ordered, concurrent stage chain.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use frame_pipeline::{build_runtime, compare_modes, predict_ordered, run_pipeline, Config};

#[derive(Parser)]
#[command(name = "frame-pipeline")]
#[command(about = "Run frames through an ordered concurrent stage chain", long_about = None)]
struct Cli {
    /// Path to configuration file (built-in scenario if absent)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override concurrency of every stage
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run,

    /// Run the same frames in sequential and ordered mode and compare
    Compare,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => {
            run_command(cli.config, cli.concurrency)?;
        }

        Some(Commands::Compare) => {
            compare_command(cli.config, cli.concurrency)?;
        }

        Some(Commands::Validate) => {
            validate_command(cli.config)?;
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>, concurrency: Option<usize>) -> Result<Config> {
    let mut config = match config_path {
        Some(path) => Config::from_file(&path)?,
        None => {
            tracing::info!("No configuration given, using the built-in 30 fps scenario");
            Config::default()
        }
    };

    // Apply overrides
    if let Some(c) = concurrency {
        config.set_concurrency(c);
    }

    config.validate()?;
    Ok(config)
}

fn run_command(config_path: Option<PathBuf>, concurrency: Option<usize>) -> Result<()> {
    let config = load_config(config_path, concurrency)?;

    let runtime = build_runtime(config.worker_threads)?;
    let report = runtime.block_on(async { run_pipeline(config).await })?;

    for record in &report.summary.attempts {
        println!("{}", record);
    }
    println!("Processed {} frames ({})", report.items.len(), report.summary.stop);

    Ok(())
}

fn compare_command(config_path: Option<PathBuf>, concurrency: Option<usize>) -> Result<()> {
    let config = load_config(config_path, concurrency)?;

    let runtime = build_runtime(config.worker_threads)?;
    let comparison = runtime.block_on(async { compare_modes(&config).await })?;

    println!("\n=== Sequential vs Ordered ===");
    println!("{}", comparison);
    println!("=============================\n");

    Ok(())
}

fn validate_command(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path, None)?;
    if let Some(total) = config.run.target_item_count {
        println!(
            "Predicted ordered run: {} ms for {} frames",
            predict_ordered(&config, total).as_millis(),
            total
        );
    }
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# Frame Pipeline Configuration

# === SOURCE: Where frames come from ===
source:
  # Milliseconds between frames (30 ms ~ 30 fps)
  interval_ms: 30

  # Stop the source after this many frames (omit = endless)
  # limit: 900

# === PIPELINE: The stage chain ===
pipeline:
  # sequential: one call per stage at a time
  # ordered: up to `concurrency` calls per stage, results reassembled in order
  mode: ordered

  # Capacity of every inter-stage buffer
  # Default: target_item_count (sequential) or stage concurrency (ordered)
  # buffer_capacity: 64

  stages:
    - name: p1
      concurrency: 2
      latency_ms: 10
      failure_rate: 0.0001
    - name: p2
      concurrency: 2
      latency_ms: 20
      failure_rate: 0.0001
    - name: p3
      concurrency: 2
      latency_ms: 44
      failure_rate: 0.001
      # Arithmetic applied to each frame: identity, add, sub or mul
      # operation: { op: add, operand: 1 }

# === RUN: Failure handling ===
run:
  # Frames to deliver per attempt (30 fps * 30 s)
  target_item_count: 900

  # fail_fast | retry_on_failure | retry_with_deadline
  policy: retry_on_failure

  # Per-attempt deadline, required for retry_with_deadline
  # deadline_ms: 30000

  # inclusive keeps a frame arriving exactly at the deadline
  deadline_boundary: inclusive

  retry:
    # Give up after this many attempts (omit = retry until success)
    # max_attempts: 5
    initial_backoff_ms: 0
    max_backoff_ms: 10000

# === TELEMETRY ===
telemetry:
  # Log elapsed seconds while an attempt runs
  enabled: true
  interval_ms: 1000

  # Save metrics JSON after the run
  # metrics_output_path: "metrics.json"

# Tokio async worker threads (null = num CPUs)
# worker_threads: 4
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
