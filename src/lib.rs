//! Frame Pipeline
//!
//! Runs a stream of items through a chain of asynchronous stages, optionally
//! with several simultaneous calls per stage, while delivering results in the
//! exact order the source produced them.
//!
//! # Architecture
//!
//! The pipeline consists of:
//!
//! - **Pipeline**: stages, sequencers, the chain composer and run policies
//! - **Sim**: a paced frame source and latency-bound simulated stage work
//! - **Config**: YAML/JSON run configuration
//!
//! # Usage
//!
//! ```no_run
//! use frame_pipeline::{Config, run_pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let report = run_pipeline(config).await?;
//!     println!("{}", report.summary);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod sim;

pub use config::Config;
pub use error::PipelineError;
pub use pipeline::{
    ChainMode, LoggingObserver, Metrics, Pipeline, PipelineRun, RunPolicy, RunReport, Stage,
};
pub use sim::{Frame, FrameSource, SimulatedTransform};

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Build the stage chain described by `config`.
pub fn build_pipeline(config: &Config, metrics: Arc<Metrics>) -> Result<Pipeline<Frame>> {
    let mut builder = Pipeline::builder()
        .mode(config.pipeline.mode)
        .metrics(metrics);

    for stage in &config.pipeline.stages {
        let transform = SimulatedTransform::new(stage.name.clone(), stage.latency())
            .with_failure_rate(stage.failure_rate)
            .with_operation(stage.operation);
        builder = builder.stage(Stage::new(stage.name.clone(), stage.concurrency, transform));
    }
    if let Some(capacity) = config.pipeline.buffer_capacity {
        builder = builder.buffer_capacity(capacity);
    }

    Ok(builder.build()?)
}

/// Wrap `pipeline` in the run policy, target and retry limits from `config`.
pub fn build_run(config: &Config, pipeline: Pipeline<Frame>) -> Result<PipelineRun<Frame>> {
    let mut run = PipelineRun::new(pipeline, config.run.policy()?)
        .with_retry((&config.run.retry).into())
        .with_deadline_boundary(config.run.deadline_boundary);

    if let Some(target) = config.run.target_item_count {
        run = run.with_target(target);
    }
    if let Some(interval) = config.telemetry.interval() {
        run = run.with_observer(Arc::new(LoggingObserver), Some(interval));
    }

    Ok(run)
}

/// The frame source described by `config`.
pub fn build_source(config: &Config) -> FrameSource {
    let source = FrameSource::new(config.source_interval());
    match config.source.limit {
        Some(limit) => source.with_limit(limit),
        None => source,
    }
}

/// Run the configured pipeline to completion.
pub async fn run_pipeline(config: Config) -> Result<RunReport<Frame>> {
    config.validate()?;

    tracing::info!("Starting frame pipeline");
    tracing::info!(
        "{} stages in {} mode, source every {} ms",
        config.pipeline.stages.len(),
        config.pipeline.mode,
        config.source.interval_ms
    );

    let metrics = Metrics::new();
    let pipeline = build_pipeline(&config, metrics.clone())?;
    let run = build_run(&config, pipeline)?;
    let source = build_source(&config);

    let result = run.execute(&source).await;

    let snapshot = metrics.snapshot();
    tracing::info!("{}", snapshot);
    if let Some(path) = &config.telemetry.metrics_output_path {
        if let Err(e) = snapshot.save_to_file(path) {
            tracing::warn!("Failed to save metrics to {}: {}", path, e);
        }
    }

    let report = result?;
    tracing::info!("Pipeline complete: {}", report.summary);
    Ok(report)
}

/// Outcome of one mode in a comparison.
#[derive(Debug, Clone, Serialize)]
pub struct ModeResult {
    pub mode: ChainMode,
    pub items: usize,
    pub elapsed: Duration,
}

/// Sequential and ordered runs of the same configuration, side by side.
#[derive(Debug, Clone, Serialize)]
pub struct ModeComparison {
    pub sequential: ModeResult,
    pub ordered: ModeResult,
    /// Expected ordered-mode duration from stage latencies alone
    pub predicted_ordered: Duration,
}

impl std::fmt::Display for ModeComparison {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Sequential: {} items in {} ms",
            self.sequential.items,
            self.sequential.elapsed.as_millis()
        )?;
        writeln!(
            f,
            "Ordered:    {} items in {} ms",
            self.ordered.items,
            self.ordered.elapsed.as_millis()
        )?;
        write!(f, "Predicted ordered: {} ms", self.predicted_ordered.as_millis())
    }
}

/// Predicted duration of an ordered run over `total` items.
///
/// The first item pays every stage's latency; after that the chain emits one
/// item per period of its slowest link, which is either the source or the
/// stage with the highest latency per worker.
pub fn predict_ordered(config: &Config, total: u64) -> Duration {
    let first: Duration = config.pipeline.stages.iter().map(|s| s.latency()).sum();
    let bottleneck = config
        .pipeline
        .stages
        .iter()
        .map(|s| s.latency() / u32::try_from(s.concurrency.max(1)).unwrap_or(u32::MAX))
        .chain(std::iter::once(config.source_interval()))
        .max()
        .unwrap_or_default();
    let rest = u32::try_from(total.saturating_sub(1)).unwrap_or(u32::MAX);
    first + bottleneck.saturating_mul(rest)
}

/// Run the configured frames through sequential mode, then ordered mode.
pub async fn compare_modes(config: &Config) -> Result<ModeComparison> {
    config.validate()?;

    let total = config
        .run
        .target_item_count
        .or(config.source.limit)
        .ok_or_else(|| anyhow::anyhow!("Comparison needs a target_item_count or source limit"))?;

    let mut results = Vec::with_capacity(2);
    for mode in [ChainMode::Sequential, ChainMode::Ordered] {
        let mut mode_config = config.clone();
        mode_config.pipeline.mode = mode;

        let pipeline = build_pipeline(&mode_config, Metrics::new())?;
        let run = build_run(&mode_config, pipeline)?;
        let source = build_source(&mode_config);

        tracing::info!("Comparing {} mode over {} frames", mode, total);
        let report = run.execute(&source).await?;
        results.push(ModeResult {
            mode,
            items: report.items.len(),
            elapsed: report.summary.elapsed,
        });
    }

    let ordered = results.pop().ok_or_else(|| anyhow::anyhow!("missing ordered result"))?;
    let sequential = results.pop().ok_or_else(|| anyhow::anyhow!("missing sequential result"))?;

    Ok(ModeComparison {
        sequential,
        ordered,
        predicted_ordered: predict_ordered(config, total),
    })
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PolicyKind, StageConfig};
    use crate::sim::Operation;

    fn fast_config() -> Config {
        let stage = |name: &str, operation| StageConfig {
            name: name.to_string(),
            concurrency: 3,
            latency_ms: 30,
            failure_rate: 0.0,
            operation,
        };
        let mut config = Config::default();
        config.source.interval_ms = 0;
        config.pipeline.stages = vec![
            stage("add", Operation::Add(1)),
            stage("double", Operation::Mul(2)),
        ];
        config.run.target_item_count = Some(12);
        config.run.policy = PolicyKind::FailFast;
        config.telemetry.enabled = false;
        config
    }

    #[test]
    fn test_predict_ordered() {
        let config = fast_config();
        // 60 ms for the first frame, then one frame every 10 ms
        assert_eq!(predict_ordered(&config, 12), Duration::from_millis(60 + 11 * 10));
        assert_eq!(predict_ordered(&config, 1), Duration::from_millis(60));
    }

    #[test]
    fn test_predict_ordered_source_bound() {
        let mut config = fast_config();
        config.source.interval_ms = 50;
        assert_eq!(predict_ordered(&config, 3), Duration::from_millis(60 + 2 * 50));
    }

    #[test]
    fn test_predict_ordered_huge_concurrency() {
        let mut config = fast_config();
        config.set_concurrency(usize::MAX);
        assert!(config.validate().is_ok());
        // Per-worker latency rounds down to zero; the source interval is 0 ms too
        assert_eq!(predict_ordered(&config, 12), Duration::from_millis(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_pipeline_applies_operations() {
        let report = run_pipeline(fast_config()).await.unwrap();
        let values: Vec<i64> = report.items.iter().map(|f| f.value).collect();
        let expected: Vec<i64> = (0..12).map(|i| (i + 1) * 2).collect();
        assert_eq!(values, expected);
        assert_eq!(report.summary.attempt_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_modes() {
        let comparison = compare_modes(&fast_config()).await.unwrap();
        assert_eq!(comparison.sequential.items, 12);
        assert_eq!(comparison.ordered.items, 12);
        assert!(comparison.ordered.elapsed < comparison.sequential.elapsed);
    }

    #[test]
    fn test_build_pipeline_rejects_invalid_capacity() {
        let mut config = fast_config();
        config.pipeline.buffer_capacity = Some(0);
        assert!(build_pipeline(&config, Metrics::new()).is_err());
    }
}
