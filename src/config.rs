//! Configuration for a frame pipeline run.

use crate::pipeline::{ChainMode, DeadlineBoundary, RetryConfig, RunPolicy};
use crate::sim::Operation;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source configuration
    #[serde(default)]
    pub source: SourceConfig,

    /// Stage chain configuration
    pub pipeline: PipelineConfig,

    /// Run policy configuration
    #[serde(default)]
    pub run: RunConfig,

    /// Telemetry configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Number of Tokio worker threads (null = num CPUs)
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

/// Frame source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Milliseconds between frames (0 = as fast as the pipeline accepts them)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Stop the source after this many frames
    #[serde(default)]
    pub limit: Option<u64>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            limit: None,
        }
    }
}

/// Stage chain configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How stages are chained
    #[serde(default)]
    pub mode: ChainMode,

    /// Capacity of every inter-stage buffer.
    /// Defaults to the target count (sequential) or stage concurrency (ordered).
    #[serde(default)]
    pub buffer_capacity: Option<usize>,

    /// Stages in execution order
    pub stages: Vec<StageConfig>,
}

/// One simulated stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage name used in logs and errors
    pub name: String,

    /// Maximum simultaneous calls (ordered mode only)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Simulated work per frame in milliseconds
    #[serde(default)]
    pub latency_ms: u64,

    /// Probability that a call fails (0.0-1.0)
    #[serde(default)]
    pub failure_rate: f64,

    /// Arithmetic applied to the frame value
    #[serde(default)]
    pub operation: Operation,
}

impl StageConfig {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

/// Which run policy to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    FailFast,
    RetryOnFailure,
    RetryWithDeadline,
}

/// Run policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Items to deliver per attempt (null = unbounded, deadline only)
    #[serde(default = "default_target_item_count")]
    pub target_item_count: Option<u64>,

    /// Failure handling policy
    #[serde(default)]
    pub policy: PolicyKind,

    /// Per-attempt deadline in milliseconds (retry_with_deadline only)
    #[serde(default)]
    pub deadline_ms: Option<u64>,

    /// Whether an item landing exactly on the deadline is kept
    #[serde(default)]
    pub deadline_boundary: DeadlineBoundary,

    /// Retry limits
    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            target_item_count: default_target_item_count(),
            policy: PolicyKind::default(),
            deadline_ms: None,
            deadline_boundary: DeadlineBoundary::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl RunConfig {
    /// Resolve the configured policy.
    pub fn policy(&self) -> anyhow::Result<RunPolicy> {
        Ok(match self.policy {
            PolicyKind::FailFast => RunPolicy::FailFast,
            PolicyKind::RetryOnFailure => RunPolicy::RetryOnFailure,
            PolicyKind::RetryWithDeadline => {
                let deadline_ms = self
                    .deadline_ms
                    .ok_or_else(|| anyhow::anyhow!("retry_with_deadline requires deadline_ms"))?;
                RunPolicy::RetryWithDeadline {
                    deadline: Duration::from_millis(deadline_ms),
                }
            }
        })
    }
}

/// Retry limits for the retrying policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Maximum attempts (null = retry until success)
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Pause before the first restart in milliseconds
    #[serde(default)]
    pub initial_backoff_ms: u64,

    /// Maximum pause between restarts in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff_ms: 0,
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        RetryConfig {
            max_attempts: settings.max_attempts,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Report elapsed seconds while an attempt runs
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Reporting interval in milliseconds
    #[serde(default = "default_telemetry_interval_ms")]
    pub interval_ms: u64,

    /// Optional path to save metrics JSON after the run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_telemetry_interval_ms(),
            metrics_output_path: None,
        }
    }
}

impl TelemetryConfig {
    /// Tick interval, if telemetry is on.
    pub fn interval(&self) -> Option<Duration> {
        (self.enabled && self.interval_ms > 0).then(|| Duration::from_millis(self.interval_ms))
    }
}

impl Default for Config {
    /// Thirty seconds of 30 fps video through three stages of uneven cost.
    fn default() -> Self {
        let stage = |name: &str, latency_ms, failure_rate| StageConfig {
            name: name.to_string(),
            concurrency: 1,
            latency_ms,
            failure_rate,
            operation: Operation::Identity,
        };

        Self {
            source: SourceConfig::default(),
            pipeline: PipelineConfig {
                mode: ChainMode::Sequential,
                buffer_capacity: None,
                stages: vec![
                    stage("p1", 10, 0.0001),
                    stage("p2", 20, 0.0001),
                    stage("p3", 44, 0.001),
                ],
            },
            run: RunConfig {
                policy: PolicyKind::RetryOnFailure,
                ..RunConfig::default()
            },
            telemetry: TelemetryConfig::default(),
            worker_threads: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                // Try YAML first (it's a superset of JSON)
                serde_yaml::from_str(&contents)?
            }
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn source_interval(&self) -> Duration {
        Duration::from_millis(self.source.interval_ms)
    }

    /// Apply a concurrency override to every stage.
    pub fn set_concurrency(&mut self, concurrency: usize) {
        for stage in &mut self.pipeline.stages {
            stage.concurrency = concurrency;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pipeline.stages.is_empty() {
            anyhow::bail!("At least one stage is required");
        }
        for stage in &self.pipeline.stages {
            if stage.concurrency == 0 {
                anyhow::bail!("Stage '{}': concurrency must be > 0", stage.name);
            }
            if !(0.0..=1.0).contains(&stage.failure_rate) {
                anyhow::bail!("Stage '{}': failure_rate must be between 0 and 1", stage.name);
            }
        }
        if self.pipeline.buffer_capacity == Some(0) {
            anyhow::bail!("Buffer capacity must be > 0");
        }

        match self.run.policy {
            PolicyKind::RetryWithDeadline => match self.run.deadline_ms {
                None => anyhow::bail!("retry_with_deadline requires deadline_ms"),
                Some(0) => anyhow::bail!("deadline_ms must be > 0"),
                Some(_) => {}
            },
            _ => {
                if self.run.target_item_count.is_none() && self.source.limit.is_none() {
                    anyhow::bail!("A target_item_count or source limit is required without a deadline");
                }
            }
        }
        if self.run.target_item_count == Some(0) {
            anyhow::bail!("target_item_count must be > 0");
        }
        if self.run.retry.max_attempts == Some(0) {
            anyhow::bail!("max_attempts must be > 0");
        }
        if self.run.retry.initial_backoff_ms > self.run.retry.max_backoff_ms {
            anyhow::bail!("initial_backoff_ms must not exceed max_backoff_ms");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_interval_ms() -> u64 { 30 }
fn default_concurrency() -> usize { 1 }
fn default_target_item_count() -> Option<u64> { Some(900) }
fn default_max_backoff_ms() -> u64 { 10_000 }
fn default_true() -> bool { true }
fn default_telemetry_interval_ms() -> u64 { 1000 }

#[cfg(test)]
mod tests {
    use super::*;

    const ORDERED_YAML: &str = r#"
source:
  interval_ms: 0
pipeline:
  mode: ordered
  stages:
    - name: add
      concurrency: 3
      latency_ms: 30
      operation: { op: add, operand: 1 }
    - name: double
      concurrency: 3
      latency_ms: 30
      operation: { op: mul, operand: 2 }
run:
  target_item_count: 20
  policy: retry_on_failure
  retry:
    max_attempts: 5
"#;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline.stages.len(), 3);
        assert_eq!(config.run.target_item_count, Some(900));
    }

    #[test]
    fn test_parse_yaml() {
        let config = Config::from_yaml(ORDERED_YAML).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline.mode, ChainMode::Ordered);
        assert_eq!(config.pipeline.stages[1].operation, Operation::Mul(2));
        assert_eq!(config.run.policy, PolicyKind::RetryOnFailure);
        assert_eq!(config.run.retry.max_attempts, Some(5));
        assert_eq!(config.run.deadline_boundary, DeadlineBoundary::Inclusive);
        assert!(config.telemetry.enabled);
    }

    #[test]
    fn test_yaml_round_trip_through_json() {
        let config = Config::from_yaml(ORDERED_YAML).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.pipeline.stages[0].name, "add");
        assert_eq!(parsed.run.target_item_count, Some(20));
    }

    #[test]
    fn test_deadline_policy_requires_deadline() {
        let mut config = Config::default();
        config.run.policy = PolicyKind::RetryWithDeadline;
        assert!(config.validate().is_err());
        assert!(config.run.policy().is_err());

        config.run.deadline_ms = Some(30_000);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.run.policy().unwrap(),
            RunPolicy::RetryWithDeadline {
                deadline: Duration::from_secs(30)
            }
        );
    }

    #[test]
    fn test_validation_rejects_bad_stages() {
        let mut config = Config::default();
        config.pipeline.stages[0].concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.stages[1].failure_rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.stages.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unbounded_run_needs_a_limit() {
        let mut config = Config::default();
        config.run.target_item_count = None;
        assert!(config.validate().is_err());

        config.source.limit = Some(100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_concurrency_override() {
        let mut config = Config::default();
        config.set_concurrency(4);
        assert!(config.pipeline.stages.iter().all(|s| s.concurrency == 4));
    }

    #[test]
    fn test_telemetry_interval() {
        let mut telemetry = TelemetryConfig::default();
        assert_eq!(telemetry.interval(), Some(Duration::from_secs(1)));
        telemetry.enabled = false;
        assert_eq!(telemetry.interval(), None);
    }

    #[test]
    fn test_retry_settings_conversion() {
        let settings = RetrySettings {
            max_attempts: Some(3),
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
        };
        let retry = RetryConfig::from(&settings);
        assert_eq!(retry.max_attempts, Some(3));
        assert_eq!(retry.initial_backoff, Duration::from_millis(100));
    }
}
