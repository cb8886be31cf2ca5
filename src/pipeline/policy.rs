//! Run policies: how attempts are bounded, retried and reported.
//!
//! Every attempt moves through a small state machine:
//!
//! ```text
//! RUNNING ──▶ SUCCEEDED   target met, deadline reached cleanly, or source dry
//!    │
//!    ├──────▶ FAILED      a stage raised; retried as a brand-new attempt
//!    │                    when the policy allows it, terminal otherwise
//!    └──────▶ ABORTED     cancelled from outside; always terminal
//! ```
//!
//! Retries always restart the whole chain from a fresh source position.
//! Items from a failed attempt never reach the caller.

use crate::error::{PipelineError, Result};
use crate::pipeline::{
    AttemptLimits, DeadlineBoundary, ElapsedTicker, NoopObserver, Pipeline, RunObserver, Sink,
    Source, StopReason,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What to do when an attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPolicy {
    /// Surface the first failure.
    FailFast,
    /// Discard the attempt and start over until one succeeds.
    RetryOnFailure,
    /// Like `RetryOnFailure`, with every attempt cut off after `deadline`.
    RetryWithDeadline { deadline: Duration },
}

impl RunPolicy {
    pub fn retries(&self) -> bool {
        !matches!(self, RunPolicy::FailFast)
    }

    pub fn deadline(&self) -> Option<Duration> {
        match self {
            RunPolicy::RetryWithDeadline { deadline } => Some(*deadline),
            _ => None,
        }
    }
}

/// Limits on retrying.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Give up after this many attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Pause before the first restart. Zero restarts immediately.
    pub initial_backoff: Duration,
    /// Cap for the doubling pause.
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }
}

impl RetryConfig {
    /// Pause before restart number `step` (0 for the first restart).
    pub fn backoff(&self, step: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(step))
            .min(self.max_backoff)
    }
}

/// Terminal state of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Succeeded,
    Failed,
    Aborted,
}

/// What happened in one attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub state: AttemptState,
    /// Items collected; zero unless the attempt succeeded.
    pub items: usize,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl std::fmt::Display for AttemptRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Attempt {}: {:?} after {} ms, {} items",
            self.attempt,
            self.state,
            self.elapsed.as_millis(),
            self.items
        )?;
        if let Some(error) = &self.error {
            write!(f, " ({})", error)?;
        }
        Ok(())
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub attempts: Vec<AttemptRecord>,
    pub stop: StopReason,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let items = self.attempts.last().map_or(0, |a| a.items);
        write!(
            f,
            "{} items after {} attempt(s) in {:.1}s ({})",
            items,
            self.attempts.len(),
            self.elapsed.as_secs_f64(),
            self.stop
        )
    }
}

/// Output of a successful run.
#[derive(Debug)]
pub struct RunReport<V> {
    /// Items of the successful attempt, in arrival order.
    pub items: Vec<V>,
    pub summary: RunSummary,
}

/// One execution of a pipeline under a run policy.
pub struct PipelineRun<V> {
    pipeline: Pipeline<V>,
    policy: RunPolicy,
    retry: RetryConfig,
    target: Option<u64>,
    boundary: DeadlineBoundary,
    observer: Arc<dyn RunObserver>,
    telemetry_interval: Option<Duration>,
    cancel: CancellationToken,
}

impl<V: Send + 'static> PipelineRun<V> {
    pub fn new(pipeline: Pipeline<V>, policy: RunPolicy) -> Self {
        Self {
            pipeline,
            policy,
            retry: RetryConfig::default(),
            target: None,
            boundary: DeadlineBoundary::default(),
            observer: Arc::new(NoopObserver),
            telemetry_interval: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Deliver at most `target` items per attempt.
    pub fn with_target(mut self, target: u64) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_deadline_boundary(mut self, boundary: DeadlineBoundary) -> Self {
        self.boundary = boundary;
        self
    }

    /// Attach an observer, ticked every `interval` while an attempt runs.
    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>, interval: Option<Duration>) -> Self {
        self.observer = observer;
        self.telemetry_interval = interval;
        self
    }

    pub fn pipeline(&self) -> &Pipeline<V> {
        &self.pipeline
    }

    /// Token that aborts the run when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Abort the run. Safe to call any number of times.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Execute attempts until one succeeds or the policy gives up.
    pub async fn execute(&self, source: &dyn Source<V>) -> Result<RunReport<V>> {
        if self.target.is_none() && self.policy.deadline().is_none() {
            tracing::warn!("Run has neither a target nor a deadline; it ends only when the source does");
        }

        let limits = AttemptLimits {
            target: self.target,
            deadline: self.policy.deadline(),
            boundary: self.boundary,
        };
        let metrics = Arc::clone(self.pipeline.metrics());
        let run_start = Instant::now();
        let mut records = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            attempt += 1;
            metrics.add_attempt();
            tracing::info!("Starting attempt {} ({:?})", attempt, self.policy);

            let attempt_start = Instant::now();
            let ticker = ElapsedTicker::start(
                Arc::clone(&self.observer),
                attempt,
                self.telemetry_interval,
            );
            let result = self.pipeline.run_attempt(source, &limits, &self.cancel).await;

            let (record, outcome) = match result {
                Ok(output) => {
                    let record = AttemptRecord {
                        attempt,
                        state: AttemptState::Succeeded,
                        items: output.items.len(),
                        elapsed: output.elapsed,
                        error: None,
                    };
                    (record, Ok(output))
                }
                Err(e) => {
                    let state = match e {
                        PipelineError::Cancelled => AttemptState::Aborted,
                        _ => AttemptState::Failed,
                    };
                    let record = AttemptRecord {
                        attempt,
                        state,
                        items: 0,
                        elapsed: attempt_start.elapsed(),
                        error: Some(e.to_string()),
                    };
                    (record, Err(e))
                }
            };
            records.push(record.clone());
            ticker.finish(record).await;

            let err = match outcome {
                Ok(output) => {
                    tracing::info!(
                        "Attempt {} succeeded: {} items in {} ms ({})",
                        attempt,
                        output.items.len(),
                        output.elapsed.as_millis(),
                        output.stop
                    );
                    return Ok(RunReport {
                        items: output.items,
                        summary: RunSummary {
                            attempts: records,
                            stop: output.stop,
                            elapsed: run_start.elapsed(),
                        },
                    });
                }
                Err(e) => e,
            };

            if matches!(err, PipelineError::Cancelled) {
                tracing::info!("Attempt {} aborted", attempt);
                return Err(err);
            }

            metrics.add_attempt_failed();

            if !self.policy.retries() {
                return Err(err);
            }
            if !err.is_retryable() {
                tracing::error!("Attempt {} hit a fatal fault, not retrying: {}", attempt, err);
                return Err(err);
            }
            if self.retry.max_attempts.is_some_and(|max| attempt >= max) {
                return Err(PipelineError::AttemptsExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let backoff = self.retry.backoff(attempt - 1);
            tracing::warn!(
                "Attempt {} failed: {}. Restarting from a fresh source position in {} ms",
                attempt,
                err,
                backoff.as_millis()
            );
            if !backoff.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    /// Execute the run and hand the successful attempt's items to `sink`.
    pub async fn execute_into<S>(&self, source: &dyn Source<V>, sink: &mut S) -> Result<RunSummary>
    where
        S: Sink<V> + ?Sized,
    {
        let report = self.execute(source).await?;
        for item in report.items {
            sink.deliver(item).map_err(PipelineError::Sink)?;
        }
        Ok(report.summary)
    }
}
