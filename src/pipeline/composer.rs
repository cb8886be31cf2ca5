//! Wiring of source, stages, sequencers and sink for one attempt.
//!
//! Two chain layouts are supported:
//!
//! ```text
//! sequential:  source ─▶[buf]─▶ stage ─▶[buf]─▶ stage ─▶[buf]─▶ sink
//!
//! ordered:     source ─▶ stage×W ─▶ sequencer ─▶ stage×W ─▶ sequencer ─▶ sink
//! ```
//!
//! In sequential mode every stage runs a single worker and the buffers
//! between stages hold up to the target count, so a slow later stage does
//! not stall an earlier one. In ordered mode each stage runs its full
//! concurrency and a sequencer restores arrival order before the next stage.
//!
//! Indices are assigned once, as items leave the source. Nothing
//! downstream re-tags.

use crate::error::{PipelineError, Result};
use crate::pipeline::{spawn_sequencer, Metrics, ReleaseWindow, Source, Stage, Tagged};
use async_channel::Sender;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Buffer capacity used when neither a capacity nor a target is known.
pub const DEFAULT_BUFFER_CAPACITY: usize = 64;

/// Upper bound for any inter-stage buffer.
pub const MAX_BUFFER_CAPACITY: usize = 65_536;

/// Deadline comparison used unless configured otherwise.
pub const DEFAULT_DEADLINE_BOUNDARY: DeadlineBoundary = DeadlineBoundary::Inclusive;

/// How stages are chained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainMode {
    /// One call at a time per stage, stages decoupled by buffers.
    #[default]
    Sequential,
    /// Concurrent stages, each followed by a sequencer.
    Ordered,
}

impl std::fmt::Display for ChainMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainMode::Sequential => write!(f, "sequential"),
            ChainMode::Ordered => write!(f, "ordered"),
        }
    }
}

/// Whether an item landing exactly on the deadline is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineBoundary {
    /// Keep items with `elapsed <= deadline`.
    #[default]
    Inclusive,
    /// Keep items with `elapsed < deadline`.
    Exclusive,
}

impl DeadlineBoundary {
    pub fn admits(self, elapsed: Duration, deadline: Duration) -> bool {
        match self {
            DeadlineBoundary::Inclusive => elapsed <= deadline,
            DeadlineBoundary::Exclusive => elapsed < deadline,
        }
    }
}

/// What ends a single attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttemptLimits {
    /// Stop after delivering this many items.
    pub target: Option<u64>,
    /// Stop accepting output this long after the attempt started.
    pub deadline: Option<Duration>,
    pub boundary: DeadlineBoundary,
}

impl AttemptLimits {
    pub fn target(target: u64) -> Self {
        Self {
            target: Some(target),
            ..Default::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_boundary(mut self, boundary: DeadlineBoundary) -> Self {
        self.boundary = boundary;
        self
    }
}

/// Why an attempt stopped collecting output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TargetReached,
    DeadlineReached,
    /// The source ran dry before any other limit was hit.
    SourceExhausted,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::TargetReached => write!(f, "target reached"),
            StopReason::DeadlineReached => write!(f, "deadline reached"),
            StopReason::SourceExhausted => write!(f, "source exhausted"),
        }
    }
}

/// Items collected by one successful attempt, in arrival order.
#[derive(Debug)]
pub struct AttemptOutput<V> {
    pub items: Vec<V>,
    pub stop: StopReason,
    pub elapsed: Duration,
}

/// A composed chain of stages.
pub struct Pipeline<V> {
    stages: Vec<Stage<V>>,
    mode: ChainMode,
    buffer_capacity: Option<usize>,
    metrics: Arc<Metrics>,
}

impl<V> Clone for Pipeline<V> {
    fn clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
            mode: self.mode,
            buffer_capacity: self.buffer_capacity,
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<V: Send + 'static> Pipeline<V> {
    pub fn builder() -> PipelineBuilder<V> {
        PipelineBuilder::default()
    }

    pub fn mode(&self) -> ChainMode {
        self.mode
    }

    pub fn stages(&self) -> &[Stage<V>] {
        &self.stages
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn buffer_for(&self, limits: &AttemptLimits, stage: &Stage<V>) -> usize {
        let capacity = match self.mode {
            ChainMode::Sequential => self
                .buffer_capacity
                .or(limits.target.map(|t| usize::try_from(t).unwrap_or(usize::MAX)))
                .unwrap_or(DEFAULT_BUFFER_CAPACITY),
            ChainMode::Ordered => self.buffer_capacity.unwrap_or(stage.concurrency()),
        };
        capacity.clamp(1, MAX_BUFFER_CAPACITY)
    }

    /// Run one attempt to completion.
    ///
    /// Cancelling `cancel` aborts the attempt with [`PipelineError::Cancelled`].
    /// On any error nothing collected so far is returned.
    pub async fn run_attempt(
        &self,
        source: &dyn Source<V>,
        limits: &AttemptLimits,
        cancel: &CancellationToken,
    ) -> Result<AttemptOutput<V>> {
        let Some(first) = self.stages.first() else {
            return Err(PipelineError::InvalidConfig(
                "Pipeline has no stages".to_string(),
            ));
        };

        let run_token = cancel.child_token();
        let started = Instant::now();
        let mut components: Vec<(String, JoinHandle<Result<()>>)> = Vec::new();

        let (source_tx, mut rx) = async_channel::bounded(self.buffer_for(limits, first));
        components.push((
            "source".to_string(),
            spawn_feeder(
                source.open(),
                source_tx,
                limits.target,
                run_token.clone(),
                Arc::clone(&self.metrics),
            ),
        ));

        for stage in &self.stages {
            let capacity = self.buffer_for(limits, stage);
            let (stage_tx, stage_rx) = async_channel::bounded(capacity);

            match self.mode {
                ChainMode::Sequential => {
                    let handle = stage.spawn(
                        1,
                        rx,
                        stage_tx,
                        None,
                        run_token.clone(),
                        Arc::clone(&self.metrics),
                    );
                    components.push((stage.name().to_string(), handle));
                    rx = stage_rx;
                }
                ChainMode::Ordered => {
                    let window = ReleaseWindow::new(stage.concurrency());
                    let handle = stage.spawn(
                        stage.concurrency(),
                        rx,
                        stage_tx,
                        Some(window.clone()),
                        run_token.clone(),
                        Arc::clone(&self.metrics),
                    );
                    components.push((stage.name().to_string(), handle));

                    let (ordered_tx, ordered_rx) = async_channel::bounded(capacity);
                    let sequencer = spawn_sequencer(
                        stage.name().to_string(),
                        stage_rx,
                        ordered_tx,
                        Some(window),
                        run_token.clone(),
                        Arc::clone(&self.metrics),
                    );
                    components.push((format!("{} sequencer", stage.name()), sequencer));
                    rx = ordered_rx;
                }
            }
        }

        tracing::debug!(
            "Attempt wired: {} stages, {} mode, target {:?}, deadline {:?}",
            self.stages.len(),
            self.mode,
            limits.target,
            limits.deadline
        );

        let deadline_at = limits.deadline.map(|d| started + d);
        let sleep = tokio::time::sleep_until(deadline_at.unwrap_or(started));
        tokio::pin!(sleep);

        let mut items = Vec::new();
        let stop = loop {
            if limits.target.is_some_and(|t| items.len() as u64 >= t) {
                break Some(StopReason::TargetReached);
            }

            let received = tokio::select! {
                biased;
                _ = run_token.cancelled() => break None,
                received = rx.recv() => received,
                _ = &mut sleep, if deadline_at.is_some() => break Some(StopReason::DeadlineReached),
            };

            let Ok(tagged) = received else {
                break Some(StopReason::SourceExhausted);
            };

            if let Some(deadline) = limits.deadline {
                if !limits.boundary.admits(started.elapsed(), deadline) {
                    break Some(StopReason::DeadlineReached);
                }
            }

            tracing::trace!("Delivered item {}", tagged.index);
            self.metrics.add_item_delivered();
            items.push(tagged.into_value());
        };

        // Stops the source and abandons whatever is still in flight.
        run_token.cancel();
        drop(rx);

        let mut failure: Option<PipelineError> = None;
        for (component, handle) in components {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(PipelineError::StageTask {
                    stage: component,
                    message: e.to_string(),
                }),
            };
            if let Err(e) = result {
                failure = Some(match failure.take() {
                    Some(prev) if prev.is_retryable() && !e.is_retryable() => e,
                    Some(prev) => prev,
                    None => e,
                });
            }
        }

        let stop = match settle(stop, failure) {
            Ok(stop) => stop,
            Err(e) => {
                tracing::debug!("Attempt discarded {} collected items", items.len());
                return Err(e);
            }
        };

        Ok(AttemptOutput {
            items,
            stop,
            elapsed: started.elapsed(),
        })
    }
}

/// Decide an attempt's outcome from the collector's stop and any component
/// failure.
///
/// A transformation that fails after the collector already stopped on its
/// target or deadline raced the shutdown; the items collected are complete
/// and the failure is ignored. Faults that are not retryable always win.
fn settle(stop: Option<StopReason>, failure: Option<PipelineError>) -> Result<StopReason> {
    match (stop, failure) {
        (Some(stop @ (StopReason::TargetReached | StopReason::DeadlineReached)), Some(e))
            if e.is_retryable() =>
        {
            tracing::debug!("Ignoring failure after the attempt stopped ({}): {}", stop, e);
            Ok(stop)
        }
        (_, Some(e)) => Err(e),
        (Some(stop), None) => Ok(stop),
        (None, None) => Err(PipelineError::Cancelled),
    }
}

/// Pull from the source, tag each item with its arrival index and push it
/// into the first buffer.
fn spawn_feeder<V>(
    mut stream: BoxStream<'static, V>,
    output: Sender<Tagged<V>>,
    limit: Option<u64>,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
) -> JoinHandle<Result<()>>
where
    V: Send + 'static,
{
    tokio::spawn(async move {
        let mut index: u64 = 0;
        while limit.map_or(true, |l| index < l) {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = stream.next() => next,
            };
            let Some(value) = next else {
                break;
            };

            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = output.send(Tagged::new(index, value)) => sent,
            };
            if sent.is_err() {
                break;
            }
            metrics.add_item_sourced();
            index += 1;
        }
        tracing::trace!("Source stopped after {} items", index);
        Ok(())
    })
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder<V> {
    stages: Vec<Stage<V>>,
    mode: ChainMode,
    buffer_capacity: Option<usize>,
    metrics: Option<Arc<Metrics>>,
}

impl<V> Default for PipelineBuilder<V> {
    fn default() -> Self {
        Self {
            stages: Vec::new(),
            mode: ChainMode::default(),
            buffer_capacity: None,
            metrics: None,
        }
    }
}

impl<V: Send + 'static> PipelineBuilder<V> {
    pub fn mode(mut self, mode: ChainMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn stage(mut self, stage: Stage<V>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Override the capacity of every inter-stage buffer.
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = Some(capacity);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Pipeline<V>> {
        if self.stages.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "Pipeline needs at least one stage".to_string(),
            ));
        }
        if self.buffer_capacity == Some(0) {
            return Err(PipelineError::InvalidConfig(
                "Buffer capacity must be > 0".to_string(),
            ));
        }
        Ok(Pipeline {
            stages: self.stages,
            mode: self.mode,
            buffer_capacity: self.buffer_capacity,
            metrics: self.metrics.unwrap_or_else(Metrics::new),
        })
    }
}
