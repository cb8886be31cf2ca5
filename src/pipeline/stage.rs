//! Bounded-concurrency stage execution.
//!
//! A stage is a named transformation plus a concurrency limit. Running a
//! stage spawns that many workers sharing one input queue, so at most that
//! many transformation calls are ever in progress:
//!
//! ```text
//!              ┌──────────┐
//!          ┌──▶│ worker 1 │──┐
//! input ───┼──▶│ worker 2 │──┼───▶ output (completion order)
//!          └──▶│ worker W │──┘
//!              └──────────┘
//! ```
//!
//! Output order follows completion order. A single worker preserves input
//! order; with more than one, a sequencer must follow the stage.

use crate::error::{PipelineError, Result};
use crate::pipeline::{Metrics, ReleaseWindow, Tagged};
use async_channel::{Receiver, Sender};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A per-item transformation.
///
/// Implementations must not keep state between calls that would make the
/// result depend on which worker ran them.
pub trait Transform<V>: Send + Sync + 'static {
    fn apply(&self, value: V) -> BoxFuture<'static, anyhow::Result<V>>;
}

/// Adapter turning an async closure into a [`Transform`].
pub struct FnTransform<F>(F);

impl<V, F, Fut> Transform<V> for FnTransform<F>
where
    F: Fn(V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
{
    fn apply(&self, value: V) -> BoxFuture<'static, anyhow::Result<V>> {
        Box::pin((self.0)(value))
    }
}

/// One transformation step of a pipeline.
pub struct Stage<V> {
    name: String,
    concurrency: usize,
    transform: Arc<dyn Transform<V>>,
}

impl<V> Clone for Stage<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            concurrency: self.concurrency,
            transform: Arc::clone(&self.transform),
        }
    }
}

impl<V> std::fmt::Debug for Stage<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl<V: Send + 'static> Stage<V> {
    /// Create a stage. A concurrency of 0 is raised to 1.
    pub fn new(name: impl Into<String>, concurrency: usize, transform: impl Transform<V>) -> Self {
        Self {
            name: name.into(),
            concurrency: concurrency.max(1),
            transform: Arc::new(transform),
        }
    }

    /// Create a stage from an async closure.
    pub fn from_fn<F, Fut>(name: impl Into<String>, concurrency: usize, f: F) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        Self::new(name, concurrency, FnTransform(f))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run this stage with `workers` workers between `input` and `output`.
    ///
    /// The returned task resolves once every worker has stopped. A failed
    /// call cancels `cancel` before its worker exits, so downstream
    /// components can tell an aborted stream from a finished one. Calls still
    /// running at cancellation are dropped.
    ///
    /// With a `window`, a worker takes a slot before pulling each item and
    /// keeps it once the result is sent, so the stage runs at most the
    /// window's size ahead of the sequencer that releases those slots.
    pub fn spawn(
        &self,
        workers: usize,
        input: Receiver<Tagged<V>>,
        output: Sender<Tagged<V>>,
        window: Option<ReleaseWindow>,
        cancel: CancellationToken,
        metrics: Arc<Metrics>,
    ) -> JoinHandle<Result<()>> {
        let workers = workers.max(1);
        let mut handles = Vec::with_capacity(workers);

        for _ in 0..workers {
            let worker = Worker {
                stage: self.name.clone(),
                transform: Arc::clone(&self.transform),
                input: input.clone(),
                output: output.clone(),
                window: window.clone(),
                cancel: cancel.clone(),
                metrics: Arc::clone(&metrics),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        drop(output);

        let stage = self.name.clone();
        tokio::spawn(async move {
            let mut first_error = None;
            for handle in handles {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        cancel.cancel();
                        Err(PipelineError::StageTask {
                            stage: stage.clone(),
                            message: e.to_string(),
                        })
                    }
                };
                if let Err(e) = result {
                    first_error.get_or_insert(e);
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }
}

struct Worker<V> {
    stage: String,
    transform: Arc<dyn Transform<V>>,
    input: Receiver<Tagged<V>>,
    output: Sender<Tagged<V>>,
    window: Option<ReleaseWindow>,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
}

impl<V: Send + 'static> Worker<V> {
    async fn run(self) -> Result<()> {
        loop {
            let slot = match &self.window {
                Some(window) => {
                    let slot = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Ok(()),
                        slot = window.admit() => slot,
                    };
                    match slot {
                        Some(slot) => Some(slot),
                        None => return Ok(()),
                    }
                }
                None => None,
            };

            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                received = self.input.recv() => received,
            };
            let Ok(Tagged { index, value }) = received else {
                return Ok(());
            };

            let result = {
                let _guard = self.metrics.begin_call();
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(()),
                    result = self.transform.apply(value) => result,
                }
            };

            match result {
                Ok(value) => {
                    self.metrics.add_item_transformed();
                    let sent = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Ok(()),
                        sent = self.output.send(Tagged::new(index, value)) => sent,
                    };
                    if sent.is_err() {
                        tracing::debug!("Stage '{}' receiver dropped, stopping worker", self.stage);
                        return Ok(());
                    }
                    if let Some(slot) = slot {
                        slot.hold();
                    }
                }
                Err(source) => {
                    if self.cancel.is_cancelled() {
                        return Ok(());
                    }
                    self.metrics.add_transform_failure();
                    self.cancel.cancel();
                    let err = PipelineError::Transform {
                        stage: self.stage,
                        index,
                        source,
                    };
                    tracing::warn!("{}", err);
                    return Err(err);
                }
            }
        }
    }
}
