//! Staged execution with in-order reassembly.

mod composer;
mod endpoints;
mod metrics;
mod policy;
mod sequencer;
mod stage;
mod tagged;


pub use composer::{
    AttemptLimits, AttemptOutput, ChainMode, DeadlineBoundary, Pipeline, PipelineBuilder,
    StopReason, DEFAULT_BUFFER_CAPACITY, DEFAULT_DEADLINE_BOUNDARY, MAX_BUFFER_CAPACITY,
};
pub use endpoints::{ReplaySource, Sink, Source};
pub use metrics::{
    ElapsedTicker, InFlightGuard, LoggingObserver, Metrics, MetricsSnapshot, NoopObserver,
    RunObserver,
};
pub use policy::{
    AttemptRecord, AttemptState, PipelineRun, RetryConfig, RunPolicy, RunReport, RunSummary,
};
pub use sequencer::{spawn_sequencer, ReleaseWindow, ReorderBuffer, WindowSlot};
pub use stage::{FnTransform, Stage, Transform};
pub use tagged::Tagged;
