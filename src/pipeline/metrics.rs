//! Run telemetry: counters, snapshots and the per-attempt elapsed ticker.

use crate::pipeline::AttemptRecord;
use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for the pipeline.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Items pulled from the source and tagged
    pub items_sourced: AtomicU64,

    /// Successful transformation calls, across all stages
    pub items_transformed: AtomicU64,

    /// Items handed past the final stage
    pub items_delivered: AtomicU64,

    /// Transformation calls that returned an error
    pub transform_failures: AtomicU64,

    /// Attempts started
    pub attempts: AtomicU64,

    /// Attempts that ended in failure
    pub attempts_failed: AtomicU64,

    /// Transformation calls currently running
    in_flight: AtomicUsize,

    /// Most transformation calls ever running at once
    pub peak_in_flight: AtomicUsize,

    /// Most items ever held by a single reorder buffer
    pub peak_reorder_depth: AtomicUsize,

    /// Start time
    start_time: Option<Instant>,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_item_sourced(&self) {
        self.items_sourced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_item_transformed(&self) {
        self.items_transformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_item_delivered(&self) {
        self.items_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_transform_failure(&self) {
        self.transform_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_attempt_failed(&self) {
        self.attempts_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a transformation call as running until the guard drops.
    ///
    /// The guard also covers calls abandoned mid-flight by cancellation.
    pub fn begin_call(self: &Arc<Self>) -> InFlightGuard {
        let active = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(active, Ordering::SeqCst);
        InFlightGuard {
            metrics: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn record_reorder_depth(&self, depth: usize) {
        self.peak_reorder_depth.fetch_max(depth, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get delivered items per second.
    pub fn items_per_second(&self) -> f64 {
        let items = self.items_delivered.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            items as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_sourced: self.items_sourced.load(Ordering::Relaxed),
            items_transformed: self.items_transformed.load(Ordering::Relaxed),
            items_delivered: self.items_delivered.load(Ordering::Relaxed),
            transform_failures: self.transform_failures.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            attempts_failed: self.attempts_failed.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
            peak_reorder_depth: self.peak_reorder_depth.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            items_per_second: self.items_per_second(),
        }
    }
}

/// Keeps a transformation call counted as in flight.
pub struct InFlightGuard {
    metrics: Arc<Metrics>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub items_sourced: u64,
    pub items_transformed: u64,
    pub items_delivered: u64,
    pub transform_failures: u64,
    pub attempts: u64,
    pub attempts_failed: u64,
    /// Highest number of simultaneous transformation calls
    pub peak_in_flight: usize,
    /// Highest reorder buffer occupancy seen by any sequencer
    pub peak_reorder_depth: usize,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub items_per_second: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Items: {} sourced, {} transformed, {} delivered | \
             Rate: {:.1} items/s | Failures: {} | Attempts: {} ({} failed) | \
             Peak in flight: {} | Peak reorder depth: {} | Elapsed: {:.1}s",
            self.items_sourced,
            self.items_transformed,
            self.items_delivered,
            self.items_per_second,
            self.transform_failures,
            self.attempts,
            self.attempts_failed,
            self.peak_in_flight,
            self.peak_reorder_depth,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Observer of a run's lifecycle.
///
/// Observers are purely informational. Every callback runs on the ticker
/// task of the attempt, so a panicking observer only takes that task down.
pub trait RunObserver: Send + Sync + 'static {
    fn on_attempt_start(&self, _attempt: u32) {}

    /// Called every telemetry interval with the time since the attempt began.
    fn on_tick(&self, _attempt: u32, _elapsed: Duration) {}

    fn on_attempt_end(&self, _record: &AttemptRecord) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// Observer that logs elapsed seconds and attempt outcomes.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl RunObserver for LoggingObserver {
    fn on_attempt_start(&self, attempt: u32) {
        tracing::info!("Attempt {} started", attempt);
    }

    fn on_tick(&self, attempt: u32, elapsed: Duration) {
        tracing::info!("[attempt {}] {}s", attempt, elapsed.as_secs());
    }

    fn on_attempt_end(&self, record: &AttemptRecord) {
        tracing::info!("{}", record);
    }
}

/// Per-attempt periodic reporter.
///
/// Started when an attempt begins and stopped when it ends, so the elapsed
/// count restarts from zero on every retry.
pub struct ElapsedTicker {
    shutdown: oneshot::Sender<AttemptRecord>,
    handle: JoinHandle<()>,
}

impl ElapsedTicker {
    /// Start reporting for `attempt`. With no `period`, only the start and
    /// end callbacks fire.
    pub fn start(observer: Arc<dyn RunObserver>, attempt: u32, period: Option<Duration>) -> Self {
        let (shutdown, mut shutdown_rx) = oneshot::channel::<AttemptRecord>();

        let handle = tokio::spawn(async move {
            observer.on_attempt_start(attempt);
            let started = tokio::time::Instant::now();

            let record = match period.filter(|p| !p.is_zero()) {
                Some(period) => {
                    let mut ticker = interval_at(started + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            record = &mut shutdown_rx => break record,
                            _ = ticker.tick() => observer.on_tick(attempt, started.elapsed()),
                        }
                    }
                }
                None => shutdown_rx.await,
            };

            if let Ok(record) = record {
                observer.on_attempt_end(&record);
            }
        });

        Self { shutdown, handle }
    }

    /// Stop the ticker, handing it the final record of the attempt.
    pub async fn finish(self, record: AttemptRecord) {
        let _ = self.shutdown.send(record);
        if let Err(e) = self.handle.await {
            tracing::warn!("Run observer failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::AttemptState;
    use std::sync::Mutex;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.add_item_delivered();
        metrics.add_item_delivered();
        metrics.add_transform_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.items_delivered, 2);
        assert_eq!(snapshot.transform_failures, 1);
    }

    #[test]
    fn test_in_flight_guard_tracks_peak() {
        let metrics = Metrics::new();

        let a = metrics.begin_call();
        let b = metrics.begin_call();
        assert_eq!(metrics.in_flight(), 2);
        drop(a);
        let c = metrics.begin_call();
        drop(b);
        drop(c);

        assert_eq!(metrics.in_flight(), 0);
        assert_eq!(metrics.snapshot().peak_in_flight, 2);
    }

    #[test]
    fn test_reorder_depth_keeps_maximum() {
        let metrics = Metrics::new();
        metrics.record_reorder_depth(3);
        metrics.record_reorder_depth(1);
        assert_eq!(metrics.snapshot().peak_reorder_depth, 3);
    }

    #[test]
    fn test_zero_elapsed_no_panic() {
        let metrics = Metrics {
            start_time: None,
            ..Default::default()
        };
        metrics.add_item_delivered();
        assert_eq!(metrics.items_per_second(), 0.0);
    }

    #[test]
    fn test_snapshot_display() {
        let metrics = Metrics::new();
        metrics.add_attempt();
        metrics.add_attempt();
        metrics.add_attempt_failed();

        let display = format!("{}", metrics.snapshot());
        assert!(display.contains("Attempts: 2 (1 failed)"));
    }

    #[test]
    fn test_snapshot_serializes_elapsed_as_seconds() {
        let snapshot = Metrics::default().snapshot();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["elapsed"], serde_json::json!(0.0));
        assert_eq!(json["items_delivered"], serde_json::json!(0));
    }

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<String>>,
    }

    impl RunObserver for Recording {
        fn on_attempt_start(&self, attempt: u32) {
            self.events.lock().unwrap().push(format!("start {}", attempt));
        }

        fn on_tick(&self, _attempt: u32, elapsed: Duration) {
            self.events
                .lock()
                .unwrap()
                .push(format!("tick {}", elapsed.as_secs()));
        }

        fn on_attempt_end(&self, record: &AttemptRecord) {
            self.events
                .lock()
                .unwrap()
                .push(format!("end {}", record.attempt));
        }
    }

    fn record(attempt: u32) -> AttemptRecord {
        AttemptRecord {
            attempt,
            state: AttemptState::Succeeded,
            items: 0,
            elapsed: Duration::ZERO,
            error: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_reports_elapsed_seconds() {
        let observer = Arc::new(Recording::default());
        let ticker = ElapsedTicker::start(observer.clone(), 1, Some(Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        ticker.finish(record(1)).await;

        let events = observer.events.lock().unwrap().clone();
        assert_eq!(events, vec!["start 1", "tick 1", "tick 2", "tick 3", "end 1"]);
    }

    struct Panicking;

    impl RunObserver for Panicking {
        fn on_tick(&self, _attempt: u32, _elapsed: Duration) {
            panic!("observer bug");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_observer_is_contained() {
        let ticker = ElapsedTicker::start(Arc::new(Panicking), 1, Some(Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        ticker.finish(record(1)).await;
    }
}
