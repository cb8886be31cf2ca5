//! In-order reassembly of concurrently produced items.
//!
//! A concurrent stage emits items in completion order. The sequencer that
//! follows it holds early arrivals in a reorder buffer keyed by index and
//! releases them only once every lower index has been released:
//!
//! ```text
//!   arrivals:  2  0  3  1  4
//!   buffer:   {2} {} {2,3} {} {}
//!   released:     0        1 2 3  4
//! ```
//!
//! The buffer is owned by a single task, so the concurrent producers of the
//! upstream stage never touch it directly; they only feed the channel.
//!
//! A [`ReleaseWindow`] shared with the upstream stage keeps the buffer
//! bounded: item `i` may only start once `i < released + W`, so at most W
//! items are ever taken but not yet released.

use crate::error::{PipelineError, Result};
use crate::pipeline::{Metrics, Tagged};
use async_channel::{Receiver, Sender};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Index-keyed holding area that releases items in gapless ascending order.
#[derive(Debug)]
pub struct ReorderBuffer<V> {
    stage: String,
    pending: BTreeMap<u64, V>,
    next_expected: u64,
    peak_depth: usize,
}

impl<V> ReorderBuffer<V> {
    /// Create an empty buffer expecting index 0 first.
    ///
    /// `stage` names the stage feeding this buffer and is only used in errors.
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            pending: BTreeMap::new(),
            next_expected: 0,
            peak_depth: 0,
        }
    }

    /// Hold an item until its turn comes.
    ///
    /// Fails if the index was already released or is already held.
    pub fn insert(&mut self, item: Tagged<V>) -> Result<()> {
        if item.index < self.next_expected {
            return Err(PipelineError::StaleIndex {
                stage: self.stage.clone(),
                index: item.index,
                next_expected: self.next_expected,
            });
        }
        if self.pending.contains_key(&item.index) {
            return Err(PipelineError::DuplicateIndex {
                stage: self.stage.clone(),
                index: item.index,
            });
        }
        self.pending.insert(item.index, item.value);
        self.peak_depth = self.peak_depth.max(self.pending.len());
        Ok(())
    }

    /// Release the next item if it is the one expected.
    pub fn pop_ready(&mut self) -> Option<Tagged<V>> {
        let entry = self.pending.first_entry()?;
        if *entry.key() != self.next_expected {
            return None;
        }
        let value = entry.remove();
        let index = self.next_expected;
        self.next_expected += 1;
        Some(Tagged::new(index, value))
    }

    /// Check that nothing is stranded once the input has ended.
    pub fn finish(&self) -> Result<()> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::SequenceGap {
                stage: self.stage.clone(),
                next_expected: self.next_expected,
                buffered: self.pending.len(),
            })
        }
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Largest number of items held at once.
    pub fn peak_depth(&self) -> usize {
        self.peak_depth
    }
}

/// Admission window between a concurrent stage and its sequencer.
///
/// The stage takes a slot before pulling an item and keeps it past the call;
/// the sequencer hands a slot back for every item it releases.
#[derive(Debug, Clone)]
pub struct ReleaseWindow {
    slots: Arc<Semaphore>,
}

impl ReleaseWindow {
    /// Window admitting `size` unreleased items (at least 1).
    pub fn new(size: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(size.clamp(1, Semaphore::MAX_PERMITS))),
        }
    }

    /// Wait for a free slot.
    pub async fn admit(&self) -> Option<WindowSlot> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .ok()
            .map(|permit| WindowSlot { permit })
    }

    /// Return the slot of one released item.
    pub fn release(&self) {
        self.slots.add_permits(1);
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

/// A taken window slot. Dropping it frees the slot at once; [`WindowSlot::hold`]
/// leaves it taken until the sequencer releases the item.
#[derive(Debug)]
pub struct WindowSlot {
    permit: OwnedSemaphorePermit,
}

impl WindowSlot {
    pub fn hold(self) {
        self.permit.forget();
    }
}

/// Spawn a sequencer task between `input` and `output`.
///
/// The task ends cleanly when the run is cancelled or the downstream side
/// goes away. When the input closes while items are still held, the task
/// cancels the run and returns [`PipelineError::SequenceGap`]. Unless the
/// run was already cancelled: then the upstream stopped on purpose and the
/// leftovers are dropped with the rest of the attempt.
///
/// With a `window`, one slot is returned for every item sent downstream.
pub fn spawn_sequencer<V>(
    stage: String,
    input: Receiver<Tagged<V>>,
    output: Sender<Tagged<V>>,
    window: Option<ReleaseWindow>,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
) -> JoinHandle<Result<()>>
where
    V: Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = ReorderBuffer::new(stage);

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                received = input.recv() => received,
            };

            let Ok(tagged) = received else {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                if let Err(e) = buffer.finish() {
                    tracing::error!("{}", e);
                    cancel.cancel();
                    return Err(e);
                }
                tracing::trace!(
                    "Sequencer drained, released {} items",
                    buffer.next_expected()
                );
                return Ok(());
            };

            if let Err(e) = buffer.insert(tagged) {
                tracing::error!("{}", e);
                cancel.cancel();
                return Err(e);
            }
            metrics.record_reorder_depth(buffer.len());

            while let Some(ready) = buffer.pop_ready() {
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    sent = output.send(ready) => sent,
                };
                if sent.is_err() {
                    tracing::debug!("Sequencer receiver dropped, stopping");
                    return Ok(());
                }
                if let Some(window) = &window {
                    window.release();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain<V>(buffer: &mut ReorderBuffer<V>) -> Vec<u64> {
        std::iter::from_fn(|| buffer.pop_ready())
            .map(|t| t.index)
            .collect()
    }

    #[test]
    fn test_releases_in_order_for_any_permutation() {
        let permutations: [&[u64]; 4] = [
            &[0, 1, 2, 3, 4, 5],
            &[5, 4, 3, 2, 1, 0],
            &[2, 0, 3, 1, 5, 4],
            &[1, 3, 5, 0, 2, 4],
        ];

        for permutation in permutations {
            let mut buffer = ReorderBuffer::new("test");
            let mut released = Vec::new();
            for &index in permutation {
                buffer.insert(Tagged::new(index, index * 10)).unwrap();
                released.extend(drain(&mut buffer));
            }
            assert_eq!(released, vec![0, 1, 2, 3, 4, 5], "input {:?}", permutation);
            assert!(buffer.is_empty());
            assert!(buffer.finish().is_ok());
        }
    }

    #[test]
    fn test_holds_until_gap_filled() {
        let mut buffer = ReorderBuffer::new("test");
        buffer.insert(Tagged::new(2, 'c')).unwrap();
        buffer.insert(Tagged::new(1, 'b')).unwrap();
        assert!(buffer.pop_ready().is_none());
        assert_eq!(buffer.len(), 2);

        buffer.insert(Tagged::new(0, 'a')).unwrap();
        let values: Vec<char> = std::iter::from_fn(|| buffer.pop_ready())
            .map(Tagged::into_value)
            .collect();
        assert_eq!(values, vec!['a', 'b', 'c']);
        assert_eq!(buffer.next_expected(), 3);
        assert_eq!(buffer.peak_depth(), 3);
    }

    #[test]
    fn test_duplicate_index_is_rejected() {
        let mut buffer = ReorderBuffer::new("p2");
        buffer.insert(Tagged::new(3, ())).unwrap();
        let err = buffer.insert(Tagged::new(3, ())).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateIndex { index: 3, .. }));
    }

    #[test]
    fn test_released_index_is_rejected() {
        let mut buffer = ReorderBuffer::new("p2");
        buffer.insert(Tagged::new(0, ())).unwrap();
        assert!(buffer.pop_ready().is_some());
        let err = buffer.insert(Tagged::new(0, ())).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::StaleIndex { index: 0, next_expected: 1, .. }
        ));
    }

    #[test]
    fn test_finish_reports_gap() {
        let mut buffer = ReorderBuffer::new("p1");
        buffer.insert(Tagged::new(0, ())).unwrap();
        buffer.insert(Tagged::new(2, ())).unwrap();
        buffer.insert(Tagged::new(3, ())).unwrap();
        drain(&mut buffer);

        match buffer.finish() {
            Err(PipelineError::SequenceGap {
                stage,
                next_expected,
                buffered,
            }) => {
                assert_eq!(stage, "p1");
                assert_eq!(next_expected, 1);
                assert_eq!(buffered, 2);
            }
            other => panic!("expected sequence gap, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sequencer_task_orders_channel_input() {
        let (in_tx, in_rx) = async_channel::bounded(16);
        let (out_tx, out_rx) = async_channel::bounded(16);
        let cancel = CancellationToken::new();
        let metrics = Metrics::new();

        let handle = spawn_sequencer("test".to_string(), in_rx, out_tx, None, cancel, metrics.clone());

        for index in [3u64, 1, 0, 4, 2, 6, 5] {
            in_tx.send(Tagged::new(index, index)).await.unwrap();
        }
        drop(in_tx);

        let mut out = Vec::new();
        while let Ok(t) = out_rx.recv().await {
            out.push(t.value);
        }

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(out, vec![0, 1, 2, 3, 4, 5, 6]);
        assert!(metrics.snapshot().peak_reorder_depth >= 2);
    }

    #[tokio::test]
    async fn test_sequencer_task_surfaces_gap() {
        let (in_tx, in_rx) = async_channel::bounded(16);
        let (out_tx, out_rx) = async_channel::bounded(16);
        let cancel = CancellationToken::new();

        let handle = spawn_sequencer(
            "p1".to_string(),
            in_rx,
            out_tx,
            None,
            cancel.clone(),
            Metrics::new(),
        );

        in_tx.send(Tagged::new(0, ())).await.unwrap();
        in_tx.send(Tagged::new(2, ())).await.unwrap();
        drop(in_tx);

        let released: Vec<u64> = {
            let mut v = Vec::new();
            while let Ok(t) = out_rx.recv().await {
                v.push(t.index);
            }
            v
        };

        let result = handle.await.unwrap();
        assert_eq!(released, vec![0]);
        assert!(matches!(result, Err(PipelineError::SequenceGap { next_expected: 1, .. })));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_sequencer_task_drops_leftovers_when_cancelled() {
        let (in_tx, in_rx) = async_channel::bounded(16);
        let (out_tx, _out_rx) = async_channel::bounded(16);
        let cancel = CancellationToken::new();

        let handle = spawn_sequencer(
            "p1".to_string(),
            in_rx,
            out_tx,
            None,
            cancel.clone(),
            Metrics::new(),
        );

        in_tx.send(Tagged::new(5, ())).await.unwrap();
        cancel.cancel();
        drop(in_tx);

        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_window_slots_return_on_release() {
        let window = ReleaseWindow::new(2);
        let a = window.admit().await.unwrap();
        let b = window.admit().await.unwrap();
        assert_eq!(window.available(), 0);

        a.hold();
        drop(b);
        assert_eq!(window.available(), 1);

        window.release();
        assert_eq!(window.available(), 2);
        assert_eq!(ReleaseWindow::new(0).available(), 1);
    }

    #[tokio::test]
    async fn test_sequencer_returns_a_slot_per_released_item() {
        let (in_tx, in_rx) = async_channel::bounded(16);
        let (out_tx, out_rx) = async_channel::bounded(16);
        let window = ReleaseWindow::new(3);
        for _ in 0..3 {
            window.admit().await.unwrap().hold();
        }

        let handle = spawn_sequencer(
            "p1".to_string(),
            in_rx,
            out_tx,
            Some(window.clone()),
            CancellationToken::new(),
            Metrics::new(),
        );

        in_tx.send(Tagged::new(2, ())).await.unwrap();
        in_tx.send(Tagged::new(1, ())).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(window.available(), 0);

        in_tx.send(Tagged::new(0, ())).await.unwrap();
        drop(in_tx);
        let released: Vec<u64> = {
            let mut v = Vec::new();
            while let Ok(t) = out_rx.recv().await {
                v.push(t.index);
            }
            v
        };

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(released, vec![0, 1, 2]);
        assert_eq!(window.available(), 3);
    }
}
