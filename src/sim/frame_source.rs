//! Paced frame production.

use crate::pipeline::Source;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A captured frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Capture number, starting at 0 for every attempt
    pub id: u64,
    /// Payload the simulated stages operate on
    pub value: i64,
}

impl Frame {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            value: id as i64,
        }
    }
}

/// Emits one frame every `interval`, like a camera at a fixed frame rate.
///
/// Every call to [`Source::open`] starts a new capture at frame 0.
#[derive(Debug, Clone)]
pub struct FrameSource {
    interval: Duration,
    limit: Option<u64>,
}

impl FrameSource {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            limit: None,
        }
    }

    /// Frame source for a given frame rate.
    pub fn with_fps(fps: u32) -> Self {
        Self::new(Duration::from_secs(1) / fps.max(1))
    }

    /// Stop after `limit` frames.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Source<Frame> for FrameSource {
    fn open(&self) -> BoxStream<'static, Frame> {
        let interval = self.interval;
        let frames = stream::unfold(0u64, move |id| async move {
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
            Some((Frame::new(id), id + 1))
        });

        match self.limit {
            Some(limit) => frames
                .take(usize::try_from(limit).unwrap_or(usize::MAX))
                .boxed(),
            None => frames.boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn test_fps_interval() {
        assert_eq!(FrameSource::with_fps(25).interval(), Duration::from_millis(40));
        assert_eq!(FrameSource::with_fps(0).interval(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_are_paced() {
        let source = FrameSource::new(Duration::from_millis(30)).with_limit(5);
        let start = Instant::now();
        let frames: Vec<Frame> = source.open().collect().await;

        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0], Frame::new(0));
        assert_eq!(frames[4].value, 4);
        assert_eq!(start.elapsed(), Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_large_limit_is_not_truncated() {
        let source = FrameSource::new(Duration::ZERO).with_limit(u64::MAX);
        let frames: Vec<Frame> = source.open().take(4).collect().await;
        assert_eq!(frames.len(), 4);
    }

    #[tokio::test]
    async fn test_each_open_restarts_at_zero() {
        let source = FrameSource::new(Duration::ZERO);
        let first: Vec<u64> = source.open().take(3).map(|f| f.id).collect().await;
        let second: Vec<u64> = source.open().take(3).map(|f| f.id).collect().await;
        assert_eq!(first, vec![0, 1, 2]);
        assert_eq!(second, vec![0, 1, 2]);
    }
}
