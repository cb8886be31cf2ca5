//! The pipeline's boundary: where items come from and where they go.

use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;

/// A producer of items in arrival order.
///
/// Each attempt opens a fresh stream. Dropping the stream must stop
/// production and release whatever it holds (timers, handles).
pub trait Source<V>: Send + Sync {
    fn open(&self) -> BoxStream<'static, V>;
}

/// A source replaying a fixed list of items on every attempt.
#[derive(Debug, Clone)]
pub struct ReplaySource<V> {
    items: Arc<Vec<V>>,
}

impl<V> ReplaySource<V> {
    pub fn new(items: impl IntoIterator<Item = V>) -> Self {
        Self {
            items: Arc::new(items.into_iter().collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<V> Source<V> for ReplaySource<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn open(&self) -> BoxStream<'static, V> {
        let items = Arc::clone(&self.items);
        stream::iter(0..items.len())
            .map(move |i| items[i].clone())
            .boxed()
    }
}

/// A consumer of ordered results.
pub trait Sink<V> {
    fn deliver(&mut self, value: V) -> anyhow::Result<()>;
}

impl<V> Sink<V> for Vec<V> {
    fn deliver(&mut self, value: V) -> anyhow::Result<()> {
        self.push(value);
        Ok(())
    }
}

impl<V> Sink<V> for tokio::sync::mpsc::UnboundedSender<V> {
    fn deliver(&mut self, value: V) -> anyhow::Result<()> {
        self.send(value)
            .map_err(|_| anyhow::anyhow!("Sink receiver dropped"))
    }
}
