//! Items paired with their arrival position.

use std::cmp::Ordering;

/// A value tagged with the position it had when it left the source.
///
/// Ordering and equality consider only the index, so a heap of tagged items
/// is keyed by arrival position regardless of the payload type.
#[derive(Debug, Clone)]
pub struct Tagged<V> {
    pub index: u64,
    pub value: V,
}

impl<V> Tagged<V> {
    pub fn new(index: u64, value: V) -> Self {
        Self { index, value }
    }

    /// Replace the payload, keeping the index.
    pub fn map<U>(self, f: impl FnOnce(V) -> U) -> Tagged<U> {
        Tagged {
            index: self.index,
            value: f(self.value),
        }
    }

    pub fn into_value(self) -> V {
        self.value
    }
}

impl<V> PartialEq for Tagged<V> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<V> Eq for Tagged<V> {}

impl<V> PartialOrd for Tagged<V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<V> Ord for Tagged<V> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_ignores_payload() {
        let a = Tagged::new(1, "zzz");
        let b = Tagged::new(2, "aaa");
        assert!(a < b);
        assert_eq!(Tagged::new(5, "x"), Tagged::new(5, "y"));
    }

    #[test]
    fn test_map_keeps_index() {
        let t = Tagged::new(9, 3).map(|v| v * 10);
        assert_eq!(t.index, 9);
        assert_eq!(t.into_value(), 30);
    }
}
