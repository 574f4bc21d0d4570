//! Reorder buffer keyed by sequence index.
//!
//! Renders finish in whatever order the synthesis server answers them, but
//! playback must follow unit order. Items are held until every lower index
//! has been released, then drained as one contiguous run.

use std::collections::BTreeMap;

#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: usize,
    pending: BTreeMap<usize, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Store `item` under `index`.
    ///
    /// Returns `false` (and drops the item) when the index was already
    /// released or is already pending.
    pub fn insert(&mut self, index: usize, item: T) -> bool {
        if index < self.next || self.pending.contains_key(&index) {
            return false;
        }
        self.pending.insert(index, item);
        true
    }

    /// Release the item for the next expected index, if it has arrived.
    pub fn pop_ready(&mut self) -> Option<T> {
        let item = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(item)
    }

    /// The lowest index not yet released. Equals the number of released items.
    pub fn next_index(&self) -> usize {
        self.next
    }

    /// Items received but blocked behind a missing lower index.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Drop everything and start again from index 0.
    pub fn reset(&mut self) {
        self.next = 0;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain<T>(buf: &mut ReorderBuffer<T>) -> Vec<T> {
        std::iter::from_fn(|| buf.pop_ready()).collect()
    }

    #[test]
    fn in_order_arrivals_release_immediately() {
        let mut buf = ReorderBuffer::new();
        assert!(buf.insert(0, "a"));
        assert_eq!(drain(&mut buf), vec!["a"]);
        assert!(buf.insert(1, "b"));
        assert_eq!(drain(&mut buf), vec!["b"]);
        assert_eq!(buf.next_index(), 2);
    }

    #[test]
    fn later_index_waits_for_earlier() {
        let mut buf = ReorderBuffer::new();
        buf.insert(1, "second");
        assert!(drain(&mut buf).is_empty());
        assert_eq!(buf.pending_len(), 1);

        buf.insert(0, "first");
        assert_eq!(drain(&mut buf), vec!["first", "second"]);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn gap_holds_back_the_tail() {
        let mut buf = ReorderBuffer::new();
        for i in [3, 0, 2, 5] {
            buf.insert(i, i);
        }
        assert_eq!(drain(&mut buf), vec![0]);
        buf.insert(1, 1);
        assert_eq!(drain(&mut buf), vec![1, 2, 3]);
        assert_eq!(buf.next_index(), 4);
        buf.insert(4, 4);
        assert_eq!(drain(&mut buf), vec![4, 5]);
    }

    #[test]
    fn stale_and_duplicate_indices_are_rejected() {
        let mut buf = ReorderBuffer::new();
        buf.insert(0, 'x');
        drain(&mut buf);
        assert!(!buf.insert(0, 'y'));
        assert!(buf.insert(2, 'z'));
        assert!(!buf.insert(2, 'w'));
        buf.insert(1, 'q');
        assert_eq!(drain(&mut buf), vec!['q', 'z']);
    }

    #[test]
    fn reset_starts_over() {
        let mut buf = ReorderBuffer::new();
        buf.insert(0, 0);
        buf.insert(2, 2);
        drain(&mut buf);
        buf.reset();
        assert_eq!(buf.next_index(), 0);
        assert_eq!(buf.pending_len(), 0);
        assert!(buf.insert(0, 10));
    }
}
