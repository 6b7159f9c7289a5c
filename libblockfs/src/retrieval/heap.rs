//! Binary max-heap keyed by block id, with a key -> slot map kept in step
//! on every swap so a queued entry's priority can be raised in place.

use std::collections::HashMap;

use crate::block::BlockId;

#[derive(Debug, Clone, Copy)]
struct HeapItem {
    key: BlockId,
    priority: i32,
    seq: u64,
}

impl HeapItem {
    /// Higher priority first; the earlier request wins a tie.
    fn before(&self, other: &HeapItem) -> bool {
        self.priority > other.priority || (self.priority == other.priority && self.seq < other.seq)
    }
}

#[derive(Debug, Default)]
pub struct RetrievalHeap {
    items: Vec<HeapItem>,
    slots: HashMap<BlockId, usize>,
}

impl RetrievalHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, key: &BlockId) -> bool {
        self.slots.contains_key(key)
    }

    pub fn priority_of(&self, key: &BlockId) -> Option<i32> {
        self.slots.get(key).map(|&i| self.items[i].priority)
    }

    /// Insert a key that is not queued yet.
    pub fn push(&mut self, key: BlockId, priority: i32, seq: u64) {
        debug_assert!(!self.contains(&key), "duplicate heap key {key}");
        let idx = self.items.len();
        self.items.push(HeapItem { key, priority, seq });
        self.slots.insert(key, idx);
        self.sift_up(idx);
    }

    pub fn pop(&mut self) -> Option<(BlockId, i32)> {
        if self.items.is_empty() {
            return None;
        }
        let last = self.items.len() - 1;
        self.swap(0, last);
        let top = self.items.pop()?;
        self.slots.remove(&top.key);
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        Some((top.key, top.priority))
    }

    /// Raise `key` to `priority` if that is higher than what it has.
    /// Returns whether the priority changed.
    pub fn raise(&mut self, key: &BlockId, priority: i32) -> bool {
        let Some(&idx) = self.slots.get(key) else {
            return false;
        };
        if priority <= self.items[idx].priority {
            return false;
        }
        self.items[idx].priority = priority;
        self.sift_up(idx);
        true
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.items.swap(a, b);
        self.slots.insert(self.items[a].key, a);
        self.slots.insert(self.items[b].key, b);
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !self.items[idx].before(&self.items[parent]) {
                break;
            }
            self.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.items.len();
        loop {
            let (l, r) = (2 * idx + 1, 2 * idx + 2);
            let mut best = idx;
            if l < len && self.items[l].before(&self.items[best]) {
                best = l;
            }
            if r < len && self.items[r].before(&self.items[best]) {
                best = r;
            }
            if best == idx {
                break;
            }
            self.swap(idx, best);
            idx = best;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> BlockId {
        BlockId::new([b; 32])
    }

    #[test]
    fn test_pop_order_priority_then_seq() {
        let mut heap = RetrievalHeap::new();
        heap.push(id(1), 5, 0);
        heap.push(id(2), 9, 1);
        heap.push(id(3), 5, 2);
        heap.push(id(4), 1, 3);
        heap.push(id(5), 9, 4);

        let order: Vec<_> = std::iter::from_fn(|| heap.pop().map(|(k, _)| k)).collect();
        assert_eq!(order, vec![id(2), id(5), id(1), id(3), id(4)]);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_raise_reorders() {
        let mut heap = RetrievalHeap::new();
        for (i, b) in (1..=6).enumerate() {
            heap.push(id(b), 1, i as u64);
        }
        assert!(heap.raise(&id(6), 5));
        assert!(!heap.raise(&id(6), 3), "priority is never lowered");
        assert!(!heap.raise(&id(42), 10));
        assert_eq!(heap.priority_of(&id(6)), Some(5));

        assert_eq!(heap.pop(), Some((id(6), 5)));
        assert_eq!(heap.pop(), Some((id(1), 1)));
        assert_eq!(heap.len(), 4);
        assert!(!heap.contains(&id(6)));
        assert!(heap.contains(&id(2)));
    }

    #[test]
    fn test_slots_track_swaps() {
        let mut heap = RetrievalHeap::new();
        for b in 0..32u8 {
            heap.push(id(b), (b % 7) as i32, b as u64);
        }
        for _ in 0..10 {
            heap.pop();
        }
        for (key, &slot) in &heap.slots {
            assert_eq!(heap.items[slot].key, *key);
        }
    }
}
