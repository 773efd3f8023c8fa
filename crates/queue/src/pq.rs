//! Bounded, key-indexed binary heap.
//!
//! Values expose a string key; a key-to-position map is kept in step with the
//! heap so removal and lookup by key stay O(log n). When full, a new value is
//! admitted only by evicting the top, and only if it orders strictly before it.

use std::collections::HashMap;

/// Values stored in a [`PriorityQueue`] are identified by a string key.
pub trait Keyed {
    fn key(&self) -> &str;
}

/// Outcome of [`PriorityQueue::push`].
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    /// Stored at `index` without displacing anything.
    Inserted { index: usize },
    /// Stored at `index`; the previous top was evicted to make room.
    Replaced { index: usize, evicted: T },
    /// Queue full and the value did not order before the top. Nothing changed.
    Rejected(T),
    /// A value with the same key is already resident. Nothing changed.
    Duplicate(T),
}

impl<T> PushOutcome<T> {
    /// Heap index of the admitted value, `None` when it was not admitted.
    #[must_use]
    pub const fn index(&self) -> Option<usize> {
        match self {
            Self::Inserted { index } | Self::Replaced { index, .. } => Some(*index),
            Self::Rejected(_) | Self::Duplicate(_) => None,
        }
    }

    #[must_use]
    pub const fn is_admitted(&self) -> bool {
        self.index().is_some()
    }
}

#[derive(Debug)]
struct Entry<T> {
    priority: i64,
    value: T,
}

/// Capacity-bounded priority queue.
///
/// With `reversed = false` the smallest priority is on top; with
/// `reversed = true` the largest is. The scheduler uses the reversed form so
/// the farthest-future event is the one evicted on overflow.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    entries: Vec<Entry<T>>,
    positions: HashMap<String, usize>,
    capacity: usize,
    reversed: bool,
}

impl<T: Keyed> PriorityQueue<T> {
    #[must_use]
    pub fn new(capacity: usize, reversed: bool) -> Self {
        Self {
            entries: Vec::new(),
            positions: HashMap::new(),
            capacity,
            reversed,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots left before pushes start evicting.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.entries.len())
    }

    /// Insert `value` with `priority`.
    pub fn push(&mut self, value: T, priority: i64) -> PushOutcome<T> {
        if self.positions.contains_key(value.key()) {
            return PushOutcome::Duplicate(value);
        }

        if self.entries.len() < self.capacity {
            let index = self.insert(value, priority);
            return PushOutcome::Inserted { index };
        }

        // Admit only a value the current top sorts ahead of.
        let admits = self
            .entries
            .first()
            .is_some_and(|top| self.before(top.priority, priority));
        if !admits {
            return PushOutcome::Rejected(value);
        }

        match self.pop() {
            Some(evicted) => {
                let index = self.insert(value, priority);
                PushOutcome::Replaced { index, evicted }
            }
            None => PushOutcome::Rejected(value),
        }
    }

    /// Remove and return the top value.
    pub fn pop(&mut self) -> Option<T> {
        let last = self.entries.len().checked_sub(1)?;
        self.swap_entries(0, last);
        let entry = self.entries.pop()?;
        self.positions.remove(entry.value.key());
        if !self.entries.is_empty() {
            self.sift_down(0);
        }
        Some(entry.value)
    }

    /// Remove the value stored under `key`.
    pub fn remove(&mut self, key: &str) -> Option<T> {
        let position = *self.positions.get(key)?;
        let last = self.entries.len().checked_sub(1)?;
        self.swap_entries(position, last);
        let entry = self.entries.pop()?;
        self.positions.remove(key);
        if position < self.entries.len() && !self.sift_down(position) {
            self.sift_up(position);
        }
        Some(entry.value)
    }

    /// Current heap index of `key`.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<usize> {
        self.positions.get(key).copied()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.positions.contains_key(key)
    }

    #[must_use]
    pub fn top(&self) -> Option<&T> {
        self.entries.first().map(|entry| &entry.value)
    }

    #[must_use]
    pub fn top_priority(&self) -> Option<i64> {
        self.entries.first().map(|entry| entry.priority)
    }

    /// Value at heap position `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.entries.get(index).map(|entry| &entry.value)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut T> {
        let position = *self.positions.get(key)?;
        self.entries.get_mut(position).map(|entry| &mut entry.value)
    }

    /// Whether priority `a` sits closer to the top than `b`.
    const fn before(&self, a: i64, b: i64) -> bool {
        if self.reversed { a > b } else { a < b }
    }

    fn priority_at(&self, index: usize) -> Option<i64> {
        self.entries.get(index).map(|entry| entry.priority)
    }

    fn insert(&mut self, value: T, priority: i64) -> usize {
        let index = self.entries.len();
        self.positions.insert(value.key().to_string(), index);
        self.entries.push(Entry { priority, value });
        self.sift_up(index)
    }

    fn swap_entries(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.entries.swap(a, b);
        for index in [a, b] {
            if let Some(entry) = self.entries.get(index) {
                if let Some(slot) = self.positions.get_mut(entry.value.key()) {
                    *slot = index;
                }
            }
        }
    }

    fn sift_up(&mut self, mut index: usize) -> usize {
        while index > 0 {
            let parent = (index - 1) / 2;
            match (self.priority_at(index), self.priority_at(parent)) {
                (Some(child), Some(above)) if self.before(child, above) => {
                    self.swap_entries(index, parent);
                    index = parent;
                }
                _ => break,
            }
        }
        index
    }

    /// Returns whether the entry moved.
    fn sift_down(&mut self, start: usize) -> bool {
        let mut index = start;
        loop {
            let left = 2 * index + 1;
            let Some(left_priority) = self.priority_at(left) else {
                break;
            };
            let right = left + 1;
            let (child, child_priority) = match self.priority_at(right) {
                Some(right_priority) if self.before(right_priority, left_priority) => {
                    (right, right_priority)
                }
                _ => (left, left_priority),
            };
            match self.priority_at(index) {
                Some(current) if self.before(child_priority, current) => {
                    self.swap_entries(index, child);
                    index = child;
                }
                _ => break,
            }
        }
        index != start
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, PartialEq, Eq)]
    struct Item(String);

    impl Keyed for Item {
        fn key(&self) -> &str {
            &self.0
        }
    }

    #[derive(Debug)]
    struct Slot {
        key: String,
        armed: bool,
    }

    impl Keyed for Slot {
        fn key(&self) -> &str {
            &self.key
        }
    }

    fn item(key: &str) -> Item {
        Item(key.to_string())
    }

    fn assert_positions_consistent(pq: &PriorityQueue<Item>) {
        for (key, index) in &pq.positions {
            assert_eq!(pq.get(*index).map(Keyed::key), Some(key.as_str()));
        }
        assert_eq!(pq.positions.len(), pq.len());
    }

    #[test]
    fn test_min_heap_pops_smallest_first() {
        let mut pq = PriorityQueue::new(10, false);
        for (key, priority) in [("c", 30), ("a", 10), ("b", 20)] {
            assert!(pq.push(item(key), priority).is_admitted());
        }
        assert_eq!(pq.top(), Some(&item("a")));
        assert_eq!(pq.pop(), Some(item("a")));
        assert_eq!(pq.pop(), Some(item("b")));
        assert_eq!(pq.pop(), Some(item("c")));
        assert_eq!(pq.pop(), None);
    }

    #[test]
    fn test_reversed_heap_keeps_farthest_on_top() {
        let mut pq = PriorityQueue::new(10, true);
        pq.push(item("near"), 1);
        pq.push(item("far"), 100);
        pq.push(item("mid"), 50);
        assert_eq!(pq.top(), Some(&item("far")));
        assert_eq!(pq.top_priority(), Some(100));
    }

    #[test]
    fn test_duplicate_key_is_noop() {
        let mut pq = PriorityQueue::new(4, true);
        pq.push(item("a"), 5);
        let outcome = pq.push(item("a"), 1);
        assert_eq!(outcome, PushOutcome::Duplicate(item("a")));
        assert_eq!(outcome.index(), None);
        assert_eq!(pq.len(), 1);
        assert_eq!(pq.top_priority(), Some(5));
    }

    #[test]
    fn test_full_queue_rejects_not_sooner() {
        let mut pq = PriorityQueue::new(2, true);
        pq.push(item("a"), 10);
        pq.push(item("b"), 20);

        let equal = pq.push(item("c"), 20);
        assert_eq!(equal, PushOutcome::Rejected(item("c")));
        let later = pq.push(item("d"), 30);
        assert_eq!(later, PushOutcome::Rejected(item("d")));

        assert_eq!(pq.len(), 2);
        assert!(pq.contains("b"));
    }

    #[test]
    fn test_full_queue_evicts_top_for_sooner() {
        let mut pq = PriorityQueue::new(2, true);
        pq.push(item("a"), 10);
        pq.push(item("b"), 20);

        match pq.push(item("c"), 15) {
            PushOutcome::Replaced { index, evicted } => {
                assert_eq!(evicted, item("b"));
                assert_eq!(pq.get(index), Some(&item("c")));
            }
            other => panic!("expected eviction, got {other:?}"),
        }
        assert_eq!(pq.len(), 2);
        assert_eq!(pq.lookup("b"), None);
        assert_eq!(pq.top(), Some(&item("c")));
        assert_positions_consistent(&pq);
    }

    #[test]
    fn test_full_reversed_queue_keeps_nearest() {
        let mut pq = PriorityQueue::new(2, true);
        for (key, priority) in [("far", 100), ("mid", 50), ("near", 10), ("farther", 200)] {
            pq.push(item(key), priority);
        }
        let resident: Vec<bool> = ["far", "mid", "near", "farther"]
            .into_iter()
            .map(|key| pq.contains(key))
            .collect();
        assert_eq!(resident, vec![false, true, true, false]);
    }

    #[test]
    fn test_single_slot_admits_sooner_value() {
        let mut pq = PriorityQueue::new(1, true);
        pq.push(item("k0"), 0);
        let outcome = pq.push(item("candidate"), -1);
        assert!(matches!(outcome, PushOutcome::Replaced { ref evicted, .. } if *evicted == item("k0")));
        assert!(pq.contains("candidate"));
    }

    #[test]
    fn test_zero_capacity_rejects_everything() {
        let mut pq: PriorityQueue<Item> = PriorityQueue::new(0, true);
        assert_eq!(pq.push(item("a"), 1), PushOutcome::Rejected(item("a")));
        assert!(pq.is_empty());
    }

    #[test]
    fn test_remove_absent_key() {
        let mut pq = PriorityQueue::new(4, false);
        pq.push(item("a"), 1);
        assert_eq!(pq.remove("missing"), None);
        assert_eq!(pq.len(), 1);
    }

    #[test]
    fn test_remove_middle_keeps_heap_order() {
        let mut pq = PriorityQueue::new(16, false);
        for (index, priority) in [7, 3, 9, 1, 8, 2, 6].into_iter().enumerate() {
            pq.push(item(&format!("k{index}")), priority);
        }
        assert_eq!(pq.remove("k2"), Some(item("k2")));
        assert_eq!(pq.len(), 6);
        assert_positions_consistent(&pq);

        let mut last = i64::MIN;
        while let Some(priority) = pq.top_priority() {
            assert!(priority >= last);
            last = priority;
            pq.pop();
        }
    }

    #[test]
    fn test_get_mut_by_key() {
        let mut pq: PriorityQueue<Slot> = PriorityQueue::new(4, false);
        pq.push(Slot { key: "a".into(), armed: false }, 1);
        if let Some(slot) = pq.get_mut("a") {
            slot.armed = true;
        }
        assert!(pq.top().is_some_and(|slot| slot.armed));
        assert!(pq.get_mut("b").is_none());
        assert_eq!(pq.remaining(), 3);
    }

    proptest! {
        #[test]
        fn prop_len_and_lookup_track_pushes_and_removes(
            priorities in proptest::collection::vec(-1_000i64..1_000, 1..64),
            removals in proptest::collection::vec(any::<prop::sample::Index>(), 0..32),
            reversed in any::<bool>(),
        ) {
            let mut pq = PriorityQueue::new(priorities.len(), reversed);
            for (index, priority) in priorities.iter().enumerate() {
                let admitted = pq.push(item(&format!("k{index}")), *priority).is_admitted();
                prop_assert!(admitted);
            }
            prop_assert_eq!(pq.len(), priorities.len());

            let mut expected = priorities.len();
            for removal in removals {
                let key = format!("k{}", removal.index(priorities.len()));
                let present = pq.contains(&key);
                let removed = pq.remove(&key);
                prop_assert_eq!(removed.is_some(), present);
                if present {
                    expected -= 1;
                }
                prop_assert_eq!(pq.len(), expected);
                for (key, index) in &pq.positions {
                    prop_assert_eq!(pq.get(*index).map(Keyed::key), Some(key.as_str()));
                }
            }
        }

        #[test]
        fn prop_full_reversed_queue_admits_only_sooner(
            priorities in proptest::collection::vec(-1_000i64..1_000, 1..32),
            candidate in -1_500i64..1_500,
        ) {
            let mut pq = PriorityQueue::new(priorities.len(), true);
            for (index, priority) in priorities.iter().enumerate() {
                pq.push(item(&format!("k{index}")), *priority);
            }
            let top = pq.top_priority().unwrap();
            let outcome = pq.push(item("candidate"), candidate);
            if candidate < top {
                let is_replaced = matches!(outcome, PushOutcome::Replaced { .. });
                prop_assert!(is_replaced);
                prop_assert!(pq.contains("candidate"));
            } else {
                prop_assert_eq!(outcome, PushOutcome::Rejected(item("candidate")));
            }
            prop_assert_eq!(pq.len(), priorities.len());
        }
    }
}
