//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fixed-capacity buffers for history and event logs."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::collections::vec_deque::{IntoIter, Iter, IterMut};
use std::collections::VecDeque;

use serde::{Serialize, Serializer};

/// Append-only buffer holding the `capacity` most recent entries.
///
/// Pushing into a full buffer evicts the oldest entry first.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedLog<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedLog<T> {
    /// Create an empty buffer. A zero capacity is raised to one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, returning the evicted one when the buffer was full.
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn oldest(&self) -> Option<&T> {
        self.entries.front()
    }

    /// Oldest-first iteration.
    pub fn iter(&self) -> Iter<'_, T> {
        self.entries.iter()
    }

    /// Oldest-first mutable iteration. Entries can be updated but not reordered.
    pub fn iter_mut(&mut self) -> IterMut<'_, T> {
        self.entries.iter_mut()
    }

    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.entries.iter().cloned().collect()
    }
}

impl<T> IntoIterator for BoundedLog<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a BoundedLog<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl<T: Serialize> Serialize for BoundedLog<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.entries.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_first() {
        let mut log = BoundedLog::with_capacity(3);
        for value in 0..3 {
            assert_eq!(log.push(value), None);
        }
        assert_eq!(log.push(3), Some(0));
        assert_eq!(log.push(4), Some(1));
        assert_eq!(log.to_vec(), vec![2, 3, 4]);
        assert_eq!(log.oldest(), Some(&2));
        assert_eq!(log.latest(), Some(&4));
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut log = BoundedLog::with_capacity(50);
        for value in 0..500 {
            log.push(value);
            assert!(log.len() <= 50);
        }
        assert_eq!(log.len(), 50);
        assert_eq!(log.oldest(), Some(&450));
    }

    #[test]
    fn in_place_updates_keep_order() {
        let mut log = BoundedLog::with_capacity(3);
        for value in 1..=4 {
            log.push(value);
        }
        for value in log.iter_mut() {
            *value *= 10;
        }
        assert_eq!(log.to_vec(), vec![20, 30, 40]);
    }

    #[test]
    fn zero_capacity_holds_one_entry() {
        let mut log = BoundedLog::with_capacity(0);
        log.push("a");
        log.push("b");
        assert_eq!(log.capacity(), 1);
        assert_eq!(log.to_vec(), vec!["b"]);
    }
}
