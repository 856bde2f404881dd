//! Priority queue for ordering atlas generation requests.
//!
//! The nearest missing chunk is served first; at equal distance the one
//! closest to the camera's forward direction wins. Re-pushing a key replaces
//! its priority lazily: stale heap entries are skipped on pop.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;

/// Ordering inputs for one request.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RequestPriority {
    /// Distance from the camera to the chunk centre.
    pub distance: f64,
    /// Angle in radians between the camera forward and the direction to
    /// the chunk.
    pub angle: f32,
}

impl RequestPriority {
    /// Compare so that the more urgent request is greater.
    fn urgency(&self, other: &Self) -> Ordering {
        other
            .distance
            .total_cmp(&self.distance)
            .then_with(|| other.angle.total_cmp(&self.angle))
    }
}

#[derive(Clone, Debug)]
struct PriorityEntry<K> {
    key: K,
    priority: RequestPriority,
    /// Insertion stamp; older entries win exact ties.
    generation: u64,
}

impl<K> PartialEq for PriorityEntry<K> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K> Eq for PriorityEntry<K> {}

impl<K> PartialOrd for PriorityEntry<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for PriorityEntry<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .urgency(&other.priority)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

/// Max-urgency queue of generation requests keyed by `K`.
pub struct RequestQueue<K> {
    heap: BinaryHeap<PriorityEntry<K>>,
    generations: HashMap<K, u64>,
    next_generation: u64,
}

impl<K: Copy + Eq + Hash> Default for RequestQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + Eq + Hash> RequestQueue<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            generations: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Insert a key or update its priority.
    pub fn push(&mut self, key: K, priority: RequestPriority) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.generations.insert(key, generation);
        self.heap.push(PriorityEntry {
            key,
            priority,
            generation,
        });
    }

    /// Remove and return the most urgent key.
    pub fn pop(&mut self) -> Option<K> {
        while let Some(entry) = self.heap.pop() {
            if self.generations.get(&entry.key) == Some(&entry.generation) {
                self.generations.remove(&entry.key);
                return Some(entry.key);
            }
        }
        None
    }

    /// Drop a key if queued.
    pub fn remove(&mut self, key: &K) {
        self.generations.remove(key);
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.generations.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.generations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.generations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(distance: f64, angle: f32) -> RequestPriority {
        RequestPriority { distance, angle }
    }

    /// Nearest requests come out first.
    #[test]
    fn test_nearest_first() {
        let mut q = RequestQueue::new();
        q.push("far", p(900.0, 0.0));
        q.push("near", p(100.0, 2.0));
        q.push("mid", p(400.0, 0.5));
        assert_eq!(q.pop(), Some("near"));
        assert_eq!(q.pop(), Some("mid"));
        assert_eq!(q.pop(), Some("far"));
        assert_eq!(q.pop(), None);
    }

    /// Equal distances are broken by angle to the camera forward.
    #[test]
    fn test_angle_tie_break() {
        let mut q = RequestQueue::new();
        q.push("behind", p(256.0, 3.0));
        q.push("ahead", p(256.0, 0.1));
        q.push("side", p(256.0, 1.5));
        assert_eq!(q.pop(), Some("ahead"));
        assert_eq!(q.pop(), Some("side"));
        assert_eq!(q.pop(), Some("behind"));
    }

    /// Re-pushing updates the priority and keeps one live entry.
    #[test]
    fn test_priority_update() {
        let mut q = RequestQueue::new();
        q.push(1, p(100.0, 0.0));
        q.push(2, p(200.0, 0.0));
        q.push(1, p(300.0, 0.0));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(1));
        assert!(q.is_empty());
    }

    /// Removed keys are never returned.
    #[test]
    fn test_remove() {
        let mut q = RequestQueue::new();
        q.push(1, p(1.0, 0.0));
        q.push(2, p(2.0, 0.0));
        q.remove(&1);
        assert!(!q.contains(&1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }
}
