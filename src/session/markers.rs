//! "Already requested" markers kept for the caller-facing layer.
//!
//! The channel does not interpret these. They let the application avoid
//! asking the peer twice for the same thing while a request is in flight.

use std::collections::{HashMap, HashSet, VecDeque};

use bytes::Bytes;

/// Bounded set with FIFO eviction.
#[derive(Debug, Clone)]
struct BoundedSet {
    order: VecDeque<Bytes>,
    members: HashSet<Bytes>,
    capacity: usize,
}

impl BoundedSet {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, key: Bytes) -> bool {
        if self.members.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.members.insert(key.clone());
        self.order.push_back(key);
        true
    }

    fn remove(&mut self, key: &[u8]) -> bool {
        if !self.members.remove(key) {
            return false;
        }
        self.order.retain(|k| k.as_ref() != key);
        true
    }
}

/// Per-kind sets of in-flight request keys.
#[derive(Debug, Clone)]
pub struct RequestMarkers {
    sets: HashMap<String, BoundedSet>,
    capacity: usize,
}

impl RequestMarkers {
    /// Create marker sets holding at most `capacity` keys each.
    pub fn new(capacity: usize) -> Self {
        Self {
            sets: HashMap::new(),
            capacity,
        }
    }

    /// Mark `key` of `kind` as requested. Returns false if already marked.
    pub fn mark(&mut self, kind: &str, key: impl Into<Bytes>) -> bool {
        let capacity = self.capacity;
        self.sets
            .entry(kind.to_owned())
            .or_insert_with(|| BoundedSet::new(capacity))
            .insert(key.into())
    }

    /// Whether `key` of `kind` is marked.
    pub fn is_marked(&self, kind: &str, key: &[u8]) -> bool {
        self.sets
            .get(kind)
            .is_some_and(|set| set.members.contains(key))
    }

    /// Clear the marker once the request was answered.
    pub fn unmark(&mut self, kind: &str, key: &[u8]) -> bool {
        self.sets.get_mut(kind).is_some_and(|set| set.remove(key))
    }

    /// Drop every marker.
    pub fn clear_all(&mut self) {
        self.sets.clear();
    }

    /// Number of markers of `kind`.
    pub fn len(&self, kind: &str) -> usize {
        self.sets.get(kind).map_or(0, |set| set.order.len())
    }
}
