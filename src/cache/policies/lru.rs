//! Least Recently Used (LRU) Replacement Policy.
//!
//! Keeps a recency stack per set. Index 0 is the most recently used way and the
//! last index the least recently used one, which is the victim. Invalidated
//! ways are pushed straight to the LRU end so they are reused before any line
//! that still holds data.

use super::ReplacementPolicy;

/// LRU Policy state.
pub struct LruPolicy {
    /// One recency stack per set.
    usage: Vec<Vec<usize>>,
}

impl LruPolicy {
    /// Creates a new LRU policy instance.
    ///
    /// # Arguments
    ///
    /// * `sets` - The number of sets in the line array.
    /// * `ways` - The associativity of each set.
    pub fn new(sets: usize, ways: usize) -> Self {
        Self {
            usage: (0..sets).map(|_| (0..ways).rev().collect()).collect(),
        }
    }

    fn take(&mut self, set: usize, way: usize) -> &mut Vec<usize> {
        let stack = &mut self.usage[set];
        if let Some(pos) = stack.iter().position(|&w| w == way) {
            stack.remove(pos);
        }
        stack
    }
}

impl ReplacementPolicy for LruPolicy {
    fn touch(&mut self, set: usize, way: usize) {
        self.take(set, way).insert(0, way);
    }

    fn demote(&mut self, set: usize, way: usize) {
        self.take(set, way).push(way);
    }

    fn victim(&self, set: usize) -> usize {
        self.usage[set].last().copied().unwrap_or(0)
    }
}
