//! Line Replacement Policies.
//!
//! A replacement policy tracks recency within each set of the line array and
//! names the way to give up when a set is full.

pub mod lru;

pub use lru::LruPolicy;

/// Interface for line replacement policies.
pub trait ReplacementPolicy {
    /// Records a use of `way` in `set`.
    fn touch(&mut self, set: usize, way: usize);

    /// Marks `way` as the first candidate for reuse, e.g. after it was
    /// invalidated.
    fn demote(&mut self, set: usize, way: usize);

    /// Returns the way in `set` that should be evicted next.
    fn victim(&self, set: usize) -> usize;
}
