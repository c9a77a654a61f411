//! Line Array.
//!
//! Set-associative arena of line records and their sharer sets. Controllers
//! never hold on to a record; the shell looks a line up by address, borrows
//! the record for one handler call and lets go.

use std::collections::HashMap;

use super::policies::{LruPolicy, ReplacementPolicy};
use crate::coherence::{CacheLine, SharerSet};
use crate::common::{CoherenceResult, LineAddr};

/// Index of a line slot in the arena.
pub type LineIndex = usize;

pub struct LineArray {
    line_bytes: u64,
    sets: usize,
    ways: usize,
    lines: Vec<CacheLine>,
    sharers: Vec<SharerSet>,
    tags: HashMap<LineAddr, LineIndex>,
    policy: Box<dyn ReplacementPolicy>,
}

impl LineArray {
    /// Creates an array of `lines` invalid slots.
    ///
    /// # Arguments
    ///
    /// * `line_bytes` - Size of each line's data buffer.
    /// * `lines` - Total number of slots. Must be a multiple of `ways`.
    /// * `ways` - Associativity.
    /// * `ports` - Number of upstream ports each sharer set tracks.
    pub fn new(line_bytes: u64, lines: usize, ways: usize, ports: usize) -> Self {
        let sets = lines / ways;
        Self {
            line_bytes,
            sets,
            ways,
            lines: (0..lines).map(|_| CacheLine::new(line_bytes as usize)).collect(),
            sharers: (0..lines).map(|_| SharerSet::new(ports)).collect(),
            tags: HashMap::new(),
            policy: Box::new(LruPolicy::new(sets, ways)),
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn set_of(&self, addr: LineAddr) -> usize {
        (addr.line_number(self.line_bytes) % self.sets as u64) as usize
    }

    /// Slot currently tagged with `addr`, if any.
    pub fn lookup(&self, addr: LineAddr) -> Option<LineIndex> {
        self.tags.get(&addr).copied()
    }

    /// Slot the replacement policy would give up to make room for `addr`.
    pub fn find_victim(&self, addr: LineAddr) -> LineIndex {
        let set = self.set_of(addr);
        set * self.ways + self.policy.victim(set)
    }

    /// Re-tags slot `idx` for `addr`. The slot must be invalid and idle.
    pub fn retag(&mut self, idx: LineIndex, addr: LineAddr) -> CoherenceResult<()> {
        let old = self.lines[idx].base_addr();
        self.lines[idx].set_base_addr(addr)?;
        self.sharers[idx].reset_for(addr)?;
        if self.tags.get(&old) == Some(&idx) {
            self.tags.remove(&old);
        }
        self.tags.insert(addr, idx);
        self.touch(idx);
        Ok(())
    }

    /// Marks slot `idx` as most recently used.
    pub fn touch(&mut self, idx: LineIndex) {
        self.policy.touch(idx / self.ways, idx % self.ways);
    }

    /// Marks slot `idx` as the next to be reused.
    pub fn demote(&mut self, idx: LineIndex) {
        self.policy.demote(idx / self.ways, idx % self.ways);
    }

    pub fn line(&self, idx: LineIndex) -> &CacheLine {
        &self.lines[idx]
    }

    pub fn line_mut(&mut self, idx: LineIndex) -> &mut CacheLine {
        &mut self.lines[idx]
    }

    pub fn sharer(&self, idx: LineIndex) -> &SharerSet {
        &self.sharers[idx]
    }

    pub fn sharer_mut(&mut self, idx: LineIndex) -> &mut SharerSet {
        &mut self.sharers[idx]
    }

    /// Borrows a slot's line record and sharer set together.
    pub fn entry_mut(&mut self, idx: LineIndex) -> (&mut CacheLine, &mut SharerSet) {
        (&mut self.lines[idx], &mut self.sharers[idx])
    }
}
