//! Miss Status Holding Registers.
//!
//! Events that cannot be handled yet wait here, queued per line in arrival
//! order. Requests count against the configured capacity; invalidations from
//! below are parked at the front of their line's queue and are never refused.

use std::collections::{HashMap, VecDeque};

use crate::coherence::MemEvent;
use crate::common::LineAddr;

pub struct Mshr {
    entries: HashMap<LineAddr, VecDeque<MemEvent>>,
    capacity: usize,
    size: usize,
}

impl Mshr {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            size: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of parked events across all lines.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_full(&self) -> bool {
        self.size >= self.capacity
    }

    /// True if anything is parked on `addr`.
    pub fn contains(&self, addr: LineAddr) -> bool {
        self.entries.contains_key(&addr)
    }

    /// Number of events parked on `addr`.
    pub fn pending(&self, addr: LineAddr) -> usize {
        self.entries.get(&addr).map_or(0, VecDeque::len)
    }

    pub fn push_back(&mut self, addr: LineAddr, event: MemEvent) {
        self.entries.entry(addr).or_default().push_back(event);
        self.size += 1;
    }

    pub fn push_front(&mut self, addr: LineAddr, event: MemEvent) {
        self.entries.entry(addr).or_default().push_front(event);
        self.size += 1;
    }

    pub fn pop_front(&mut self, addr: LineAddr) -> Option<MemEvent> {
        let queue = self.entries.get_mut(&addr)?;
        let event = queue.pop_front();
        if queue.is_empty() {
            self.entries.remove(&addr);
        }
        if event.is_some() {
            self.size -= 1;
        }
        event
    }

    /// The oldest request parked on `addr`: the one a response from below
    /// answers.
    pub fn front_request(&self, addr: LineAddr) -> Option<&MemEvent> {
        self.entries
            .get(&addr)?
            .iter()
            .find(|event| event.cmd.is_request())
    }
}
