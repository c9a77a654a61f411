//! Sharer/Owner Tracking.
//!
//! The Top controller keeps one `SharerSet` per line. It records which
//! upstream ports hold a read-only copy, which single port (if any) holds the
//! line exclusively, and whether invalidation or downgrade acknowledgements are
//! still outstanding.
//!
//! Every mutator re-validates three invariants before it returns:
//!
//! 1. An owner and a non-empty sharer set never coexist.
//! 2. The sharer counter equals the number of bits set.
//! 3. Sharers and owners are only added while the set is `Valid`.

use std::fmt;

use crate::common::{CoherenceError, CoherenceResult, LineAddr};

/// Bounded bitset of upstream port ids.
///
/// Sized to the number of configured upstream ports rather than a fixed
/// machine word.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortSet {
    words: Vec<u64>,
    capacity: usize,
}

impl PortSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; (capacity + 63) / 64],
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn test(&self, id: usize) -> bool {
        id < self.capacity && self.words[id / 64] & (1 << (id % 64)) != 0
    }

    pub fn set(&mut self, id: usize) {
        self.words[id / 64] |= 1 << (id % 64)
    }

    pub fn clear(&mut self, id: usize) {
        self.words[id / 64] &= !(1 << (id % 64))
    }

    pub fn reset(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Number of members.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterates over members in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.capacity).filter(move |&id| self.test(id))
    }
}

impl fmt::Display for PortSet {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        for id in (0..self.capacity).rev() {
            write!(fmt, "{}", if self.test(id) { '1' } else { '0' })?;
        }
        Ok(())
    }
}

/// State of the upstream side of a line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CcState {
    /// No invalidation traffic outstanding.
    Valid,
    /// Invalidations sent, waiting for acknowledgements.
    InvAcking,
    /// Downgrade sent to the owner, waiting for its reply.
    InvXAcking,
}

impl fmt::Display for CcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CcState::Valid => "V",
            CcState::InvAcking => "Inv_A",
            CcState::InvXAcking => "InvX_A",
        };
        write!(f, "{}", s)
    }
}

/// Sharer/owner record for one line.
#[derive(Clone, Debug)]
pub struct SharerSet {
    base_addr: LineAddr,
    state: CcState,
    sharers: PortSet,
    num_sharers: usize,
    owner: Option<usize>,
    acks_needed: bool,
    ack_count: u32,
}

impl SharerSet {
    /// Creates an empty, valid set for `ports` upstream ports.
    pub fn new(ports: usize) -> Self {
        Self {
            base_addr: LineAddr::default(),
            state: CcState::Valid,
            sharers: PortSet::new(ports),
            num_sharers: 0,
            owner: None,
            acks_needed: false,
            ack_count: 0,
        }
    }

    pub fn base_addr(&self) -> LineAddr {
        self.base_addr
    }

    pub fn state(&self) -> CcState {
        self.state
    }

    pub fn in_transition(&self) -> bool {
        self.state != CcState::Valid
    }

    pub fn is_valid(&self) -> bool {
        self.state == CcState::Valid
    }

    pub fn sharers(&self) -> &PortSet {
        &self.sharers
    }

    pub fn num_sharers(&self) -> usize {
        self.num_sharers
    }

    pub fn is_sharer(&self, id: usize) -> bool {
        self.sharers.test(id)
    }

    /// True if no upstream port holds a shared copy.
    pub fn is_shareless(&self) -> bool {
        self.num_sharers == 0
    }

    /// True if no upstream port holds the line at all.
    pub fn is_idle(&self) -> bool {
        self.num_sharers == 0 && self.owner.is_none()
    }

    pub fn owner(&self) -> Option<usize> {
        self.owner
    }

    pub fn owner_exists(&self) -> bool {
        self.owner.is_some()
    }

    pub fn acks_needed(&self) -> bool {
        self.acks_needed
    }

    pub fn ack_count(&self) -> u32 {
        self.ack_count
    }

    /// Checks invariants 1 and 2.
    pub fn validate(&self) -> CoherenceResult<()> {
        if self.owner.is_some() && self.num_sharers > 0 {
            return Err(self.violation(format!(
                "owner {:?} coexists with {} sharers",
                self.owner, self.num_sharers
            )));
        }
        let counted = self.sharers.count();
        if counted != self.num_sharers {
            return Err(self.violation(format!(
                "sharer count {} but {} bits set ({})",
                self.num_sharers, counted, self.sharers
            )));
        }
        if !self.acks_needed && self.ack_count != 0 {
            return Err(self.violation(format!("{} acks without acks_needed", self.ack_count)));
        }
        Ok(())
    }

    pub fn set_owner(&mut self, id: usize) -> CoherenceResult<()> {
        self.require_valid("set owner")?;
        self.check_id(id)?;
        if let Some(owner) = self.owner {
            if owner != id {
                return Err(self.violation(format!("set owner {} while {} owns", id, owner)));
            }
        }
        self.owner = Some(id);
        self.validate()
    }

    pub fn clear_owner(&mut self) -> CoherenceResult<()> {
        self.owner = None;
        self.validate()
    }

    /// Adds `id` to the sharers. Adding an existing sharer is a no-op.
    pub fn add_sharer(&mut self, id: usize) -> CoherenceResult<()> {
        self.require_valid("add sharer")?;
        self.check_id(id)?;
        if let Some(owner) = self.owner {
            return Err(self.violation(format!("add sharer {} while {} owns", id, owner)));
        }
        if !self.sharers.test(id) {
            self.sharers.set(id);
            self.num_sharers += 1;
        }
        self.validate()
    }

    /// Removes `id` from the sharers. Removing an absent sharer is fatal.
    pub fn remove_sharer(&mut self, id: usize) -> CoherenceResult<()> {
        if !self.sharers.test(id) {
            return Err(self.violation(format!("remove absent sharer {}", id)));
        }
        self.sharers.clear(id);
        self.num_sharers -= 1;
        self.validate()
    }

    pub fn remove_all_sharers(&mut self) -> CoherenceResult<()> {
        self.sharers.reset();
        self.num_sharers = 0;
        self.validate()
    }

    /// Enters an acking state waiting for `count` replies.
    pub fn begin_acking(&mut self, state: CcState, count: u32) -> CoherenceResult<()> {
        if state == CcState::Valid || count == 0 {
            return Err(self.violation(format!("begin acking {} with {} acks", state, count)));
        }
        self.require_valid("begin acking")?;
        self.state = state;
        self.acks_needed = true;
        self.ack_count = count;
        self.validate()
    }

    /// Consumes one acknowledgement. Returns to `Valid` when none remain.
    ///
    /// # Returns
    ///
    /// The number of acknowledgements still outstanding.
    pub fn take_ack(&mut self) -> CoherenceResult<u32> {
        if self.state == CcState::Valid || self.ack_count == 0 {
            return Err(CoherenceError::StaleAck { addr: self.base_addr });
        }
        self.ack_count -= 1;
        if self.ack_count == 0 {
            self.acks_needed = false;
            self.state = CcState::Valid;
        }
        self.validate()?;
        Ok(self.ack_count)
    }

    /// Resets the record for a new address once the old one is fully released.
    pub fn reset_for(&mut self, base_addr: LineAddr) -> CoherenceResult<()> {
        self.require_valid("re-tag")?;
        if !self.is_idle() {
            return Err(self.violation(format!(
                "re-tag to {} with holders (owner {:?}, sharers {})",
                base_addr, self.owner, self.sharers
            )));
        }
        self.base_addr = base_addr;
        Ok(())
    }

    fn require_valid(&self, what: &str) -> CoherenceResult<()> {
        if self.state != CcState::Valid {
            return Err(self.violation(format!("{} in state {}", what, self.state)));
        }
        Ok(())
    }

    fn check_id(&self, id: usize) -> CoherenceResult<()> {
        if id >= self.sharers.capacity() {
            return Err(self.violation(format!(
                "port {} out of range ({} ports)",
                id,
                self.sharers.capacity()
            )));
        }
        Ok(())
    }

    fn violation(&self, detail: String) -> CoherenceError {
        CoherenceError::InvariantViolation {
            addr: self.base_addr,
            detail,
        }
    }
}
