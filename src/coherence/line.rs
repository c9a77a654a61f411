//! Line Record.
//!
//! One `CacheLine` exists per line slot of a cache. It carries the coherence
//! state of the line with respect to the level below, the line's data, the
//! number of acknowledgements the pending operation still awaits, and the lock
//! taken by an atomic read-modify-write sequence.
//!
//! The state machine is enforced here: `set_state` rejects any move that skips
//! the transitional state an operation must pass through, and any stable state
//! that still has acknowledgements outstanding.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::common::{CoherenceError, CoherenceResult, LineAddr};

/// Coherence state of a line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LineState {
    /// Invalid.
    I,
    /// Invalid, `GetS` outstanding.
    IS,
    /// Invalid, `GetX` outstanding.
    IM,
    /// Shared, read-only and clean.
    S,
    /// Shared, upgrade outstanding.
    SM,
    /// Exclusive and clean.
    E,
    /// Modified.
    M,
    /// Owned: dirty, but other caches may hold shared copies.
    O,
    /// Owned, upgrade outstanding.
    OM,
}

impl LineState {
    /// Returns true for states no operation is pending on.
    pub fn is_stable(self) -> bool {
        matches!(
            self,
            LineState::I | LineState::S | LineState::E | LineState::M | LineState::O
        )
    }

    /// Returns true while a multi-step operation is outstanding.
    pub fn in_transition(self) -> bool {
        !self.is_stable()
    }

    /// Returns true if the line holds readable data.
    pub fn is_valid(self) -> bool {
        self.is_stable() && self != LineState::I
    }

    /// Returns true if the line's data differs from the level below.
    pub fn is_dirty(self) -> bool {
        matches!(self, LineState::M | LineState::O)
    }

    /// Returns true if the line may be written without asking the level below.
    pub fn is_writable(self) -> bool {
        matches!(self, LineState::E | LineState::M)
    }

    /// Checks the legal-transition table.
    pub fn can_transition_to(self, next: LineState) -> bool {
        use LineState::*;
        if self == next {
            return true;
        }
        match self {
            I => matches!(next, IS | IM),
            IS => matches!(next, S | E | M),
            IM => next == M,
            S => matches!(next, SM | I),
            SM => matches!(next, M | IM),
            E => matches!(next, M | S | I),
            M => matches!(next, S | O | I),
            O => matches!(next, OM | S | I),
            OM => matches!(next, M | IM),
        }
    }
}

impl fmt::Display for LineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Per-line coherence record.
#[derive(Clone, Debug)]
pub struct CacheLine {
    base_addr: LineAddr,
    state: LineState,
    data: Vec<u8>,
    ack_count: u32,
    locked: bool,
}

impl CacheLine {
    /// Creates an invalid line with a zeroed data buffer of `line_bytes`.
    pub fn new(line_bytes: usize) -> Self {
        Self {
            base_addr: LineAddr::default(),
            state: LineState::I,
            data: vec![0; line_bytes],
            ack_count: 0,
            locked: false,
        }
    }

    pub fn base_addr(&self) -> LineAddr {
        self.base_addr
    }

    /// Re-tags the slot for a new address.
    ///
    /// Only an invalid, unlocked line with nothing outstanding may be re-tagged.
    pub fn set_base_addr(&mut self, base_addr: LineAddr) -> CoherenceResult<()> {
        if self.state != LineState::I || self.locked || self.ack_count != 0 {
            return Err(CoherenceError::InvariantViolation {
                addr: self.base_addr,
                detail: format!(
                    "re-tag to {} while {} (acks {}, locked {})",
                    base_addr, self.state, self.ack_count, self.locked
                ),
            });
        }
        self.base_addr = base_addr;
        self.data.fill(0);
        Ok(())
    }

    pub fn state(&self) -> LineState {
        self.state
    }

    pub fn in_transition(&self) -> bool {
        self.state.in_transition()
    }

    /// Moves the line to `next`.
    ///
    /// # Errors
    ///
    /// `IllegalTransition` if the move skips a required transitional state,
    /// `InvariantViolation` if `next` is stable while acks are outstanding.
    pub fn set_state(&mut self, next: LineState) -> CoherenceResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(CoherenceError::IllegalTransition {
                addr: self.base_addr,
                from: self.state,
                to: next,
            });
        }
        if next.is_stable() && self.ack_count > 0 {
            return Err(CoherenceError::InvariantViolation {
                addr: self.base_addr,
                detail: format!("stable state {} with {} acks outstanding", next, self.ack_count),
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copies `payload` over the start of the line. Extra bytes are dropped.
    pub fn merge_payload(&mut self, payload: &[u8]) {
        let n = payload.len().min(self.data.len());
        self.data[..n].copy_from_slice(&payload[..n]);
    }

    pub fn ack_count(&self) -> u32 {
        self.ack_count
    }

    /// Records how many acknowledgements the pending operation waits for.
    pub fn expect_acks(&mut self, count: u32) {
        self.ack_count = count;
    }

    /// Consumes one acknowledgement and returns how many remain.
    ///
    /// # Errors
    ///
    /// `StaleAck` if none was outstanding.
    pub fn take_ack(&mut self) -> CoherenceResult<u32> {
        if self.ack_count == 0 {
            return Err(CoherenceError::StaleAck { addr: self.base_addr });
        }
        self.ack_count -= 1;
        Ok(self.ack_count)
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }
}
