//! Line Address Type.
//!
//! Every coherence decision is made per cache line, so the engine keys all of
//! its records by the line-aligned base address rather than by the raw byte
//! address carried in a request.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A line-aligned base address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineAddr(u64);

impl LineAddr {
    /// Aligns `addr` down to the start of its line.
    ///
    /// # Arguments
    ///
    /// * `addr` - Raw byte address.
    /// * `line_bytes` - Line size in bytes. Must be a power of two.
    pub fn new(addr: u64, line_bytes: u64) -> Self {
        debug_assert!(line_bytes.is_power_of_two());
        Self(addr & !(line_bytes - 1))
    }

    /// Returns the raw address value.
    pub fn val(self) -> u64 {
        self.0
    }

    /// Returns the line number (address divided by the line size).
    pub fn line_number(self, line_bytes: u64) -> u64 {
        self.0 / line_bytes
    }
}

impl fmt::Display for LineAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
