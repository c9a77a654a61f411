//! Protocol Policy.
//!
//! The supported protocols share one state-machine shape and differ only at a
//! handful of decision points. Each of those points asks the policy value
//! instead of being duplicated per protocol.
//!
//! `Incoherent` drops coherence altogether: no sharer tracking, no
//! invalidations, every valid line is held `E` or `M` and only written back on
//! eviction.

use serde::Deserialize;
use std::fmt;

use super::line::LineState;

/// Coherence protocol selected for a deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum Protocol {
    #[serde(rename = "MSI")]
    Msi,
    #[serde(rename = "MESI")]
    Mesi,
    #[serde(rename = "MOESI")]
    Moesi,
    #[serde(rename = "NONE", alias = "none")]
    Incoherent,
}

/// What a dirty or exclusive line does when asked to downgrade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DowngradeAction {
    /// Write the data back below and keep a clean shared copy.
    WritebackToShared,
    /// Keep the dirty data as `Owned` and supply it without a writeback.
    SupplyAsOwned,
    /// Nothing to give up.
    Nothing,
}

impl Protocol {
    /// True if the Exclusive state exists.
    pub fn supports_exclusive(self) -> bool {
        matches!(self, Protocol::Mesi | Protocol::Moesi | Protocol::Incoherent)
    }

    /// False for the incoherent protocol, which keeps no sharer records and
    /// never sends or accepts invalidations.
    pub fn is_coherent(self) -> bool {
        self != Protocol::Incoherent
    }

    /// True if the Owned state exists.
    pub fn supports_owned(self) -> bool {
        self == Protocol::Moesi
    }

    /// Whether a `GetS` with no other holder upstream may be granted Exclusive,
    /// given the local line state.
    pub fn grants_exclusive(self, local: LineState) -> bool {
        self.supports_exclusive() && local.is_writable()
    }

    /// Maps a grant from below onto a state this protocol can hold.
    pub fn normalize_grant(self, granted: LineState) -> LineState {
        match granted {
            LineState::E if !self.supports_exclusive() => LineState::S,
            LineState::S if !self.is_coherent() => LineState::E,
            other => other,
        }
    }

    /// Decides how a line in `state` answers a downgrade.
    pub fn on_downgrade(self, state: LineState) -> DowngradeAction {
        match state {
            LineState::M | LineState::O if self.supports_owned() => DowngradeAction::SupplyAsOwned,
            LineState::M | LineState::E => DowngradeAction::WritebackToShared,
            _ => DowngradeAction::Nothing,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Msi => "MSI",
            Protocol::Mesi => "MESI",
            Protocol::Moesi => "MOESI",
            Protocol::Incoherent => "NONE",
        };
        write!(f, "{}", s)
    }
}
