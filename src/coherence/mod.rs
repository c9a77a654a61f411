//! Coherence Protocol Engine.
//!
//! Control flow for one event:
//!
//! 1. The Top controller decides whether upstream sharers or the owner must be
//!    invalidated or downgraded before the local copy may be used.
//! 2. The Bottom controller decides whether the local copy is sufficient or has
//!    to be fetched/upgraded from the next level.
//! 3. Responses arrive at the Bottom controller, which updates the line record;
//!    the Top controller then grants the original request.
//!
//! Waiting is never represented on the call stack. A handler that cannot finish
//! leaves the line record or sharer set in a transitional state and returns;
//! the acknowledgement arrives later as a fresh event.

/// Backing-store-facing protocol engine.
pub mod bottom;

/// Per-address line record and its state machine.
pub mod line;

/// Command set, memory events and outgoing messages.
pub mod message;

/// MSI / MESI / MOESI / incoherent policy value.
pub mod protocol;

/// Timestamp-ordered outgoing queue and the latency rules that feed it.
pub mod queue;

/// Per-line sharer/owner tracking.
pub mod sharers;

/// Requestor-facing protocol engine.
pub mod top;

pub use bottom::{AccessResult, BottomController};
pub use line::{CacheLine, LineState};
pub use message::{Command, Flags, MemEvent, Outgoing};
pub use protocol::{DowngradeAction, Protocol};
pub use queue::{MessageQueue, Port};
pub use sharers::{CcState, PortSet, SharerSet};
pub use top::{TopController, TopOutcome};
