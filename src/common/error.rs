//! Error Types.
//!
//! Protocol errors are internal-consistency failures: an invariant of the
//! line record or sharer set was broken, a command arrived that the current
//! state cannot legally accept, or an acknowledgement count drifted. None of
//! them is recoverable. Handlers return them through `Result` so the driver
//! can report the failing line before aborting the run.

use thiserror::Error;

use super::addr::LineAddr;
use crate::coherence::line::LineState;
use crate::coherence::message::Command;

/// Fatal coherence protocol error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoherenceError {
    /// A sharer/owner or line record invariant does not hold.
    #[error("invariant violated on line {addr}: {detail}")]
    InvariantViolation { addr: LineAddr, detail: String },

    /// A line tried to move between states without the required intermediate state.
    #[error("illegal transition {from} -> {to} on line {addr}")]
    IllegalTransition {
        addr: LineAddr,
        from: LineState,
        to: LineState,
    },

    /// The command is not valid for the line's current state.
    #[error("unexpected {cmd} on line {addr} in state {state}")]
    UnexpectedCommand {
        addr: LineAddr,
        cmd: Command,
        state: String,
    },

    /// An acknowledgement arrived while none was outstanding.
    #[error("stale acknowledgement on line {addr}")]
    StaleAck { addr: LineAddr },

    /// Acknowledgements remain outstanding after the resolving response.
    #[error("{remaining} acknowledgements still outstanding on line {addr}")]
    AckCountMismatch { addr: LineAddr, remaining: u32 },

    /// A data-carrying command arrived without data.
    #[error("{cmd} on line {addr} carries no payload")]
    MissingPayload { addr: LineAddr, cmd: Command },

    /// The request names a requestor that is not a configured upstream port.
    #[error("unknown requestor '{0}'")]
    UnknownRequestor(String),

    /// The event names a line that this cache does not hold.
    #[error("line {0} is not resident")]
    NotResident(LineAddr),
}

/// Result type used by every protocol handler.
pub type CoherenceResult<T> = Result<T, CoherenceError>;

/// Configuration loading error.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for the configuration schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration parsed but describes an impossible cache.
    #[error("invalid config: {0}")]
    Invalid(String),
}
