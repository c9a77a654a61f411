//! Protocol Messages.
//!
//! This module defines the closed command set exchanged between caches, the
//! memory event that carries a command, and the outgoing message wrapper that
//! stamps an event with its enqueue and delivery times.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::line::LineState;
use crate::common::LineAddr;

/// Coherence protocol command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Read request, wants a shared copy.
    GetS,
    /// Write request, wants an exclusive copy.
    GetX,
    /// Atomic read-for-write request. Locks the line until the matching write.
    GetSEx,
    /// Response to `GetS`, carries data and the granted state.
    GetSResp,
    /// Response to `GetX`/`GetSEx`, carries data.
    GetXResp,
    /// Clean relinquish of a shared copy.
    PutS,
    /// Clean relinquish of an exclusive copy.
    PutE,
    /// Dirty writeback, relinquishes the copy.
    PutM,
    /// Downgrade writeback, keeps a shared copy.
    PutX,
    /// Invalidate.
    Inv,
    /// Downgrade an exclusive holder to shared.
    InvX,
    /// Acknowledges an `Inv` that did not need a writeback.
    InvAck,
    /// Directory invalidate that also collects the data.
    FetchInv,
    /// Directory downgrade that also collects the data.
    FetchInvX,
    /// Data reply to a fetch or a non-writeback downgrade.
    FetchResp,
    /// Negative acknowledgement, the request must be retried.
    #[serde(rename = "NACK")]
    Nack,
}

impl Command {
    /// Returns true for `GetS`, `GetX` and `GetSEx`.
    pub fn is_request(self) -> bool {
        matches!(self, Command::GetS | Command::GetX | Command::GetSEx)
    }

    /// Returns true for requests that need write permission.
    pub fn is_write(self) -> bool {
        matches!(self, Command::GetX | Command::GetSEx)
    }

    /// Returns true for commands by which an upstream cache gives back (part of)
    /// its permission on a line.
    ///
    /// `FetchResp` counts when it comes from an upstream owner that answered a
    /// downgrade without writing back.
    pub fn is_put(self) -> bool {
        matches!(
            self,
            Command::PutS | Command::PutE | Command::PutM | Command::PutX | Command::FetchResp
        )
    }

    /// Returns true for `Inv` and `InvX`.
    pub fn is_invalidate(self) -> bool {
        matches!(self, Command::Inv | Command::InvX)
    }

    /// Returns true for `FetchInv` and `FetchInvX`.
    pub fn is_fetch(self) -> bool {
        matches!(self, Command::FetchInv | Command::FetchInvX)
    }

    /// Returns true for the responses that resolve a transitional line.
    pub fn is_response(self) -> bool {
        matches!(self, Command::GetSResp | Command::GetXResp)
    }

    /// Returns the command used to answer this one, if any.
    pub fn response_cmd(self) -> Option<Command> {
        match self {
            Command::GetS => Some(Command::GetSResp),
            Command::GetX | Command::GetSEx => Some(Command::GetXResp),
            Command::FetchInv | Command::FetchInvX => Some(Command::FetchResp),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Nack => write!(f, "NACK"),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Per-event flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    #[serde(default)]
    pub prefetch: bool,
    #[serde(default)]
    pub uncached: bool,
    /// Set on the write that completes a `GetSEx` read-modify-write sequence.
    #[serde(default)]
    pub locked: bool,
}

/// A memory event travelling between caches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemEvent {
    pub cmd: Command,
    /// Raw byte address of the access.
    pub addr: u64,
    /// Line-aligned address. Filled in by the receiving cache when absent.
    #[serde(default)]
    pub base_addr: LineAddr,
    /// Name of the sender.
    pub src: String,
    /// Name of the receiver.
    #[serde(default)]
    pub dst: String,
    /// Requested size in bytes.
    #[serde(default)]
    pub size: u32,
    #[serde(default)]
    pub payload: Option<Vec<u8>>,
    #[serde(default)]
    pub flags: Flags,
    /// State granted by a response.
    #[serde(default)]
    pub granted: Option<LineState>,
    /// Invalidations only: the receiver must acknowledge even without a writeback.
    #[serde(default)]
    pub ack_needed: bool,
    #[serde(default)]
    pub retries: u32,
    /// NACKs only: the request being refused.
    #[serde(default)]
    pub nacked: Option<Box<MemEvent>>,
}

impl MemEvent {
    /// Creates an event with no payload and default flags.
    pub fn new(src: impl Into<String>, addr: u64, base_addr: LineAddr, cmd: Command) -> Self {
        Self {
            cmd,
            addr,
            base_addr,
            src: src.into(),
            dst: String::new(),
            size: 0,
            payload: None,
            flags: Flags::default(),
            granted: None,
            ack_needed: false,
            retries: 0,
            nacked: None,
        }
    }

    /// Attaches a data payload.
    pub fn with_payload(mut self, data: Vec<u8>) -> Self {
        self.payload = Some(data);
        self
    }

    /// Replaces the flags.
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Builds the reply to this event. Source and destination are swapped.
    pub fn make_response(&self, cmd: Command, granted: Option<LineState>) -> MemEvent {
        MemEvent {
            cmd,
            addr: self.addr,
            base_addr: self.base_addr,
            src: self.dst.clone(),
            dst: self.src.clone(),
            size: self.size,
            payload: None,
            flags: self.flags,
            granted,
            ack_needed: false,
            retries: 0,
            nacked: None,
        }
    }

    /// Number of payload bytes carried.
    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Vec::len)
    }
}

/// A message waiting in an outgoing queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outgoing {
    pub event: MemEvent,
    /// Cycle at which the message was produced.
    pub enqueue_time: u64,
    /// Cycle at which the message may leave the cache.
    pub delivery_time: u64,
    /// True for responses travelling back to the original requestor.
    pub to_requestor: bool,
}

impl Outgoing {
    pub fn cmd(&self) -> Command {
        self.event.cmd
    }

    pub fn base_addr(&self) -> LineAddr {
        self.event.base_addr
    }

    pub fn destination(&self) -> &str {
        &self.event.dst
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.event.payload.as_deref()
    }
}

impl fmt::Display for Outgoing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "@{:<6} {:<9} {} -> {} line {}",
            self.delivery_time, self.event.cmd, self.event.src, self.event.dst, self.event.base_addr
        )?;
        if let Some(granted) = self.event.granted {
            write!(f, " granted {}", granted)?;
        }
        if self.event.payload_len() > 0 {
            write!(f, " ({} bytes)", self.event.payload_len())?;
        }
        Ok(())
    }
}
