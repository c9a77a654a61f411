//! Bottom Controller.
//!
//! The Bottom controller owns the relationship between one cache and the level
//! below it (a parent cache, a directory or memory). For each line it decides
//! whether the local copy satisfies a request or must be fetched/upgraded, and
//! it writes data back when the line is evicted, invalidated or downgraded.
//!
//! All downward traffic goes through the controller's `Port`. Nothing is ever
//! sent synchronously.

use log::{debug, warn};

use super::line::{CacheLine, LineState};
use super::message::{Command, MemEvent};
use super::protocol::{DowngradeAction, Protocol};
use super::queue::Port;
use crate::common::{CoherenceError, CoherenceResult, ConfigError, LineAddr};
use crate::config::TimingConfig;
use crate::stats::{AccessKind, AccessListener, CoherenceStats};

/// Outcome of `BottomController::handle_access`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessResult {
    /// The local copy satisfies the request.
    Hit,
    /// A request went down; the line is now transitional.
    Miss,
    /// A writeback or relinquish was absorbed.
    Done,
}

/// Backing-store-facing protocol engine.
pub struct BottomController {
    port: Port,
    protocol: Protocol,
    lower_level: Vec<String>,
    line_bytes: u64,
    listeners: Vec<Box<dyn AccessListener>>,
}

impl BottomController {
    /// Creates a controller.
    ///
    /// # Arguments
    ///
    /// * `name` - Name of this cache, used as the source of outgoing messages.
    /// * `protocol` - Protocol policy.
    /// * `lower_level` - Names of the next-level components. Lines are
    ///   interleaved across them by line number.
    /// * `line_bytes` - Line size in bytes.
    /// * `timing` - Latencies used to stamp outgoing messages.
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` if `lower_level` is empty.
    pub fn new(
        name: impl Into<String>,
        protocol: Protocol,
        lower_level: Vec<String>,
        line_bytes: u64,
        timing: TimingConfig,
    ) -> Result<Self, ConfigError> {
        if lower_level.is_empty() {
            return Err(ConfigError::Invalid(
                "bottom controller needs a lower level".to_string(),
            ));
        }
        Ok(Self {
            port: Port::new(name, timing),
            protocol,
            lower_level,
            line_bytes,
            listeners: Vec::new(),
        })
    }

    pub fn port(&self) -> &Port {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut Port {
        &mut self.port
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Registers a hit/miss observer.
    pub fn add_listener(&mut self, listener: Box<dyn AccessListener>) {
        self.listeners.push(listener);
    }

    /// Next-level component responsible for `base_addr`.
    pub fn destination(&self, base_addr: LineAddr) -> &str {
        let n = self.lower_level.len() as u64;
        let idx = base_addr.line_number(self.line_bytes) % n;
        &self.lower_level[idx as usize]
    }

    /// Writes a stable line back below and invalidates it.
    ///
    /// `S` sends `PutS`, `E` sends `PutE` without data, `M` and `O` send `PutM`
    /// with the line's data.
    pub fn handle_eviction(
        &mut self,
        line: &mut CacheLine,
        stats: &mut CoherenceStats,
    ) -> CoherenceResult<()> {
        let state = line.state();
        let cmd = match state {
            LineState::S => Command::PutS,
            LineState::E => Command::PutE,
            LineState::M | LineState::O => Command::PutM,
            _ => {
                return Err(CoherenceError::UnexpectedCommand {
                    addr: line.base_addr(),
                    cmd: Command::PutS,
                    state: format!("{} (eviction)", state),
                })
            }
        };
        if line.is_locked() {
            return Err(CoherenceError::InvariantViolation {
                addr: line.base_addr(),
                detail: "evicting a locked line".to_string(),
            });
        }

        let dst = self.destination(line.base_addr()).to_string();
        self.writeback(line, cmd, cmd == Command::PutM, dst);
        line.set_state(LineState::I)?;
        stats.record_eviction(state);
        debug!("{}: evict {} from {}", self.port.name(), line.base_addr(), state);
        Ok(())
    }

    /// Handles a request or writeback arriving from above.
    ///
    /// `replay` is true when the event is re-driven from the MSHR; replays are
    /// not classified as hits or misses a second time.
    pub fn handle_access(
        &mut self,
        event: &MemEvent,
        line: &mut CacheLine,
        replay: bool,
        stats: &mut CoherenceStats,
    ) -> CoherenceResult<AccessResult> {
        let state = line.state();
        // A sharer may give up its copy while this level is upgrading.
        if state.in_transition() && event.cmd != Command::PutS {
            return Err(unexpected(event, line));
        }

        match event.cmd {
            Command::GetS => {
                if event.flags.prefetch && !replay {
                    stats.prefetches += 1;
                }
                if state != LineState::I {
                    self.classify(event, true, replay, stats);
                    return Ok(AccessResult::Hit);
                }
                line.set_state(LineState::IS)?;
                self.fetch(event, line, stats);
                self.classify(event, false, replay, stats);
                Ok(AccessResult::Miss)
            }
            Command::GetX | Command::GetSEx => {
                let next = match state {
                    LineState::E | LineState::M => {
                        line.set_state(LineState::M)?;
                        apply_lock(event, line);
                        self.classify(event, true, replay, stats);
                        return Ok(AccessResult::Hit);
                    }
                    LineState::I => LineState::IM,
                    LineState::S => LineState::SM,
                    LineState::O => LineState::OM,
                    _ => return Err(unexpected(event, line)),
                };
                line.set_state(next)?;
                self.fetch(event, line, stats);
                self.classify(event, false, replay, stats);
                Ok(AccessResult::Miss)
            }
            Command::PutS => {
                stats.puts_s += 1;
                Ok(AccessResult::Done)
            }
            Command::PutE => {
                if !state.is_writable() {
                    return Err(unexpected(event, line));
                }
                stats.puts_e += 1;
                Ok(AccessResult::Done)
            }
            Command::PutM | Command::PutX | Command::FetchResp => {
                if !state.is_valid() {
                    return Err(unexpected(event, line));
                }
                let payload = event.payload.as_deref().ok_or(CoherenceError::MissingPayload {
                    addr: line.base_addr(),
                    cmd: event.cmd,
                })?;
                line.merge_payload(payload);
                if state == LineState::E {
                    line.set_state(LineState::M)?;
                }
                if event.cmd == Command::PutM {
                    stats.puts_m += 1;
                } else {
                    stats.puts_x += 1;
                }
                Ok(AccessResult::Done)
            }
            _ => Err(unexpected(event, line)),
        }
    }

    /// Passes a writeback for a line this level does not hold straight down.
    pub fn forward_writeback(&mut self, event: &MemEvent, stats: &mut CoherenceStats) {
        let dst = self.destination(event.base_addr).to_string();
        let now = self.port.timestamp();
        self.port.forward(event, &dst, now);
        stats.writebacks_sent += 1;
    }

    /// Handles an invalidation or downgrade arriving from below.
    ///
    /// `Inv` writes back `M`/`O` data (`PutM`) or `E` ownership (`PutE`) and
    /// invalidates; a shared copy is dropped silently unless the sender asked
    /// for an acknowledgement. `InvX` follows the protocol's downgrade action.
    pub fn handle_invalidate(
        &mut self,
        event: &MemEvent,
        line: &mut CacheLine,
        stats: &mut CoherenceStats,
    ) -> CoherenceResult<()> {
        if !self.protocol.is_coherent() {
            return Err(unexpected(event, line));
        }
        stats.invalidates_received += 1;
        match event.cmd {
            Command::Inv => self.invalidate(event, line, stats),
            Command::InvX => self.downgrade(event, line, stats),
            Command::FetchInv | Command::FetchInvX => {
                self.handle_fetch_invalidate(event, line, stats)
            }
            _ => Err(unexpected(event, line)),
        }
    }

    /// Resolves a transitional line with the response from below.
    ///
    /// # Returns
    ///
    /// The stable state the line settled in.
    ///
    /// # Errors
    ///
    /// `StaleAck` if no response was expected, `AckCountMismatch` if
    /// acknowledgements remain after this one.
    pub fn handle_response(
        &mut self,
        ack: &MemEvent,
        line: &mut CacheLine,
        original: Option<&MemEvent>,
    ) -> CoherenceResult<LineState> {
        let state = line.state();
        let expected = match state {
            LineState::IS => Command::GetSResp,
            LineState::IM | LineState::SM | LineState::OM => Command::GetXResp,
            _ => {
                line.take_ack()?;
                return Err(unexpected(ack, line));
            }
        };
        if ack.cmd != expected {
            return Err(unexpected(ack, line));
        }

        let remaining = line.take_ack()?;
        if remaining != 0 {
            return Err(CoherenceError::AckCountMismatch {
                addr: line.base_addr(),
                remaining,
            });
        }
        if let Some(payload) = ack.payload.as_deref() {
            line.merge_payload(payload);
        }

        let next = match state {
            LineState::IS => {
                let granted = self.protocol.normalize_grant(ack.granted.unwrap_or(LineState::S));
                if !matches!(granted, LineState::S | LineState::E | LineState::M) {
                    return Err(unexpected(ack, line));
                }
                granted
            }
            _ => LineState::M,
        };
        line.set_state(next)?;
        if original.map_or(false, |req| req.cmd == Command::GetSEx) {
            line.lock();
        }
        debug!(
            "{}: {} resolved {} -> {}",
            self.port.name(),
            line.base_addr(),
            state,
            next
        );
        Ok(next)
    }

    /// Answers a directory fetch with the line's data.
    ///
    /// `FetchInv` invalidates the line, `FetchInvX` demotes it to `S`.
    pub fn handle_fetch_invalidate(
        &mut self,
        event: &MemEvent,
        line: &mut CacheLine,
        stats: &mut CoherenceStats,
    ) -> CoherenceResult<()> {
        let state = line.state();
        if state == LineState::I {
            warn!(
                "{}: ignoring {} for invalid line {}",
                self.port.name(),
                event.cmd,
                line.base_addr()
            );
            return Ok(());
        }
        if state.in_transition() {
            return Err(unexpected(event, line));
        }

        let resp = event
            .make_response(Command::FetchResp, None)
            .with_payload(line.data().to_vec());
        self.port.send(resp);
        stats.fetch_responses_sent += 1;

        match event.cmd {
            Command::FetchInv => line.set_state(LineState::I),
            Command::FetchInvX => line.set_state(LineState::S),
            _ => Err(unexpected(event, line)),
        }
    }

    fn invalidate(
        &mut self,
        event: &MemEvent,
        line: &mut CacheLine,
        stats: &mut CoherenceStats,
    ) -> CoherenceResult<()> {
        let target = self.reply_target(event, line.base_addr());
        let (next, writeback) = match line.state() {
            LineState::M | LineState::O => (LineState::I, Some(Command::PutM)),
            LineState::E => (LineState::I, Some(Command::PutE)),
            LineState::S => (LineState::I, None),
            LineState::SM => (LineState::IM, None),
            LineState::OM => (LineState::IM, Some(Command::PutM)),
            LineState::I => return Ok(()),
            LineState::IS | LineState::IM => return Err(unexpected(event, line)),
        };

        match writeback {
            Some(cmd) => {
                self.writeback(line, cmd, cmd == Command::PutM, target);
                stats.writebacks_sent += 1;
            }
            None if event.ack_needed => {
                let ack = event.make_response(Command::InvAck, None);
                self.port.send(ack);
                stats.inv_acks_sent += 1;
            }
            None => {}
        }
        line.set_state(next)
    }

    fn downgrade(
        &mut self,
        event: &MemEvent,
        line: &mut CacheLine,
        stats: &mut CoherenceStats,
    ) -> CoherenceResult<()> {
        match self.protocol.on_downgrade(line.state()) {
            DowngradeAction::WritebackToShared => {
                let target = self.reply_target(event, line.base_addr());
                self.writeback(line, Command::PutX, true, target);
                stats.writebacks_sent += 1;
                line.set_state(LineState::S)
            }
            DowngradeAction::SupplyAsOwned => {
                let resp = event
                    .make_response(Command::FetchResp, None)
                    .with_payload(line.data().to_vec());
                self.port.send(resp);
                stats.fetch_responses_sent += 1;
                line.set_state(LineState::O)
            }
            DowngradeAction::Nothing => Ok(()),
        }
    }

    /// Sends the request for a missing or read-only line down.
    fn fetch(&mut self, event: &MemEvent, line: &mut CacheLine, stats: &mut CoherenceStats) {
        let mut req = event.clone();
        req.addr = line.base_addr().val();
        req.size = self.line_bytes as u32;
        let dst = self.destination(line.base_addr()).to_string();
        let now = self.port.timestamp();
        self.port.forward(&req, &dst, now);
        line.expect_acks(1);
        stats.requests_forwarded += 1;
    }

    fn writeback(&mut self, line: &CacheLine, cmd: Command, with_data: bool, dst: String) {
        let base = line.base_addr();
        let mut wb = MemEvent::new(self.port.name(), base.val(), base, cmd);
        wb.dst = dst;
        wb.size = self.line_bytes as u32;
        if with_data {
            wb.payload = Some(line.data().to_vec());
        }
        self.port.send(wb);
    }

    /// Invalidations are answered to whoever sent them.
    fn reply_target(&self, event: &MemEvent, base_addr: LineAddr) -> String {
        if event.src.is_empty() {
            self.destination(base_addr).to_string()
        } else {
            event.src.clone()
        }
    }

    fn classify(&mut self, event: &MemEvent, hit: bool, replay: bool, stats: &mut CoherenceStats) {
        if replay {
            return;
        }
        let kind = AccessKind::classify(event.cmd.is_write(), hit);
        stats.record_access(kind);
        for listener in self.listeners.iter_mut() {
            listener.notify(event.base_addr, kind);
        }
    }
}

/// `GetSEx` takes the line lock; the locked write that follows releases it.
fn apply_lock(event: &MemEvent, line: &mut CacheLine) {
    if event.cmd == Command::GetSEx {
        line.lock();
    } else if event.flags.locked {
        line.unlock();
    }
}

fn unexpected(event: &MemEvent, line: &CacheLine) -> CoherenceError {
    CoherenceError::UnexpectedCommand {
        addr: line.base_addr(),
        cmd: event.cmd,
        state: line.state().to_string(),
    }
}
