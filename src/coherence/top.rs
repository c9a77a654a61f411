//! Top Controller.
//!
//! The Top controller faces the requestors above a cache. It keeps the
//! `SharerSet` of each line consistent with the permissions it has handed out,
//! and sends whatever upward invalidation or downgrade traffic a request needs
//! before it can be granted.
//!
//! A request that has to wait for acknowledgements is reported as `Deferred`.
//! The caller parks it and re-drives it once the set is back to `Valid`.

use std::collections::HashMap;

use log::debug;

use super::line::{CacheLine, LineState};
use super::message::{Command, MemEvent};
use super::protocol::Protocol;
use super::queue::Port;
use super::sharers::{CcState, SharerSet};
use crate::common::{CoherenceError, CoherenceResult, LineAddr};
use crate::config::TimingConfig;
use crate::stats::CoherenceStats;

/// Outcome of `TopController::handle_request`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopOutcome {
    /// A response granting the given state was queued.
    Granted(LineState),
    /// Invalidations or a downgrade were sent; the request must be replayed
    /// once the set is `Valid` again.
    Deferred,
    /// A relinquish was absorbed. `shareless` is true when no upstream port
    /// holds the line any more.
    Released { shareless: bool },
    /// A relinquish from a port that no longer holds the line. It crossed an
    /// invalidation that did not wait for acknowledgements and is dropped.
    Stale,
}

/// Requestor-facing protocol engine.
pub struct TopController {
    port: Port,
    protocol: Protocol,
    upstream: Vec<String>,
    ids: HashMap<String, usize>,
}

impl TopController {
    /// Creates a controller serving `upstream`. Port ids follow list order.
    pub fn new(
        name: impl Into<String>,
        protocol: Protocol,
        upstream: Vec<String>,
        timing: TimingConfig,
    ) -> Self {
        let ids = upstream
            .iter()
            .enumerate()
            .map(|(id, name)| (name.clone(), id))
            .collect();
        Self {
            port: Port::new(name, timing),
            protocol,
            upstream,
            ids,
        }
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

    /// Number of upstream ports; the capacity every `SharerSet` is built with.
    pub fn num_ports(&self) -> usize {
        self.upstream.len()
    }

    /// Maps a requestor name to its port id.
    pub fn requestor_id(&self, name: &str) -> CoherenceResult<usize> {
        self.ids
            .get(name)
            .copied()
            .ok_or_else(|| CoherenceError::UnknownRequestor(name.to_string()))
    }

    /// Handles a request or relinquish from above.
    ///
    /// `line` must be stable and `cc` must be `Valid` for requests; the caller
    /// parks requests until both hold. Relinquishes are accepted while acking
    /// and count as acknowledgements.
    ///
    /// # Arguments
    ///
    /// * `event` - The request. `event.src` names the requestor.
    /// * `line` - The local line; its state and data feed the grant.
    /// * `cc` - The line's sharer/owner record.
    /// * `mshr_hit` - True if the request is replayed from the MSHR.
    /// * `stats` - Counters to update.
    pub fn handle_request(
        &mut self,
        event: &MemEvent,
        line: &CacheLine,
        cc: &mut SharerSet,
        mshr_hit: bool,
        stats: &mut CoherenceStats,
    ) -> CoherenceResult<TopOutcome> {
        let id = self.requestor_id(&event.src)?;

        if !self.protocol.is_coherent() {
            return self.handle_untracked(event, line, cc, mshr_hit, stats);
        }
        if event.cmd.is_put() {
            return self.handle_put(event, id, cc, stats);
        }
        if !event.cmd.is_request() || line.in_transition() || cc.in_transition() {
            return Err(CoherenceError::UnexpectedCommand {
                addr: cc.base_addr(),
                cmd: event.cmd,
                state: format!("{}/{}", line.state(), cc.state()),
            });
        }

        match event.cmd {
            Command::GetS => {
                if let Some(owner) = cc.owner() {
                    if owner == id {
                        return Err(CoherenceError::InvariantViolation {
                            addr: cc.base_addr(),
                            detail: format!("owner {} re-requesting a shared copy", event.src),
                        });
                    }
                    self.send_invalidate_x(cc, event.base_addr, stats);
                    cc.begin_acking(CcState::InvXAcking, 1)?;
                    return Ok(TopOutcome::Deferred);
                }
                if cc.is_shareless() && self.protocol.grants_exclusive(line.state()) {
                    cc.set_owner(id)?;
                    stats.exclusive_grants += 1;
                    return Ok(self.grant(event, line, LineState::E, mshr_hit, stats));
                }
                cc.add_sharer(id)?;
                Ok(self.grant(event, line, LineState::S, mshr_hit, stats))
            }
            _ => {
                if cc.owner().map_or(false, |owner| owner != id) {
                    let sent = self.send_invalidates(cc, event.base_addr, Some(id), true, stats);
                    cc.begin_acking(CcState::InvAcking, sent)?;
                    return Ok(TopOutcome::Deferred);
                }

                let others = cc.num_sharers() - usize::from(cc.is_sharer(id));
                if others > 0 {
                    let strict = event.cmd == Command::GetSEx;
                    let sent = self.send_invalidates(cc, event.base_addr, Some(id), strict, stats);
                    if strict {
                        cc.begin_acking(CcState::InvAcking, sent)?;
                        return Ok(TopOutcome::Deferred);
                    }
                }

                cc.remove_all_sharers()?;
                cc.set_owner(id)?;
                Ok(self.grant(event, line, LineState::M, mshr_hit, stats))
            }
        }
    }

    /// Consumes an `InvAck`: the sender no longer holds the line.
    ///
    /// # Returns
    ///
    /// The number of acknowledgements still outstanding.
    pub fn handle_inv_ack(
        &mut self,
        event: &MemEvent,
        cc: &mut SharerSet,
        stats: &mut CoherenceStats,
    ) -> CoherenceResult<u32> {
        let id = self.requestor_id(&event.src)?;
        if cc.is_valid() {
            return Err(CoherenceError::StaleAck { addr: cc.base_addr() });
        }
        if cc.owner() == Some(id) {
            cc.clear_owner()?;
        } else if cc.is_sharer(id) {
            cc.remove_sharer(id)?;
        } else {
            return Err(CoherenceError::InvariantViolation {
                addr: cc.base_addr(),
                detail: format!("InvAck from {} which holds nothing", event.src),
            });
        }
        stats.inv_acks_received += 1;
        cc.take_ack()
    }

    /// Propagates an invalidation from below to every upstream holder.
    ///
    /// `Inv`/`FetchInv` invalidate all sharers and the owner; `InvX`/`FetchInvX`
    /// downgrade the owner only.
    ///
    /// # Returns
    ///
    /// True if acknowledgements are outstanding and the local side must wait.
    pub fn handle_invalidate(
        &mut self,
        event: &MemEvent,
        cc: &mut SharerSet,
        stats: &mut CoherenceStats,
    ) -> CoherenceResult<bool> {
        if cc.in_transition() || !self.protocol.is_coherent() {
            return Err(CoherenceError::UnexpectedCommand {
                addr: cc.base_addr(),
                cmd: event.cmd,
                state: cc.state().to_string(),
            });
        }
        match event.cmd {
            Command::Inv | Command::FetchInv => {
                let sent = self.send_invalidates(cc, event.base_addr, None, true, stats);
                if sent == 0 {
                    return Ok(false);
                }
                cc.begin_acking(CcState::InvAcking, sent)?;
                Ok(true)
            }
            Command::InvX | Command::FetchInvX => {
                if self.send_invalidate_x(cc, event.base_addr, stats) == 0 {
                    return Ok(false);
                }
                cc.begin_acking(CcState::InvXAcking, 1)?;
                Ok(true)
            }
            _ => Err(CoherenceError::UnexpectedCommand {
                addr: cc.base_addr(),
                cmd: event.cmd,
                state: cc.state().to_string(),
            }),
        }
    }

    /// Invalidates every upstream holder of a line about to be evicted.
    ///
    /// # Returns
    ///
    /// True if the eviction must wait for acknowledgements.
    pub fn handle_eviction(
        &mut self,
        cc: &mut SharerSet,
        stats: &mut CoherenceStats,
    ) -> CoherenceResult<bool> {
        if cc.in_transition() {
            return Ok(true);
        }
        let base = cc.base_addr();
        let sent = self.send_invalidates(cc, base, None, true, stats);
        if sent == 0 {
            return Ok(false);
        }
        cc.begin_acking(CcState::InvAcking, sent)?;
        Ok(true)
    }

    /// Sends `Inv` to every sharer and to the owner, skipping `exclude`.
    ///
    /// # Returns
    ///
    /// The number of invalidations sent.
    pub fn send_invalidates(
        &mut self,
        cc: &SharerSet,
        base_addr: LineAddr,
        exclude: Option<usize>,
        ack_needed: bool,
        stats: &mut CoherenceStats,
    ) -> u32 {
        let targets: Vec<usize> = cc
            .sharers()
            .iter()
            .chain(cc.owner())
            .filter(|&id| Some(id) != exclude)
            .collect();
        for &id in &targets {
            let mut inv = MemEvent::new(self.port.name(), base_addr.val(), base_addr, Command::Inv);
            inv.dst = self.upstream[id].clone();
            inv.ack_needed = ack_needed;
            self.port.send(inv);
        }
        stats.invalidates_sent += targets.len() as u64;
        debug!(
            "{}: {} invalidations for {} (ack {})",
            self.port.name(),
            targets.len(),
            base_addr,
            ack_needed
        );
        targets.len() as u32
    }

    /// Sends `InvX` to the owner, if there is one.
    ///
    /// # Returns
    ///
    /// The number of downgrades sent (0 or 1).
    pub fn send_invalidate_x(
        &mut self,
        cc: &SharerSet,
        base_addr: LineAddr,
        stats: &mut CoherenceStats,
    ) -> u32 {
        let Some(owner) = cc.owner() else {
            return 0;
        };
        let mut inv = MemEvent::new(self.port.name(), base_addr.val(), base_addr, Command::InvX);
        inv.dst = self.upstream[owner].clone();
        inv.ack_needed = true;
        self.port.send(inv);
        stats.downgrades_sent += 1;
        1
    }

    fn handle_put(
        &mut self,
        event: &MemEvent,
        id: usize,
        cc: &mut SharerSet,
        stats: &mut CoherenceStats,
    ) -> CoherenceResult<TopOutcome> {
        if event.cmd == Command::PutS {
            if !cc.is_sharer(id) {
                return Ok(self.stale_put(event, stats));
            }
            cc.remove_sharer(id)?;
        } else if event.cmd == Command::PutM && cc.is_sharer(id) {
            // An Owned copy above is written back by its holder as a sharer.
            cc.remove_sharer(id)?;
        } else {
            if cc.owner() != Some(id) {
                if event.cmd == Command::PutM && self.protocol.supports_owned() {
                    return Ok(self.stale_put(event, stats));
                }
                return Err(CoherenceError::InvariantViolation {
                    addr: cc.base_addr(),
                    detail: format!("{} from non-owner {}", event.cmd, event.src),
                });
            }
            cc.clear_owner()?;
        }

        if cc.in_transition() {
            cc.take_ack()?;
            stats.inv_acks_received += 1;
        }

        // A downgraded owner stays on as a plain sharer.
        if matches!(event.cmd, Command::PutX | Command::FetchResp) && cc.is_valid() {
            cc.add_sharer(id)?;
        }
        Ok(TopOutcome::Released {
            shareless: cc.is_idle(),
        })
    }

    fn stale_put(&self, event: &MemEvent, stats: &mut CoherenceStats) -> TopOutcome {
        debug!(
            "{}: dropping stale {} from {} for {}",
            self.port.name(),
            event.cmd,
            event.src,
            event.base_addr
        );
        stats.stale_puts += 1;
        TopOutcome::Stale
    }

    /// Incoherent protocol: every valid line is handed out whole, nothing is
    /// tracked above and relinquishes only carry data back.
    fn handle_untracked(
        &mut self,
        event: &MemEvent,
        line: &CacheLine,
        cc: &SharerSet,
        mshr_hit: bool,
        stats: &mut CoherenceStats,
    ) -> CoherenceResult<TopOutcome> {
        let protocol = self.protocol;
        let unexpected = || CoherenceError::UnexpectedCommand {
            addr: cc.base_addr(),
            cmd: event.cmd,
            state: format!("{} ({})", line.state(), protocol),
        };
        match event.cmd {
            Command::PutM | Command::PutE => Ok(TopOutcome::Released { shareless: true }),
            Command::GetS if line.state().is_writable() => {
                stats.exclusive_grants += 1;
                Ok(self.grant(event, line, LineState::E, mshr_hit, stats))
            }
            Command::GetX | Command::GetSEx if line.state().is_writable() => {
                Ok(self.grant(event, line, LineState::M, mshr_hit, stats))
            }
            _ => Err(unexpected()),
        }
    }

    fn grant(
        &mut self,
        event: &MemEvent,
        line: &CacheLine,
        state: LineState,
        mshr_hit: bool,
        stats: &mut CoherenceStats,
    ) -> TopOutcome {
        let cmd = event.cmd.response_cmd().unwrap_or(Command::GetSResp);
        let now = self.port.timestamp();
        self.port
            .respond(event, cmd, Some(state), Some(line.data()), mshr_hit, now);
        stats.responses_sent += 1;
        TopOutcome::Granted(state)
    }
}
