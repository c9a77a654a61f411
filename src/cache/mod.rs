//! Cache Shell.
//!
//! A `Cache` wires one Top and one Bottom controller to a line array and an
//! MSHR. It is the single entry point for events: it looks the line up (or
//! allocates one), runs the controllers, parks whatever has to wait and
//! replays parked events once their line is stable again.
//!
//! Nothing is delivered from here. Outgoing traffic accumulates in the two
//! controller ports until `drain_outgoing` is called by the clock driver.

pub mod array;
pub mod mshr;
pub mod policies;

use std::collections::HashMap;

use log::{debug, warn};

pub use array::{LineArray, LineIndex};
pub use mshr::Mshr;

use crate::coherence::{
    AccessResult, BottomController, CacheLine, Command, LineState, MemEvent, Outgoing, Protocol,
    SharerSet, TopController, TopOutcome,
};
use crate::common::{CoherenceError, CoherenceResult, ConfigError, LineAddr};
use crate::config::Config;
use crate::stats::{AccessListener, CoherenceStats};

/// What happened to an event handed to `Cache::handle_event`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// Fully handled.
    Completed,
    /// Parked in the MSHR behind the given line.
    Stalled(LineAddr),
    /// Refused; a NACK went back to the requestor.
    Nacked,
}

/// Messages drained from both sides of a cache.
#[derive(Debug, Default)]
pub struct Outbound {
    /// Towards the next level.
    pub down: Vec<Outgoing>,
    /// Towards the requestors.
    pub up: Vec<Outgoing>,
}

impl Outbound {
    pub fn is_empty(&self) -> bool {
        self.down.is_empty() && self.up.is_empty()
    }

    pub fn len(&self) -> usize {
        self.down.len() + self.up.len()
    }

    /// Both directions interleaved by delivery time. Each side keeps its own
    /// queue order.
    pub fn merged(self) -> Vec<Outgoing> {
        let mut all = Vec::with_capacity(self.len());
        let mut down = self.down.into_iter().peekable();
        let mut up = self.up.into_iter().peekable();
        loop {
            let take_down = match (down.peek(), up.peek()) {
                (Some(d), Some(u)) => d.delivery_time <= u.delivery_time,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            all.extend(if take_down { down.next() } else { up.next() });
        }
        all
    }
}

enum Allocation {
    Ready(LineIndex),
    Blocked(LineAddr),
    Locked,
}

pub struct Cache {
    name: String,
    line_bytes: u64,
    top: TopController,
    bottom: BottomController,
    array: LineArray,
    mshr: Mshr,
    lock_holders: HashMap<LineAddr, String>,
    stats: CoherenceStats,
}

impl Cache {
    /// Builds a cache from a configuration.
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let c = &config.cache;
        let top = TopController::new(c.name.clone(), c.protocol, c.upstream.clone(), config.timing);
        let bottom = BottomController::new(
            c.name.clone(),
            c.protocol,
            c.lower_level.clone(),
            c.line_bytes,
            config.timing,
        )?;
        Ok(Self {
            name: c.name.clone(),
            line_bytes: c.line_bytes,
            array: LineArray::new(c.line_bytes, c.lines, c.ways, top.num_ports()),
            mshr: Mshr::new(c.mshr_entries),
            lock_holders: HashMap::new(),
            stats: CoherenceStats::default(),
            top,
            bottom,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> Protocol {
        self.top.protocol()
    }

    pub fn stats(&self) -> &CoherenceStats {
        &self.stats
    }

    pub fn mshr(&self) -> &Mshr {
        &self.mshr
    }

    pub fn add_listener(&mut self, listener: Box<dyn AccessListener>) {
        self.bottom.add_listener(listener);
    }

    /// Line record for `addr`, if resident.
    pub fn line(&self, addr: u64) -> Option<&CacheLine> {
        let key = LineAddr::new(addr, self.line_bytes);
        self.array.lookup(key).map(|idx| self.array.line(idx))
    }

    /// State of `addr`; `I` when not resident.
    pub fn line_state(&self, addr: u64) -> LineState {
        self.line(addr).map_or(LineState::I, CacheLine::state)
    }

    /// Sharer set for `addr`, if resident.
    pub fn sharer_set(&self, addr: u64) -> Option<&SharerSet> {
        let key = LineAddr::new(addr, self.line_bytes);
        self.array.lookup(key).map(|idx| self.array.sharer(idx))
    }

    /// Handles one event arriving at cycle `now`.
    ///
    /// # Errors
    ///
    /// Any protocol violation. The cache is in an undefined state afterwards.
    pub fn handle_event(&mut self, mut event: MemEvent, now: u64) -> CoherenceResult<Status> {
        self.top.port_mut().set_timestamp(now);
        self.bottom.port_mut().set_timestamp(now);

        event.base_addr = LineAddr::new(event.addr, self.line_bytes);
        let key = event.base_addr;
        debug!("{}: @{} {} {} from {}", self.name, now, event.cmd, key, event.src);

        let status = match event.cmd {
            Command::GetS | Command::GetX | Command::GetSEx => self.process_request(event, None)?,
            Command::PutS | Command::PutE | Command::PutM | Command::PutX | Command::FetchResp => {
                self.process_put(event)?
            }
            Command::Inv | Command::InvX | Command::FetchInv | Command::FetchInvX => {
                self.process_invalidate(event)?
            }
            Command::GetSResp | Command::GetXResp => self.process_access_ack(event)?,
            Command::InvAck => self.process_inv_ack(event)?,
            Command::Nack => self.process_nack(event)?,
        };

        self.activate_waiting(key)?;
        Ok(status)
    }

    /// Whether `event` would have to wait in the MSHR if handled now.
    ///
    /// The caller NACKs such a request when the MSHR is full.
    pub fn would_stall(&self, event: &MemEvent) -> bool {
        let key = LineAddr::new(event.addr, self.line_bytes);
        let holds_lock = self.holds_lock(key, &event.src);
        if self.mshr.contains(key) && !holds_lock {
            return true;
        }
        let Some(idx) = self.array.lookup(key) else {
            return true;
        };
        let line = self.array.line(idx);
        let cc = self.array.sharer(idx);
        if line.in_transition() || cc.in_transition() || (line.is_locked() && !holds_lock) {
            return true;
        }

        let id = self.top.requestor_id(&event.src).ok();
        let other_owner = matches!((cc.owner(), id), (Some(owner), Some(id)) if owner != id);
        let other_sharers = id.map_or(false, |id| cc.num_sharers() > usize::from(cc.is_sharer(id)));
        match event.cmd {
            Command::GetS => line.state() == LineState::I || other_owner,
            Command::GetX => !line.state().is_writable() || other_owner,
            Command::GetSEx => !line.state().is_writable() || other_owner || other_sharers,
            _ => false,
        }
    }

    /// Removes every outgoing message due by `now` from both sides.
    pub fn drain_outgoing(&mut self, now: u64) -> Outbound {
        Outbound {
            down: self.bottom.port_mut().drain(now),
            up: self.top.port_mut().drain(now),
        }
    }

    /// Earliest delivery time still queued on either side.
    pub fn next_delivery(&self) -> Option<u64> {
        let down = self.bottom.port().queue().next_delivery();
        let up = self.top.port().queue().next_delivery();
        match (down, up) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn process_request(
        &mut self,
        event: MemEvent,
        replay_from: Option<LineAddr>,
    ) -> CoherenceResult<Status> {
        let key = event.base_addr;
        let replay = replay_from.is_some();
        let holds_lock = self.holds_lock(key, &event.src);

        if !replay {
            if self.mshr.is_full() && self.would_stall(&event) {
                return Ok(self.nack(&event));
            }
            if self.mshr.contains(key) && !holds_lock {
                self.stats.stalls += 1;
                return Ok(self.park(event, key, replay_from));
            }
        }

        let idx = match self.array.lookup(key) {
            Some(idx) => idx,
            None => match self.allocate(key)? {
                Allocation::Ready(idx) => idx,
                Allocation::Locked => return Ok(self.nack(&event)),
                Allocation::Blocked(victim) => {
                    self.stats.stalls += 1;
                    return Ok(self.park(event, victim, replay_from));
                }
            },
        };

        let (line, cc) = self.array.entry_mut(idx);
        if line.in_transition() || cc.in_transition() || (line.is_locked() && !holds_lock) {
            self.stats.stalls += 1;
            return Ok(self.park(event, key, replay_from));
        }
        if event.cmd == Command::GetSEx {
            self.lock_holders.insert(key, event.src.clone());
        }

        match self.bottom.handle_access(&event, line, replay, &mut self.stats)? {
            AccessResult::Miss => {
                self.array.touch(idx);
                return Ok(self.park(event, key, replay_from));
            }
            AccessResult::Hit => {}
            AccessResult::Done => return Ok(Status::Completed),
        }

        let (line, cc) = self.array.entry_mut(idx);
        let outcome = self
            .top
            .handle_request(&event, line, cc, replay, &mut self.stats)?;
        self.array.touch(idx);
        match outcome {
            TopOutcome::Deferred => Ok(self.park(event, key, replay_from)),
            _ => {
                if event.flags.locked && event.cmd == Command::GetX {
                    self.lock_holders.remove(&key);
                }
                Ok(Status::Completed)
            }
        }
    }

    /// Makes room for `key`, evicting the victim if it holds a line.
    fn allocate(&mut self, key: LineAddr) -> CoherenceResult<Allocation> {
        let idx = self.array.find_victim(key);
        let (line, cc) = self.array.entry_mut(idx);
        let victim = line.base_addr();

        if line.is_locked() {
            return Ok(Allocation::Locked);
        }
        if line.in_transition() || cc.in_transition() {
            return Ok(Allocation::Blocked(victim));
        }
        if line.state() != LineState::I {
            if self.top.handle_eviction(cc, &mut self.stats)? {
                debug!("{}: eviction of {} waits for upstream", self.name, victim);
                return Ok(Allocation::Blocked(victim));
            }
            self.bottom.handle_eviction(line, &mut self.stats)?;
        }
        self.array.retag(idx, key)?;
        Ok(Allocation::Ready(idx))
    }

    /// A relinquish that crossed an unacknowledged invalidation may find its
    /// line already gone; it carries nothing this level still needs. Without
    /// coherence, upstream copies outlive evictions here and their writebacks
    /// go straight below.
    fn process_put(&mut self, event: MemEvent) -> CoherenceResult<Status> {
        let key = event.base_addr;
        let Some(idx) = self.array.lookup(key) else {
            let protocol = self.top.protocol();
            if !protocol.is_coherent() && matches!(event.cmd, Command::PutM | Command::PutE) {
                self.top.requestor_id(&event.src)?;
                self.bottom.forward_writeback(&event, &mut self.stats);
                return Ok(Status::Completed);
            }
            let may_cross = event.cmd == Command::PutS
                || (event.cmd == Command::PutM && protocol.supports_owned());
            if !may_cross || !protocol.is_coherent() {
                return Err(CoherenceError::NotResident(key));
            }
            debug!(
                "{}: dropping {} from {} for evicted {}",
                self.name, event.cmd, event.src, key
            );
            self.stats.stale_puts += 1;
            return Ok(Status::Completed);
        };
        let (line, cc) = self.array.entry_mut(idx);

        let outcome = self
            .top
            .handle_request(&event, line, cc, false, &mut self.stats)?;
        match outcome {
            TopOutcome::Stale => return Ok(Status::Completed),
            TopOutcome::Released { shareless: true } => {
                debug!("{}: no upstream holders left for {}", self.name, key);
            }
            _ => {}
        }
        self.bottom
            .handle_access(&event, line, false, &mut self.stats)?;
        Ok(Status::Completed)
    }

    /// Invalidations wait at the front of their line's queue while the line
    /// is filling or its upstream side is acking.
    fn process_invalidate(&mut self, event: MemEvent) -> CoherenceResult<Status> {
        let key = event.base_addr;
        let Some(idx) = self.array.lookup(key) else {
            if event.cmd.is_fetch() {
                warn!("{}: {} for non-resident line {}", self.name, event.cmd, key);
            }
            return Ok(Status::Completed);
        };

        let (line, cc) = self.array.entry_mut(idx);
        if matches!(line.state(), LineState::IS | LineState::IM) || cc.in_transition() {
            self.stats.stalls += 1;
            self.mshr.push_front(key, event);
            return Ok(Status::Stalled(key));
        }

        if self.top.handle_invalidate(&event, cc, &mut self.stats)? {
            self.mshr.push_front(key, event);
            return Ok(Status::Stalled(key));
        }
        self.bottom
            .handle_invalidate(&event, line, &mut self.stats)?;
        if line.state() == LineState::I {
            self.array.demote(idx);
        }
        Ok(Status::Completed)
    }

    fn process_access_ack(&mut self, event: MemEvent) -> CoherenceResult<Status> {
        let key = event.base_addr;
        let idx = self
            .array
            .lookup(key)
            .ok_or(CoherenceError::NotResident(key))?;
        let line = self.array.line_mut(idx);
        let original = self.mshr.front_request(key);
        self.bottom.handle_response(&event, line, original)?;
        Ok(Status::Completed)
    }

    fn process_inv_ack(&mut self, event: MemEvent) -> CoherenceResult<Status> {
        let key = event.base_addr;
        let idx = self
            .array
            .lookup(key)
            .ok_or(CoherenceError::NotResident(key))?;
        let cc = self.array.sharer_mut(idx);
        self.top.handle_inv_ack(&event, cc, &mut self.stats)?;
        Ok(Status::Completed)
    }

    /// Resends the request a lower level refused.
    fn process_nack(&mut self, event: MemEvent) -> CoherenceResult<Status> {
        let refused = event.nacked.ok_or(CoherenceError::InvariantViolation {
            addr: event.base_addr,
            detail: "NACK without the refused request".to_string(),
        })?;
        self.stats.retries += 1;
        self.bottom.port_mut().resend(*refused);
        Ok(Status::Completed)
    }

    /// Replays parked events for `key` in order until one has to wait again.
    fn activate_waiting(&mut self, key: LineAddr) -> CoherenceResult<()> {
        while self.is_ready(key) {
            let Some(event) = self.mshr.pop_front(key) else {
                break;
            };
            self.stats.mshr_hits += 1;
            let status = if event.cmd.is_request() {
                self.process_request(event, Some(key))?
            } else if event.cmd.is_invalidate() || event.cmd.is_fetch() {
                self.process_invalidate(event)?
            } else {
                return Err(CoherenceError::UnexpectedCommand {
                    addr: key,
                    cmd: event.cmd,
                    state: "parked".to_string(),
                });
            };
            if status == Status::Stalled(key) {
                break;
            }
        }
        Ok(())
    }

    /// A line is ready when nothing is outstanding on it, or when it was
    /// re-tagged and its waiters must allocate again.
    fn is_ready(&self, key: LineAddr) -> bool {
        match self.array.lookup(key) {
            Some(idx) => {
                self.array.line(idx).state().is_stable() && self.array.sharer(idx).is_valid()
            }
            None => true,
        }
    }

    fn holds_lock(&self, key: LineAddr, src: &str) -> bool {
        self.lock_holders.get(&key).map_or(false, |holder| holder == src)
    }

    /// Parks a request. A replayed request goes back to the front of the queue
    /// it came from so it keeps its place.
    fn park(&mut self, event: MemEvent, key: LineAddr, replay_from: Option<LineAddr>) -> Status {
        if replay_from == Some(key) {
            self.mshr.push_front(key, event);
        } else {
            self.mshr.push_back(key, event);
        }
        Status::Stalled(key)
    }

    fn nack(&mut self, event: &MemEvent) -> Status {
        self.top.port_mut().send_nack(event);
        self.stats.nacks_sent += 1;
        Status::Nacked
    }
}
