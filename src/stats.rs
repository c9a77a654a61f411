//! Coherence statistics collection and reporting.
//!
//! Tracks hit/miss classification, eviction and invalidation traffic, and
//! MSHR behaviour. The statistics live in an explicit struct owned by the
//! caller and passed into the controllers by reference.

use serde::Serialize;

use crate::coherence::line::LineState;
use crate::common::LineAddr;

/// Hit/miss classification of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum AccessKind {
    ReadHit,
    ReadMiss,
    WriteHit,
    WriteMiss,
}

impl AccessKind {
    /// Classifies an access.
    pub fn classify(write: bool, hit: bool) -> Self {
        match (write, hit) {
            (false, true) => AccessKind::ReadHit,
            (false, false) => AccessKind::ReadMiss,
            (true, true) => AccessKind::WriteHit,
            (true, false) => AccessKind::WriteMiss,
        }
    }
}

/// Fire-and-forget observer of hit/miss classification.
pub trait AccessListener {
    /// Called once per classified request.
    fn notify(&mut self, addr: LineAddr, kind: AccessKind);
}

/// Coherence statistics for one cache.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CoherenceStats {
    pub read_hits: u64,
    pub read_misses: u64,
    pub write_hits: u64,
    pub write_misses: u64,
    pub prefetches: u64,

    pub evict_s: u64,
    pub evict_e: u64,
    pub evict_m: u64,
    pub evict_o: u64,

    pub puts_s: u64,
    pub puts_e: u64,
    pub puts_m: u64,
    pub puts_x: u64,
    pub stale_puts: u64,

    pub requests_forwarded: u64,
    pub writebacks_sent: u64,
    pub fetch_responses_sent: u64,
    pub responses_sent: u64,
    pub exclusive_grants: u64,

    pub invalidates_sent: u64,
    pub downgrades_sent: u64,
    pub inv_acks_sent: u64,
    pub inv_acks_received: u64,
    pub invalidates_received: u64,

    pub nacks_sent: u64,
    pub retries: u64,
    pub stalls: u64,
    pub mshr_hits: u64,
}

impl CoherenceStats {
    /// Counts one classified access.
    pub fn record_access(&mut self, kind: AccessKind) {
        match kind {
            AccessKind::ReadHit => self.read_hits += 1,
            AccessKind::ReadMiss => self.read_misses += 1,
            AccessKind::WriteHit => self.write_hits += 1,
            AccessKind::WriteMiss => self.write_misses += 1,
        }
    }

    /// Counts an eviction of a line in `state`.
    pub fn record_eviction(&mut self, state: LineState) {
        match state {
            LineState::S => self.evict_s += 1,
            LineState::E => self.evict_e += 1,
            LineState::M => self.evict_m += 1,
            LineState::O => self.evict_o += 1,
            _ => {}
        }
    }

    pub fn accesses(&self) -> u64 {
        self.read_hits + self.read_misses + self.write_hits + self.write_misses
    }

    pub fn misses(&self) -> u64 {
        self.read_misses + self.write_misses
    }

    /// Miss rate in percent. Zero when nothing was accessed.
    pub fn miss_rate(&self) -> f64 {
        let total = self.accesses();
        if total == 0 {
            0.0
        } else {
            self.misses() as f64 / total as f64 * 100.0
        }
    }

    /// Prints a formatted summary.
    pub fn print(&self, name: &str) {
        println!("\n==========================================================");
        println!("COHERENCE STATISTICS: {}", name);
        println!("==========================================================");
        println!("ACCESSES");
        println!("  accesses               {}", self.accesses());
        println!("  read.hits              {}", self.read_hits);
        println!("  read.misses            {}", self.read_misses);
        println!("  write.hits             {}", self.write_hits);
        println!("  write.misses           {}", self.write_misses);
        println!("  miss_rate              {:.2}%", self.miss_rate());
        println!("  prefetches             {}", self.prefetches);
        println!("----------------------------------------------------------");
        println!("EVICTIONS");
        println!("  evict.S                {}", self.evict_s);
        println!("  evict.E                {}", self.evict_e);
        println!("  evict.M                {}", self.evict_m);
        println!("  evict.O                {}", self.evict_o);
        println!("----------------------------------------------------------");
        println!("UPSTREAM TRAFFIC");
        println!("  put.S                  {}", self.puts_s);
        println!("  put.E                  {}", self.puts_e);
        println!("  put.M                  {}", self.puts_m);
        println!("  put.X                  {}", self.puts_x);
        println!("  put.stale              {}", self.stale_puts);
        println!("  responses              {}", self.responses_sent);
        println!("  grants.exclusive       {}", self.exclusive_grants);
        println!("  inv.sent               {}", self.invalidates_sent);
        println!("  invx.sent              {}", self.downgrades_sent);
        println!("  inv_ack.received       {}", self.inv_acks_received);
        println!("----------------------------------------------------------");
        println!("DOWNSTREAM TRAFFIC");
        println!("  forwarded              {}", self.requests_forwarded);
        println!("  writebacks             {}", self.writebacks_sent);
        println!("  fetch_resp             {}", self.fetch_responses_sent);
        println!("  inv.received           {}", self.invalidates_received);
        println!("  inv_ack.sent           {}", self.inv_acks_sent);
        println!("----------------------------------------------------------");
        println!("MSHR");
        println!("  stalls                 {}", self.stalls);
        println!("  replays                {}", self.mshr_hits);
        println!("  nacks                  {}", self.nacks_sent);
        println!("  retries                {}", self.retries);
        println!("==========================================================");
    }
}
