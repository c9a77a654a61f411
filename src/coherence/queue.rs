//! Outgoing Message Queue.
//!
//! Messages leave a cache in delivery-time order, not in the order they were
//! produced: a response replayed from the MSHR carries a shorter latency than
//! a miss response produced earlier and may overtake it. Two messages for the
//! same line are never reordered, whatever their delivery times.
//!
//! `Port` wraps a queue with the latency rules that turn "now" into a delivery
//! time for each kind of message.

use std::collections::VecDeque;

use super::line::LineState;
use super::message::{Command, MemEvent, Outgoing};
use crate::common::LineAddr;
use crate::config::TimingConfig;

/// Backoff exponent cap for resent requests.
const MAX_BACKOFF_SHIFT: u32 = 10;

/// Delivery-time ordered message buffer.
#[derive(Debug, Default)]
pub struct MessageQueue {
    entries: VecDeque<Outgoing>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `msg` in delivery-time order.
    ///
    /// Scans back from the tail and stops at the first entry that is due no
    /// later than `msg` or that targets the same line. Equal times keep
    /// insertion order.
    pub fn enqueue(&mut self, msg: Outgoing) {
        let mut pos = self.entries.len();
        while pos > 0 {
            let prev = &self.entries[pos - 1];
            if msg.delivery_time >= prev.delivery_time || msg.base_addr() == prev.base_addr() {
                break;
            }
            pos -= 1;
        }
        self.entries.insert(pos, msg);
    }

    /// Removes and returns, in order, every message due at or before `up_to`.
    ///
    /// A due message stays queued if an earlier message for the same line is
    /// not yet due.
    pub fn drain(&mut self, up_to: u64) -> Vec<Outgoing> {
        let mut out = Vec::new();
        let mut blocked: Vec<LineAddr> = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for msg in self.entries.drain(..) {
            if msg.delivery_time <= up_to && !blocked.contains(&msg.base_addr()) {
                out.push(msg);
            } else {
                blocked.push(msg.base_addr());
                kept.push_back(msg);
            }
        }
        self.entries = kept;
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest delivery time in the queue, if any.
    pub fn next_delivery(&self) -> Option<u64> {
        self.entries.iter().map(|m| m.delivery_time).min()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Outgoing> {
        self.entries.iter()
    }
}

/// One side of a controller: its name, clock view and outgoing queue.
#[derive(Debug)]
pub struct Port {
    name: String,
    timing: TimingConfig,
    timestamp: u64,
    queue: MessageQueue,
}

impl Port {
    pub fn new(name: impl Into<String>, timing: TimingConfig) -> Self {
        Self {
            name: name.into(),
            timing,
            timestamp: 0,
            queue: MessageQueue::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timing(&self) -> TimingConfig {
        self.timing
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Advances this port's view of the clock.
    pub fn set_timestamp(&mut self, now: u64) {
        self.timestamp = now;
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// Removes every message that may leave by `now`.
    pub fn drain(&mut self, now: u64) -> Vec<Outgoing> {
        self.queue.drain(now)
    }

    /// Forwards a request to `dst`.
    ///
    /// Delivery is `max(base_time, now) + tag_latency`; uncached requests skip
    /// the tag lookup and leave at `now + mshr_latency`.
    pub fn forward(&mut self, event: &MemEvent, dst: &str, base_time: u64) -> u64 {
        let mut fwd = event.clone();
        fwd.src = self.name.clone();
        fwd.dst = dst.to_string();
        fwd.nacked = None;
        fwd.retries = 0;

        let base = base_time.max(self.timestamp);
        let delivery = if event.flags.uncached {
            self.timestamp + self.timing.mshr_latency
        } else {
            base + self.timing.tag_latency
        };
        self.push(fwd, delivery, false)
    }

    /// Sends the response to `event` back to its requestor.
    ///
    /// Delivery is `max(base_time, now)` plus `mshr_latency` for a request
    /// replayed from the MSHR, `access_latency` otherwise.
    pub fn respond(
        &mut self,
        event: &MemEvent,
        cmd: Command,
        granted: Option<LineState>,
        payload: Option<&[u8]>,
        replay: bool,
        base_time: u64,
    ) -> u64 {
        let mut resp = event.make_response(cmd, granted);
        resp.src = self.name.clone();
        resp.payload = payload.map(<[u8]>::to_vec);

        let base = base_time.max(self.timestamp);
        let latency = if replay {
            self.timing.mshr_latency
        } else {
            self.timing.access_latency
        };
        self.push(resp, base + latency, true)
    }

    /// Sends a writeback, invalidation or acknowledgement.
    ///
    /// Messages carrying data pay the array access; the rest only the tag.
    pub fn send(&mut self, mut event: MemEvent) -> u64 {
        event.src = self.name.clone();
        let latency = if event.payload.is_some() {
            self.timing.access_latency
        } else {
            self.timing.tag_latency
        };
        let delivery = self.timestamp + latency;
        self.push(event, delivery, false)
    }

    /// Refuses `event`. The NACK carries the original request back to its sender.
    pub fn send_nack(&mut self, event: &MemEvent) -> u64 {
        let mut nack = event.make_response(Command::Nack, None);
        nack.src = self.name.clone();
        nack.nacked = Some(Box::new(event.clone()));
        let delivery = self.timestamp + self.timing.tag_latency;
        self.push(nack, delivery, true)
    }

    /// Resends a request that was NACKed, with exponential backoff.
    pub fn resend(&mut self, mut event: MemEvent) -> u64 {
        let backoff = 1u64 << event.retries.min(MAX_BACKOFF_SHIFT);
        event.retries += 1;
        let delivery = self.timestamp + self.timing.mshr_latency + backoff;
        self.push(event, delivery, false)
    }

    fn push(&mut self, event: MemEvent, delivery_time: u64, to_requestor: bool) -> u64 {
        log::trace!(
            "{}: queue {} {} -> {} line {} at {}",
            self.name,
            event.cmd,
            event.src,
            event.dst,
            event.base_addr,
            delivery_time
        );
        self.queue.enqueue(Outgoing {
            event,
            enqueue_time: self.timestamp,
            delivery_time,
            to_requestor,
        });
        delivery_time
    }
}
