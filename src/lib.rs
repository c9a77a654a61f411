//! Cache Coherence Protocol Engine.
//!
//! This crate implements the per-line coherence logic of a simulated cache in a
//! memory hierarchy. A cache is split into two protocol engines that share one
//! line record per cached address:
//!
//! * **Top controller**: faces the requestors above. Tracks which upstream caches
//!   share or own a line and issues invalidations/downgrades before a request
//!   may be granted.
//! * **Bottom controller**: faces the backing store below. Decides whether the
//!   local copy satisfies a request or must be fetched/upgraded, and writes data
//!   back on eviction and invalidation.
//!
//! MSI, MESI and MOESI are selected per deployment through a protocol policy
//! value rather than separate controller types. The same value also selects an
//! incoherent mode that tracks nothing above the cache.
//!
//! # Modules
//!
//! * `common`: Address type and error definitions.
//! * `coherence`: Line record, sharer set, message queue and the two controllers.
//! * `cache`: Cache shell owning the line arena and MSHR, dispatching events.
//! * `config`: Configuration loading and parsing.
//! * `stats`: Coherence statistics and access listeners.

/// Shared types: line addresses and error handling.
pub mod common;

/// The coherence protocol engine.
///
/// Holds the per-line state machines, the timestamp-ordered outgoing message
/// queue and the Top/Bottom controllers that drive them.
pub mod coherence;

/// Cache shell around the coherence engine.
///
/// Owns the line arena, the MSHR and the replay loop that re-drives
/// requests once a line leaves its transitional state.
pub mod cache;

/// Configuration system for the cache geometry, protocol and timing.
///
/// Loads and parses TOML configuration files.
pub mod config;

/// Coherence statistics collection and reporting.
pub mod stats;
