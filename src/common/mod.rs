//! Common types used throughout the coherence engine.
//!
//! This module provides the line address type and the error types shared by
//! the controllers, the cache shell and the configuration loader.

/// Cache line address type.
pub mod addr;

/// Error types for protocol violations and configuration failures.
pub mod error;

pub use addr::LineAddr;
pub use error::{CoherenceError, CoherenceResult, ConfigError};
