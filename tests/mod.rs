//! Test module organization.
//!
//! This module organizes all integration tests for the coherence engine.







/// Top controller grant, fan-out and relinquish tests.
mod top_tests;
