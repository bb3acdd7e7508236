//! Shared test utilities for fieldmill integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated runs with temp document and data directories
//! - `ScriptedProvider`, an inference provider answering from a script

pub mod harness;
pub mod provider;

pub use harness::TestHarness;
pub use provider::{Answer, ScriptedProvider};
