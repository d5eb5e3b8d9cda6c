//! Deterministic, pure types and rules shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod decision;
pub mod event;
pub mod history;
pub mod intent;
pub mod phase;
pub mod status;
