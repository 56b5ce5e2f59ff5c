//! Deterministic, pure logic shared by the protocol.
//!
//! Core modules are free of I/O side effects. They operate on in-memory data and return
//! deterministic outputs suitable for tests.

pub mod command_line;
pub mod diff;
pub mod exclude;
pub mod source_check;
pub mod state;
pub mod types;
pub mod version;
