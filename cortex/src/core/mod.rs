//! Deterministic, pure logic shared by the runtime.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod classifier;
pub mod completion;
pub mod credentials;
pub mod failure_tracker;
pub mod json_walk;
pub mod resume;
pub mod tool_args;
pub mod types;
