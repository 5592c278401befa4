//! Corral Daemon Library
//!
//! Core functionality for the Corral daemon:
//! - Execution registry tracking every supervised subprocess
//! - Concurrency ceiling, timeouts, and graceful termination
//! - Per-execution NDJSON event capture and change notification

pub mod subprocess;
