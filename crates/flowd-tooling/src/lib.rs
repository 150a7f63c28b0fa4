//! Ambient tooling shared across the `flowd` workspace: retry and
//! timeout wrappers for the scheduler's I/O fan-out, error-chain
//! formatting, and logging setup for long-running server processes.

pub mod async_utils;
pub mod error;
pub mod logging;
