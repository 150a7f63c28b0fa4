//! Retry policies and timeout wrappers for cooperative async work.
//!
//! Everything the scheduler fans out — job submission over a possibly
//! flaky host, polling, event handlers — goes through one of these: a
//! bounded [`retry::RetryPolicy`] for transient failures and a
//! [`timeout::with_timeout`] guard so no outbound subprocess can wedge
//! the worker pool.

pub mod retry;
pub mod timeout;
