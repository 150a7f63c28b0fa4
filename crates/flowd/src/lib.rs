//! Cycling workflow scheduler core.
//!
//! Turns a finite graph definition that repeats across a cycle-point
//! sequence into a bounded, on-demand set of active task proxies, drives a
//! dependency-driven scheduling loop against them, and manages the
//! lifecycle of the jobs that loop submits.

pub mod broadcast;
pub mod commands;
pub mod config;
pub mod cycle;
pub mod db;
pub mod domain;
pub mod engine;
pub mod graph;
pub mod handlers;
pub mod ingress;
pub mod jobs;
pub mod net;
pub mod pool;
pub mod version;

use thiserror::Error;

/// Errors surfaced by the scheduler core.
#[derive(Debug, Error)]
pub enum FlowdError {
    /// Bad graph, unresolved reference, invalid cycle point.
    #[error("config error: {0}")]
    Config(String),

    /// No platform matches a task's selector at submit time.
    #[error("no platform matches selector: {0}")]
    PlatformLookup(String),

    /// Every host on a platform is marked bad.
    #[error("platform unreachable: {0}")]
    PlatformUnreachable(String),

    /// The job-runner driver reported a submission failure.
    #[error("job submit failed: {0}")]
    JobSubmit(String),

    /// The job-runner driver reported a non-zero exit, or a task emitted
    /// a `CRITICAL failed` message.
    #[error("job run failed: {0}")]
    JobRunFail(String),

    /// A message failed ingress authentication and was dropped.
    #[error("message rejected: {0}")]
    MessageAuth(String),

    /// A pool invariant was violated; the scheduler must abort.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    /// Cycle-point parsing or arithmetic failure.
    #[error(transparent)]
    Cycle(#[from] cycle::CycleError),

    /// Graph expansion failure.
    #[error(transparent)]
    Graph(#[from] graph::GraphError),

    /// Snapshot-store failure.
    #[error(transparent)]
    Store(#[from] db::DatabaseError),

    /// Serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic I/O failure (contact file, job-status file, run directory).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for scheduler-core operations.
pub type Result<T> = std::result::Result<T, FlowdError>;
