//! Durable state store: an append-only event log plus snapshot tables
//! held in SQLite, accessed only by the scheduler loop.

pub mod connection;
pub mod error;
pub mod event_log;
pub mod snapshot;

pub use connection::{DatabaseConnection, DatabasePool};
pub use error::{DatabaseError, DbResult};
pub use event_log::{EventLog, EventRecord, EventKind};
pub use snapshot::{
    BroadcastStateRow, FlowRow, HoldRow, JobRow, SnapshotStore, TaskOutputsRow, TaskPoolRow,
    TaskPrereqRow, TaskStateRow, XtriggerRow,
};
