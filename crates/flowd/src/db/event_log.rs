//! Append-only event log: every state transition, recorded output,
//! broadcast change, and command is written here before it is considered
//! durable. Fsync boundary is after each batch of events that produced an
//! externally visible acknowledgement.

use super::connection::DatabasePool;
use super::error::DbResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The kind of event recorded; distinguishes payload shape without a
/// separate table per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    StateTransition,
    OutputCompleted,
    BroadcastChange,
    Command,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StateTransition => "state_transition",
            EventKind::OutputCompleted => "output_completed",
            EventKind::BroadcastChange => "broadcast_change",
            EventKind::Command => "command",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "state_transition" => EventKind::StateTransition,
            "output_completed" => EventKind::OutputCompleted,
            "broadcast_change" => EventKind::BroadcastChange,
            "command" => EventKind::Command,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct RawEventRow {
    sequence_no: i64,
    monotonic_clock: i64,
    kind: String,
    payload: String,
    recorded_at: DateTime<Utc>,
}

/// One durable record: `(sequence-no, monotonic-clock, kind, payload)`.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub sequence_no: i64,
    pub monotonic_clock: i64,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl TryFrom<RawEventRow> for EventRecord {
    type Error = super::error::DatabaseError;

    fn try_from(row: RawEventRow) -> Result<Self, Self::Error> {
        let kind = EventKind::from_str(&row.kind)
            .ok_or_else(|| super::error::DatabaseError::TypeError(format!("unknown event kind: {}", row.kind)))?;
        let payload = serde_json::from_str(&row.payload)
            .map_err(|e| super::error::DatabaseError::TypeError(e.to_string()))?;
        Ok(EventRecord {
            sequence_no: row.sequence_no,
            monotonic_clock: row.monotonic_clock,
            kind,
            payload,
            recorded_at: row.recorded_at,
        })
    }
}

/// Append-only log repository.
pub struct EventLog;

impl EventLog {
    /// Append one event, assigning it the next sequence number.
    pub async fn append(
        pool: &DatabasePool,
        monotonic_clock: i64,
        kind: EventKind,
        payload: &serde_json::Value,
    ) -> DbResult<i64> {
        let payload_str = serde_json::to_string(payload)
            .map_err(|e| super::error::DatabaseError::TypeError(e.to_string()))?;
        let result = sqlx::query(
            "INSERT INTO event_log (monotonic_clock, kind, payload, recorded_at) VALUES (?, ?, ?, ?)",
        )
        .bind(monotonic_clock)
        .bind(kind.as_str())
        .bind(payload_str)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Append a batch of events in a single transaction, returning their
    /// assigned sequence numbers in order.
    pub async fn append_batch(
        pool: &DatabasePool,
        events: &[(i64, EventKind, serde_json::Value)],
    ) -> DbResult<Vec<i64>> {
        let mut tx = pool.begin().await?;
        let mut ids = Vec::with_capacity(events.len());
        for (clock, kind, payload) in events {
            let payload_str = serde_json::to_string(payload)
                .map_err(|e| super::error::DatabaseError::TypeError(e.to_string()))?;
            let result = sqlx::query(
                "INSERT INTO event_log (monotonic_clock, kind, payload, recorded_at) VALUES (?, ?, ?, ?)",
            )
            .bind(clock)
            .bind(kind.as_str())
            .bind(payload_str)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
            ids.push(result.last_insert_rowid());
        }
        tx.commit().await?;
        Ok(ids)
    }

    /// Replay every record with sequence number strictly greater than
    /// `after_sequence_no`: the event log replays only records newer than
    /// the snapshot's highest sequence-no.
    pub async fn replay_since(pool: &DatabasePool, after_sequence_no: i64) -> DbResult<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, RawEventRow>(
            "SELECT sequence_no, monotonic_clock, kind, payload, recorded_at
             FROM event_log WHERE sequence_no > ? ORDER BY sequence_no",
        )
        .bind(after_sequence_no)
        .fetch_all(pool)
        .await?;
        rows.into_iter().map(EventRecord::try_from).collect()
    }

    pub async fn highest_sequence_no(pool: &DatabasePool) -> DbResult<i64> {
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(sequence_no) FROM event_log")
            .fetch_one(pool)
            .await?;
        Ok(row.0.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::DatabaseConnection;
    use serde_json::json;

    async fn memory_pool() -> DatabasePool {
        let conn = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE event_log (
               sequence_no INTEGER PRIMARY KEY AUTOINCREMENT,
               monotonic_clock INTEGER NOT NULL,
               kind TEXT NOT NULL,
               payload TEXT NOT NULL,
               recorded_at TIMESTAMP NOT NULL)",
        )
        .execute(conn.pool())
        .await
        .unwrap();
        conn.pool().clone()
    }

    #[tokio::test]
    async fn append_then_replay_returns_newer_records_only() {
        let pool = memory_pool().await;
        let first = EventLog::append(&pool, 1, EventKind::Command, &json!({"cmd": "play"})).await.unwrap();
        EventLog::append(&pool, 2, EventKind::StateTransition, &json!({"to": "running"})).await.unwrap();

        let replayed = EventLog::replay_since(&pool, first).await.unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].kind, EventKind::StateTransition);
    }

    #[tokio::test]
    async fn batch_append_assigns_sequential_ids() {
        let pool = memory_pool().await;
        let ids = EventLog::append_batch(
            &pool,
            &[
                (1, EventKind::Command, json!({"cmd": "hold"})),
                (2, EventKind::Command, json!({"cmd": "release"})),
            ],
        )
        .await
        .unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids[1] > ids[0]);
        let highest = EventLog::highest_sequence_no(&pool).await.unwrap();
        assert_eq!(highest, ids[1]);
    }
}
