//! Snapshot tables: the relational half of the state store. Accessed only
//! by the scheduler loop; on restart these tables are authoritative and
//! the event log replays only records newer than the highest snapshotted
//! sequence number.

use super::connection::DatabasePool;
use super::error::DbResult;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// A row of `task_pool`: the live set of proxies and their hold flag.
#[derive(Debug, Clone, FromRow)]
pub struct TaskPoolRow {
    pub cycle: String,
    pub name: String,
    pub flow_nums: String,
    pub status: String,
    pub is_held: bool,
}

/// A row of `task_states`: the authoritative status for one proxy.
#[derive(Debug, Clone, FromRow)]
pub struct TaskStateRow {
    pub name: String,
    pub cycle: String,
    pub flow_nums: String,
    pub submit_num: i64,
    pub status: String,
    pub time_updated: DateTime<Utc>,
}

/// A row of `task_jobs`: one submission attempt of one proxy.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub cycle: String,
    pub name: String,
    pub submit_num: i64,
    pub try_num: i64,
    pub platform: String,
    pub job_runner: String,
    pub job_id: Option<String>,
    pub submit_status: Option<i64>,
    pub run_status: Option<i64>,
    pub time_submit: Option<DateTime<Utc>>,
    pub time_run: Option<DateTime<Utc>>,
    pub time_run_exit: Option<DateTime<Utc>>,
}

/// A row of `task_outputs`: the completed outputs of one proxy, as a
/// JSON array of output names.
#[derive(Debug, Clone, FromRow)]
pub struct TaskOutputsRow {
    pub cycle: String,
    pub name: String,
    pub flow_nums: String,
    pub outputs: String,
}

/// A row of `task_prerequisites`: one prerequisite atom of one proxy and
/// whether it is satisfied.
#[derive(Debug, Clone, FromRow)]
pub struct TaskPrereqRow {
    pub cycle: String,
    pub name: String,
    pub flow_nums: String,
    pub prereq_name: String,
    pub prereq_cycle: String,
    pub prereq_output: String,
    pub satisfied: bool,
}

/// A row of `broadcast_states`: the current value of one broadcast
/// setting. `point` is the literal `*` for the wildcard selector.
#[derive(Debug, Clone, FromRow)]
pub struct BroadcastStateRow {
    pub point: String,
    pub namespace: String,
    pub key: String,
    pub value: String,
}

/// A row of `tasks_to_hold`: a task whose future spawns come up held;
/// `cycle` is the literal `*` when the hold covers every cycle.
#[derive(Debug, Clone, FromRow)]
pub struct HoldRow {
    pub name: String,
    pub cycle: String,
}

/// A row of `xtriggers`: an external trigger already received, with the
/// result id the sender supplied.
#[derive(Debug, Clone, FromRow)]
pub struct XtriggerRow {
    pub signature: String,
    pub results: String,
}

/// A row of `workflow_flows`: one flow label and when it started.
#[derive(Debug, Clone, FromRow)]
pub struct FlowRow {
    pub flow_num: i64,
    pub start_time: DateTime<Utc>,
    pub description: String,
}

/// Repository over the relational snapshot tables. Writes are expected to
/// be batched at the end of a scheduler iteration.
pub struct SnapshotStore;

impl SnapshotStore {
    pub async fn upsert_pool_row(pool: &DatabasePool, row: &TaskPoolRow) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO task_pool (cycle, name, flow_nums, status, is_held)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(cycle, name, flow_nums) DO UPDATE SET
               status = excluded.status, is_held = excluded.is_held",
        )
        .bind(&row.cycle)
        .bind(&row.name)
        .bind(&row.flow_nums)
        .bind(&row.status)
        .bind(row.is_held)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn delete_pool_row(pool: &DatabasePool, cycle: &str, name: &str, flow_nums: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM task_pool WHERE cycle = ? AND name = ? AND flow_nums = ?")
            .bind(cycle)
            .bind(name)
            .bind(flow_nums)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn list_pool_rows(pool: &DatabasePool) -> DbResult<Vec<TaskPoolRow>> {
        let rows = sqlx::query_as::<_, TaskPoolRow>("SELECT * FROM task_pool ORDER BY cycle, name")
            .fetch_all(pool)
            .await?;
        Ok(rows)
    }

    pub async fn upsert_state_row(pool: &DatabasePool, row: &TaskStateRow) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO task_states (name, cycle, flow_nums, submit_num, status, time_updated)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(name, cycle, flow_nums) DO UPDATE SET
               submit_num = excluded.submit_num, status = excluded.status,
               time_updated = excluded.time_updated",
        )
        .bind(&row.name)
        .bind(&row.cycle)
        .bind(&row.flow_nums)
        .bind(row.submit_num)
        .bind(&row.status)
        .bind(row.time_updated)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn insert_job_row(pool: &DatabasePool, row: &JobRow) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO task_jobs
               (cycle, name, submit_num, try_num, platform, job_runner, job_id,
                submit_status, run_status, time_submit, time_run, time_run_exit)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(cycle, name, submit_num) DO UPDATE SET
               try_num = excluded.try_num, job_id = excluded.job_id,
               submit_status = excluded.submit_status, run_status = excluded.run_status,
               time_submit = excluded.time_submit, time_run = excluded.time_run,
               time_run_exit = excluded.time_run_exit",
        )
        .bind(&row.cycle)
        .bind(&row.name)
        .bind(row.submit_num)
        .bind(row.try_num)
        .bind(&row.platform)
        .bind(&row.job_runner)
        .bind(&row.job_id)
        .bind(row.submit_status)
        .bind(row.run_status)
        .bind(row.time_submit)
        .bind(row.time_run)
        .bind(row.time_run_exit)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Record a job's final run status and exit time on its existing
    /// submission row.
    pub async fn record_job_exit(
        pool: &DatabasePool,
        cycle: &str,
        name: &str,
        submit_num: i64,
        run_status: Option<i64>,
    ) -> DbResult<()> {
        sqlx::query(
            "UPDATE task_jobs SET run_status = ?, time_run_exit = ?
             WHERE cycle = ? AND name = ? AND submit_num = ?",
        )
        .bind(run_status)
        .bind(Utc::now())
        .bind(cycle)
        .bind(name)
        .bind(submit_num)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn list_jobs_for(pool: &DatabasePool, cycle: &str, name: &str) -> DbResult<Vec<JobRow>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM task_jobs WHERE cycle = ? AND name = ? ORDER BY submit_num",
        )
        .bind(cycle)
        .bind(name)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    pub async fn upsert_outputs_row(pool: &DatabasePool, row: &TaskOutputsRow) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO task_outputs (cycle, name, flow_nums, outputs)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(cycle, name, flow_nums) DO UPDATE SET outputs = excluded.outputs",
        )
        .bind(&row.cycle)
        .bind(&row.name)
        .bind(&row.flow_nums)
        .bind(&row.outputs)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn delete_outputs_row(pool: &DatabasePool, cycle: &str, name: &str, flow_nums: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM task_outputs WHERE cycle = ? AND name = ? AND flow_nums = ?")
            .bind(cycle)
            .bind(name)
            .bind(flow_nums)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn list_output_rows(pool: &DatabasePool) -> DbResult<Vec<TaskOutputsRow>> {
        let rows = sqlx::query_as::<_, TaskOutputsRow>("SELECT * FROM task_outputs")
            .fetch_all(pool)
            .await?;
        Ok(rows)
    }

    /// Replace every prerequisite row of one proxy in a single
    /// transaction.
    pub async fn replace_prereq_rows(
        pool: &DatabasePool,
        cycle: &str,
        name: &str,
        flow_nums: &str,
        rows: &[TaskPrereqRow],
    ) -> DbResult<()> {
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM task_prerequisites WHERE cycle = ? AND name = ? AND flow_nums = ?")
            .bind(cycle)
            .bind(name)
            .bind(flow_nums)
            .execute(&mut *tx)
            .await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO task_prerequisites
                   (cycle, name, flow_nums, prereq_name, prereq_cycle, prereq_output, satisfied)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&row.cycle)
            .bind(&row.name)
            .bind(&row.flow_nums)
            .bind(&row.prereq_name)
            .bind(&row.prereq_cycle)
            .bind(&row.prereq_output)
            .bind(row.satisfied)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_prereq_rows(pool: &DatabasePool, cycle: &str, name: &str, flow_nums: &str) -> DbResult<()> {
        sqlx::query("DELETE FROM task_prerequisites WHERE cycle = ? AND name = ? AND flow_nums = ?")
            .bind(cycle)
            .bind(name)
            .bind(flow_nums)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn list_prereq_rows(pool: &DatabasePool) -> DbResult<Vec<TaskPrereqRow>> {
        let rows = sqlx::query_as::<_, TaskPrereqRow>("SELECT * FROM task_prerequisites")
            .fetch_all(pool)
            .await?;
        Ok(rows)
    }

    pub async fn upsert_broadcast_state(pool: &DatabasePool, row: &BroadcastStateRow) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO broadcast_states (point, namespace, key, value)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(point, namespace, key) DO UPDATE SET value = excluded.value",
        )
        .bind(&row.point)
        .bind(&row.namespace)
        .bind(&row.key)
        .bind(&row.value)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn delete_broadcast_state(
        pool: &DatabasePool,
        point: &str,
        namespace: &str,
        key: &str,
    ) -> DbResult<()> {
        sqlx::query("DELETE FROM broadcast_states WHERE point = ? AND namespace = ? AND key = ?")
            .bind(point)
            .bind(namespace)
            .bind(key)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Remove every broadcast setting matching the given selectors;
    /// either may be `None` to match anything.
    pub async fn clear_broadcast_states(
        pool: &DatabasePool,
        point: Option<&str>,
        namespace: Option<&str>,
    ) -> DbResult<()> {
        sqlx::query(
            "DELETE FROM broadcast_states
             WHERE (? IS NULL OR point = ?) AND (? IS NULL OR namespace = ?)",
        )
        .bind(point)
        .bind(point)
        .bind(namespace)
        .bind(namespace)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn list_broadcast_states(pool: &DatabasePool) -> DbResult<Vec<BroadcastStateRow>> {
        let rows = sqlx::query_as::<_, BroadcastStateRow>("SELECT * FROM broadcast_states")
            .fetch_all(pool)
            .await?;
        Ok(rows)
    }

    /// Append one row to the broadcast change history.
    pub async fn record_broadcast_event(
        pool: &DatabasePool,
        change: &str,
        point: Option<&str>,
        namespace: Option<&str>,
        key: Option<&str>,
        value: Option<&str>,
    ) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO broadcast_events (time, change, point, namespace, key, value)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Utc::now())
        .bind(change)
        .bind(point)
        .bind(namespace)
        .bind(key)
        .bind(value)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Replace the full set of hold-on-spawn marks.
    pub async fn replace_hold_rows(pool: &DatabasePool, rows: &[HoldRow]) -> DbResult<()> {
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM tasks_to_hold").execute(&mut *tx).await?;
        for row in rows {
            sqlx::query("INSERT OR IGNORE INTO tasks_to_hold (name, cycle) VALUES (?, ?)")
                .bind(&row.name)
                .bind(&row.cycle)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_hold_rows(pool: &DatabasePool) -> DbResult<Vec<HoldRow>> {
        let rows = sqlx::query_as::<_, HoldRow>("SELECT * FROM tasks_to_hold")
            .fetch_all(pool)
            .await?;
        Ok(rows)
    }

    pub async fn upsert_xtrigger(pool: &DatabasePool, signature: &str, results: &str) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO xtriggers (signature, results) VALUES (?, ?)
             ON CONFLICT(signature) DO UPDATE SET results = excluded.results",
        )
        .bind(signature)
        .bind(results)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn list_xtriggers(pool: &DatabasePool) -> DbResult<Vec<XtriggerRow>> {
        let rows = sqlx::query_as::<_, XtriggerRow>("SELECT * FROM xtriggers")
            .fetch_all(pool)
            .await?;
        Ok(rows)
    }

    pub async fn upsert_flow_row(pool: &DatabasePool, row: &FlowRow) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO workflow_flows (flow_num, start_time, description) VALUES (?, ?, ?)
             ON CONFLICT(flow_num) DO NOTHING",
        )
        .bind(row.flow_num)
        .bind(row.start_time)
        .bind(&row.description)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn list_flow_rows(pool: &DatabasePool) -> DbResult<Vec<FlowRow>> {
        let rows = sqlx::query_as::<_, FlowRow>("SELECT * FROM workflow_flows ORDER BY flow_num")
            .fetch_all(pool)
            .await?;
        Ok(rows)
    }

    pub async fn set_workflow_param(pool: &DatabasePool, key: &str, value: &str) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO workflow_params (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn get_workflow_param(pool: &DatabasePool, key: &str) -> DbResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM workflow_params WHERE key = ?")
                .bind(key)
                .fetch_optional(pool)
                .await?;
        Ok(row.map(|(v,)| v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::DatabaseConnection;

    async fn memory_pool() -> DatabasePool {
        let conn = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        for ddl in [
            "CREATE TABLE task_pool (cycle TEXT, name TEXT, flow_nums TEXT, status TEXT, is_held INTEGER,
             PRIMARY KEY (cycle, name, flow_nums))",
            "CREATE TABLE workflow_params (key TEXT PRIMARY KEY, value TEXT)",
            "CREATE TABLE task_outputs (cycle TEXT, name TEXT, flow_nums TEXT, outputs TEXT,
             PRIMARY KEY (cycle, name, flow_nums))",
            "CREATE TABLE task_prerequisites (cycle TEXT, name TEXT, flow_nums TEXT,
             prereq_name TEXT, prereq_cycle TEXT, prereq_output TEXT, satisfied INTEGER,
             PRIMARY KEY (cycle, name, flow_nums, prereq_name, prereq_cycle, prereq_output))",
            "CREATE TABLE broadcast_states (point TEXT NOT NULL, namespace TEXT, key TEXT, value TEXT,
             PRIMARY KEY (point, namespace, key))",
            "CREATE TABLE broadcast_events (time TIMESTAMP, change TEXT, point TEXT, namespace TEXT, key TEXT, value TEXT)",
        ] {
            sqlx::query(ddl).execute(conn.pool()).await.unwrap();
        }
        conn.pool().clone()
    }

    #[tokio::test]
    async fn upsert_then_list_pool_rows() {
        let pool = memory_pool().await;
        SnapshotStore::upsert_pool_row(
            &pool,
            &TaskPoolRow {
                cycle: "1".into(),
                name: "foo".into(),
                flow_nums: "{1}".into(),
                status: "waiting".into(),
                is_held: false,
            },
        )
        .await
        .unwrap();
        let rows = SnapshotStore::list_pool_rows(&pool).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "waiting");
    }

    #[tokio::test]
    async fn workflow_param_round_trips() {
        let pool = memory_pool().await;
        SnapshotStore::set_workflow_param(&pool, "cycle_point_tz", "UTC").await.unwrap();
        let v = SnapshotStore::get_workflow_param(&pool, "cycle_point_tz").await.unwrap();
        assert_eq!(v.as_deref(), Some("UTC"));
    }

    #[tokio::test]
    async fn outputs_and_prereq_rows_round_trip() {
        let pool = memory_pool().await;
        SnapshotStore::upsert_outputs_row(
            &pool,
            &TaskOutputsRow {
                cycle: "1".into(),
                name: "foo".into(),
                flow_nums: "{1}".into(),
                outputs: "[\"succeeded\"]".into(),
            },
        )
        .await
        .unwrap();
        let outputs = SnapshotStore::list_output_rows(&pool).await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(outputs[0].outputs.contains("succeeded"));

        let rows = vec![TaskPrereqRow {
            cycle: "1".into(),
            name: "bar".into(),
            flow_nums: "{1}".into(),
            prereq_name: "foo".into(),
            prereq_cycle: "1".into(),
            prereq_output: "succeeded".into(),
            satisfied: true,
        }];
        SnapshotStore::replace_prereq_rows(&pool, "1", "bar", "{1}", &rows).await.unwrap();
        let listed = SnapshotStore::list_prereq_rows(&pool).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].satisfied);

        SnapshotStore::delete_prereq_rows(&pool, "1", "bar", "{1}").await.unwrap();
        assert!(SnapshotStore::list_prereq_rows(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn broadcast_state_set_cancel_clear_round_trips() {
        let pool = memory_pool().await;
        let row = BroadcastStateRow {
            point: "*".into(),
            namespace: "root".into(),
            key: "FOO".into(),
            value: "BAR".into(),
        };
        SnapshotStore::upsert_broadcast_state(&pool, &row).await.unwrap();
        // A second set of the same target overwrites, not duplicates.
        SnapshotStore::upsert_broadcast_state(
            &pool,
            &BroadcastStateRow { value: "BAZ".into(), ..row.clone() },
        )
        .await
        .unwrap();
        let listed = SnapshotStore::list_broadcast_states(&pool).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].value, "BAZ");

        SnapshotStore::delete_broadcast_state(&pool, "*", "root", "FOO").await.unwrap();
        assert!(SnapshotStore::list_broadcast_states(&pool).await.unwrap().is_empty());

        SnapshotStore::upsert_broadcast_state(&pool, &row).await.unwrap();
        SnapshotStore::clear_broadcast_states(&pool, None, Some("root")).await.unwrap();
        assert!(SnapshotStore::list_broadcast_states(&pool).await.unwrap().is_empty());
    }
}
