//! Scheduler server binary: loads a workflow configuration, opens the
//! durable store, restores any previous run, and drives the scheduler
//! loop to completion or shutdown.

use anyhow::Context;
use clap::Parser;
use flowd::commands::{Command, CommandEnvelope};
use flowd::config::{load_yaml_config, WorkflowConfig};
use flowd::db::{
    BroadcastStateRow, DatabaseConnection, DatabasePool, EventKind, EventLog, FlowRow, HoldRow,
    JobRow, SnapshotStore, TaskOutputsRow, TaskPoolRow, TaskPrereqRow, TaskStateRow,
};
use flowd::domain::{Output, PredefinedOutput, TaskCycleKey, TaskState};
use flowd::engine::{queue::partition_by_queue_cap, QueueTracker, Scheduler, ShutdownReason};
use flowd::handlers::{HandlerArgs, HandlerClass, HandlerDispatcher};
use flowd::ingress::{SequenceAssigner, Severity, TaskMessage};
use flowd::jobs::{
    balanced_chunks, time_limit_poll_at, JobManager, JobPollState, JobSpec, Platform,
    ReportedStatus, MAX_BATCH_SIZE,
};
use flowd::net::{ContactFile, InboundRequest, Request, Response, SharedSecret, TcpServer};
use flowd_tooling::error::format_error_chain;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "flowd-server", about = "Cycling workflow scheduler")]
struct Args {
    /// Path to the workflow's YAML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Workflow run directory (log/, job/, share/, work/, .service/ live
    /// under it).
    #[arg(long, default_value = ".")]
    run_dir: PathBuf,

    /// SQLite connection string; defaults to `log/db` under the run
    /// directory.
    #[arg(long)]
    database_url: Option<String>,

    /// Scheduler loop tick interval in milliseconds.
    #[arg(long, default_value_t = 500)]
    tick_ms: u64,
}

/// Per-job bookkeeping the server keeps alongside the pool: the id a
/// driver assigned on submission (needed to poll or kill it later) and
/// the wall-clock deadline derived from the task's execution time limit.
/// The pool itself stays ignorant of job-runner identifiers.
#[derive(Default)]
struct JobTable {
    ids: HashMap<TaskCycleKey, String>,
    deadlines: HashMap<TaskCycleKey, Instant>,
}

/// Everything the tick loop operates on, owned by the main task.
struct Server {
    scheduler: Scheduler,
    job_manager: JobManager,
    platforms: Vec<Platform>,
    handlers: HandlerDispatcher,
    job_table: JobTable,
    db: DatabasePool,
    workflow_name: String,
    run_dir: PathBuf,
    config_path: PathBuf,
    stall_handlers: Vec<String>,
    abort_on_stall: bool,
    stall_handlers_fired: bool,
    tick: Duration,
    idempotency_seq: u64,
    sequence: SequenceAssigner,
    /// Live subscriptions: the topic each client asked for and the
    /// connection channel its stream frames go out on.
    subscribers: Vec<(String, mpsc::Sender<Response>)>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    create_run_dir_layout(&args.run_dir).await?;
    let _log_guard =
        flowd_tooling::logging::init_rolling(&args.run_dir.join("log").join("scheduler"), "log", "info");

    info!(config = %args.config.display(), "loading workflow configuration");
    let config: WorkflowConfig = load_yaml_config(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let built = config.build().context("invalid workflow configuration")?;

    let database_url = args.database_url.clone().unwrap_or_else(|| {
        format!("sqlite://{}?mode=rwc", args.run_dir.join("log").join("db").display())
    });
    info!(url = %database_url, "connecting to durable store");
    let db_conn = DatabaseConnection::new(&database_url).await?;
    db_conn.run_migrations().await?;
    db_conn.health_check().await?;
    let db = db_conn.pool().clone();

    let mut scheduler =
        Scheduler::with_names(built.graph, built.names, built.runahead_limit, built.stall_timeout);
    scheduler.stop_after = built.stop_after;
    scheduler.queues = QueueTracker::new(built.queues);
    scheduler.set_definitions(built.task_definitions);
    scheduler.seed().map_err(|e| anyhow::anyhow!(e.to_string()))?;

    restore_previous_run(&mut scheduler, &db).await?;

    let mut server = Server {
        scheduler,
        job_manager: JobManager::new(built.bad_host_retention),
        platforms: built.platforms,
        handlers: HandlerDispatcher::new(built.process_pool_size, built.process_pool_timeout),
        job_table: JobTable::default(),
        db,
        workflow_name: config.name.clone(),
        run_dir: args.run_dir.clone(),
        config_path: args.config.clone(),
        stall_handlers: built.stall_handlers,
        abort_on_stall: built.abort_on_stall,
        stall_handlers_fired: false,
        tick: Duration::from_millis(args.tick_ms),
        idempotency_seq: 0,
        sequence: SequenceAssigner::new(),
        subscribers: Vec::new(),
    };

    let (tx, mut rx) = mpsc::channel::<InboundRequest>(256);
    let tcp =
        TcpServer::bind(&built.server.bind_addr, SharedSecret::new(built.server.shared_secret), tx)
            .await?;
    let local_addr = tcp.local_addr()?;
    info!(addr = %local_addr, "listening");
    tokio::spawn(tcp.serve());

    let contact = ContactFile::new(
        local_addr.ip().to_string(),
        local_addr.port(),
        std::env::current_dir().unwrap_or_default(),
    );
    contact.write(&args.run_dir).await?;
    record_startup_params(&server.db, &contact).await;

    let mut ticker = tokio::time::interval(server.tick);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_signal() => {
                server.scheduler.request_shutdown(ShutdownReason::Graceful);
            }
        }
        if !server.run_one_tick(&mut rx).await {
            break;
        }
    }

    ContactFile::remove(&args.run_dir).await?;
    info!("flowd-server shut down");
    Ok(())
}

async fn create_run_dir_layout(run_dir: &Path) -> std::io::Result<()> {
    for sub in ["log/scheduler", "job", "share", "work", ".service"] {
        tokio::fs::create_dir_all(run_dir.join(sub)).await?;
    }
    Ok(())
}

/// The snapshot tables are authoritative after a restart; the event log
/// replays only records newer than the snapshot's flush point.
async fn restore_previous_run(scheduler: &mut Scheduler, db: &DatabasePool) -> anyhow::Result<()> {
    let pool_rows = SnapshotStore::list_pool_rows(db).await?;
    let output_rows = SnapshotStore::list_output_rows(db).await?;
    let prereq_rows = SnapshotStore::list_prereq_rows(db).await?;
    let restored = scheduler.restore_from_snapshot(&pool_rows, &output_rows, &prereq_rows);

    scheduler.restore_holds(&SnapshotStore::list_hold_rows(db).await?);
    scheduler.restore_broadcasts(&SnapshotStore::list_broadcast_states(db).await?);
    scheduler.restore_xtriggers(&SnapshotStore::list_xtriggers(db).await?);
    scheduler.restore_flows(&SnapshotStore::list_flow_rows(db).await?);

    let snapshot_seq = SnapshotStore::get_workflow_param(db, "snapshot_seq")
        .await?
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let replayed = EventLog::replay_since(db, snapshot_seq).await?;
    let replay_count = replayed.len();
    for record in &replayed {
        if let Err(e) = scheduler.apply_replay(record) {
            warn!(seq = record.sequence_no, error = %e, "event replay skipped");
        }
    }
    if restored > 0 || replay_count > 0 {
        info!(restored, replayed = replay_count, "previous run restored");
    }
    Ok(())
}

async fn record_startup_params(db: &DatabasePool, contact: &ContactFile) {
    let n_restart = SnapshotStore::get_workflow_param(db, "n_restart")
        .await
        .ok()
        .flatten()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);
    for (key, value) in [
        ("uuid", contact.uuid.to_string()),
        ("n_restart", (n_restart + 1).to_string()),
        ("cycle_point_tz", "UTC".to_string()),
    ] {
        if let Err(e) = SnapshotStore::set_workflow_param(db, key, &value).await {
            warn!(key, error = %e, "failed to record workflow parameter");
        }
    }
}

impl Server {
    /// One full pass of the loop's outer half. Returns false once the
    /// scheduler should exit.
    async fn run_one_tick(&mut self, rx: &mut mpsc::Receiver<InboundRequest>) -> bool {
        let (commands, messages, pending_replies) = self.drain_inbound(rx);

        let severity_events: Vec<(String, String, &'static str)> = messages
            .iter()
            .filter_map(|m| match m.severity {
                Severity::Warning => Some((m.name.clone(), m.cycle.clone(), "warning")),
                Severity::Critical => Some((m.name.clone(), m.cycle.clone(), "critical")),
                Severity::Info => None,
            })
            .collect();

        let report = match self.scheduler.iterate(commands, messages) {
            Ok(report) => report,
            Err(e) => {
                error!(error = %format_error_chain(&e), "iteration failed");
                return true;
            }
        };
        if !report.spawned.is_empty() {
            info!(spawned = report.spawned.len(), "spawned new proxies");
        }

        for (name, cycle, event) in severity_events {
            self.fire_severity_handlers(&name, &cycle, event).await;
        }
        if report.reload_requested {
            self.reload_config();
        }
        self.kill_jobs(&report.kill_requested).await;
        self.submit_ready_jobs().await;
        self.poll_active_jobs().await;
        self.enforce_time_limits().await;
        self.retry_failed_jobs().await;
        self.handle_stall(report.stalled).await;
        for (flow_num, description) in &report.new_flows {
            let row = FlowRow {
                flow_num: *flow_num as i64,
                start_time: chrono::Utc::now(),
                description: description.clone(),
            };
            if let Err(e) = SnapshotStore::upsert_flow_row(&self.db, &row).await {
                warn!(error = %e, "failed to persist flow registration");
            }
        }
        self.append_events(report.events).await;
        self.flush_snapshot().await;
        let state = self.workflow_state();
        self.publish("workflow", &state);

        // Replies only go out after the flush above made their effects
        // durable.
        for (key, reply) in pending_replies {
            let _ = reply
                .send(Response::MutateResult {
                    ack: true,
                    diff: serde_json::json!({ "idempotency_key": key }),
                })
                .await;
        }

        if let Some(reason) = self.scheduler.shutdown_reason() {
            let jobs_in_flight = self.scheduler.pool.iter().any(|(_, p)| p.state.is_active());
            if reason != ShutdownReason::Graceful || !jobs_in_flight {
                info!(?reason, "scheduler stopping");
                return false;
            }
        }
        true
    }

    /// Drain every request queued since the last tick, answering queries
    /// immediately and staging mutations — commands and pushed task
    /// messages — for the scheduler's priority-ordered drain.
    fn drain_inbound(
        &mut self,
        rx: &mut mpsc::Receiver<InboundRequest>,
    ) -> (Vec<CommandEnvelope>, Vec<TaskMessage>, Vec<(String, mpsc::Sender<Response>)>) {
        let mut commands = Vec::new();
        let mut messages: Vec<TaskMessage> = Vec::new();
        let mut pending_replies = Vec::new();

        while let Ok(inbound) = rx.try_recv() {
            match inbound.request {
                Request::Query { name, .. } => {
                    let value = match name.as_str() {
                        "show" => Some(self.pool_summary()),
                        "workflow-state" => Some(self.workflow_state()),
                        _ => None,
                    };
                    let reply = inbound.reply;
                    tokio::spawn(async move {
                        let response = match value {
                            Some(value) => Response::QueryResult { value },
                            None => Response::Error { message: format!("unknown query {name:?}") },
                        };
                        let _ = reply.send(response).await;
                    });
                }
                Request::Mutate { name, args } if name == "message" => {
                    match serde_json::from_value::<TaskMessage>(args) {
                        Ok(mut message) => {
                            message.sequence_no = self.sequence.next();
                            messages.push(message);
                            self.idempotency_seq += 1;
                            pending_replies
                                .push((format!("net-{}", self.idempotency_seq), inbound.reply));
                        }
                        Err(e) => {
                            let reply = inbound.reply;
                            tokio::spawn(async move {
                                let _ =
                                    reply.send(Response::Error { message: e.to_string() }).await;
                            });
                        }
                    }
                }
                Request::Mutate { args, .. } => match serde_json::from_value::<Command>(args) {
                    Ok(command) => {
                        self.idempotency_seq += 1;
                        let key = format!("net-{}", self.idempotency_seq);
                        pending_replies.push((key.clone(), inbound.reply));
                        commands.push(CommandEnvelope { idempotency_key: key, command });
                    }
                    Err(e) => {
                        let reply = inbound.reply;
                        tokio::spawn(async move {
                            let _ = reply.send(Response::Error { message: e.to_string() }).await;
                        });
                    }
                },
                Request::Subscribe { topic } => {
                    let ack = Response::SubscribeEvent {
                        topic: topic.clone(),
                        value: serde_json::json!({ "subscribed": true }),
                    };
                    let reply = inbound.reply.clone();
                    self.subscribers.push((topic, inbound.reply));
                    tokio::spawn(async move {
                        let _ = reply.send(ack).await;
                    });
                }
            }
        }
        // Arrival order within the drain is already FIFO per source;
        // sequence numbers keep ties stable across senders.
        messages.sort_by_key(|m| m.sequence_no);
        (commands, messages, pending_replies)
    }

    fn pool_summary(&self) -> serde_json::Value {
        let proxies: Vec<_> = self
            .scheduler
            .pool
            .iter()
            .map(|(key, proxy)| {
                serde_json::json!({
                    "task": self.scheduler.names.get(key.task),
                    "cycle": self.scheduler.arena.get(key.cycle).map(|p| p.to_string()),
                    "state": proxy.state.as_str(),
                    "flows": proxy.flows.to_string(),
                    "held": proxy.held,
                })
            })
            .collect();
        serde_json::json!({ "workflow": self.workflow_name, "proxies": proxies })
    }

    fn workflow_state(&self) -> serde_json::Value {
        serde_json::json!({
            "workflow": self.workflow_name,
            "paused": self.scheduler.is_paused(),
            "stopping": self.scheduler.shutdown_reason().is_some(),
            "active": self.scheduler.pool.len(),
        })
    }

    /// Re-read the configuration file and swap in the new graph, task
    /// definitions, queues, and platforms. Interned task ids stay stable
    /// across the swap; live proxies are untouched, per reload-reconcile
    /// semantics. A bad file demotes the reload to a warning.
    fn reload_config(&mut self) {
        info!(config = %self.config_path.display(), "reloading workflow configuration");
        let config: WorkflowConfig = match load_yaml_config(&self.config_path) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "reload rejected: configuration failed to load");
                return;
            }
        };
        let names = std::mem::take(&mut self.scheduler.names);
        let built = match config.build_into(names) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "reload rejected: configuration failed to build");
                // The arena was consumed; rebuild it from the pool's task
                // definitions to keep name lookups alive.
                let mut names = flowd::graph::NameArena::new();
                for def in self.scheduler.defs.values() {
                    names.intern(&def.name);
                }
                self.scheduler.names = names;
                return;
            }
        };
        self.scheduler.names = built.names;
        self.scheduler.graph = built.graph;
        self.scheduler.queues = QueueTracker::new(built.queues);
        self.scheduler.runahead_limit = built.runahead_limit;
        self.scheduler.stall_timeout = built.stall_timeout;
        self.scheduler.stop_after = built.stop_after;
        self.scheduler.set_definitions(built.task_definitions);
        self.platforms = built.platforms;
        self.stall_handlers = built.stall_handlers;
        self.abort_on_stall = built.abort_on_stall;
        self.workflow_name = config.name;
        if let Err(e) = self.scheduler.seed() {
            warn!(error = %e, "reseeding after reload failed");
        }
        info!("reload complete");
    }

    fn platform_for(&self, key: TaskCycleKey) -> Option<&Platform> {
        let def = self.scheduler.defs.get(&key.task)?;
        def.platform
            .candidates()
            .iter()
            .find_map(|name| self.platforms.iter().find(|p| &p.name == name))
    }

    fn job_dir(&self, cycle: &str, name: &str, submit_num: u32) -> PathBuf {
        self.run_dir.join("job").join(cycle).join(name).join(format!("{:02}", submit_num + 1))
    }

    fn job_environment(&self, key: TaskCycleKey, cycle: &str, name: &str, submit_num: u32) -> std::collections::BTreeMap<String, String> {
        let proxy = self.scheduler.pool.get(key);
        let mut env = std::collections::BTreeMap::new();
        env.insert("FLOWD_WORKFLOW_ID".into(), self.workflow_name.clone());
        env.insert("FLOWD_WORKFLOW_RUN_DIR".into(), self.run_dir.display().to_string());
        env.insert("FLOWD_WORKFLOW_LOG_DIR".into(), self.run_dir.join("log").display().to_string());
        env.insert("FLOWD_WORKFLOW_SHARE_DIR".into(), self.run_dir.join("share").display().to_string());
        env.insert(
            "FLOWD_WORKFLOW_WORK_DIR".into(),
            self.run_dir.join("work").join(cycle).join(name).display().to_string(),
        );
        env.insert("FLOWD_TASK_ID".into(), format!("{cycle}/{name}"));
        env.insert("FLOWD_TASK_NAME".into(), name.to_string());
        env.insert("FLOWD_TASK_CYCLE_POINT".into(), cycle.to_string());
        env.insert("FLOWD_TASK_SUBMIT_NUMBER".into(), (submit_num + 1).to_string());
        env.insert("FLOWD_TASK_TRY_NUMBER".into(), (submit_num + 1).to_string());
        env.insert("FLOWD_TASK_JOB".into(), format!("{cycle}/{name}/{:02}", submit_num + 1));
        if let Some(proxy) = proxy {
            env.insert("FLOWD_TASK_FLOW_NUMS".into(), proxy.flows.to_string());
        }
        env
    }

    /// Gate `preparing` proxies by their named queue's concurrency cap,
    /// then batch and submit the cleared ones per platform.
    async fn submit_ready_jobs(&mut self) {
        let candidates: Vec<(TaskCycleKey, String)> = self
            .scheduler
            .pool
            .iter_by_state(TaskState::Preparing)
            .filter_map(|(key, _)| {
                self.scheduler.names.get(key.task).map(|n| (*key, n.to_string()))
            })
            .collect();
        let (cleared, _queued) = partition_by_queue_cap(&self.scheduler.queues, candidates);

        let mut by_platform: HashMap<String, Vec<TaskCycleKey>> = HashMap::new();
        for key in cleared {
            let platform_name = self.platform_for(key).map(|p| p.name.clone());
            match platform_name {
                Some(name) => by_platform.entry(name).or_default().push(key),
                None => {
                    let selector = self
                        .scheduler
                        .defs
                        .get(&key.task)
                        .map(|d| format!("{:?}", d.platform.candidates()))
                        .unwrap_or_default();
                    warn!(selector = %selector, "no platform matches task selector");
                    if let Some(proxy) = self.scheduler.pool.get_mut(key) {
                        proxy.transition(TaskState::SubmitFailed);
                    }
                }
            }
        }

        for (platform_name, keys) in by_platform {
            let Some(platform) = self.platforms.iter().find(|p| p.name == platform_name).cloned()
            else {
                continue;
            };
            for chunk in balanced_chunks(&keys, MAX_BATCH_SIZE) {
                self.submit_chunk(&platform, &chunk).await;
            }
        }
    }

    async fn submit_chunk(&mut self, platform: &Platform, chunk: &[TaskCycleKey]) {
        let mut specs = Vec::with_capacity(chunk.len());
        let mut spec_keys = Vec::with_capacity(chunk.len());
        for &key in chunk {
            let Some(name) = self.scheduler.names.get(key.task).map(str::to_string) else { continue };
            let Some(def) = self.scheduler.defs.get(&key.task) else { continue };
            let Some(proxy) = self.scheduler.pool.get(key) else { continue };
            let cycle = self
                .scheduler
                .arena
                .get(key.cycle)
                .map(|p| p.to_string())
                .unwrap_or_default();
            let submit_num = proxy.submit_num;
            let mut environment = def.environment.clone();
            environment
                .extend(self.scheduler.broadcast.effective(&cycle, &[name.clone(), "root".to_string()]));
            environment.extend(self.job_environment(key, &cycle, &name, submit_num));
            specs.push(JobSpec {
                cycle: cycle.clone(),
                name: name.clone(),
                submit_num,
                script: def.script.clone(),
                environment,
                work_dir: self.job_dir(&cycle, &name, submit_num),
            });
            spec_keys.push((key, name, cycle));
        }

        match self.job_manager.submit_batch(platform, &specs).await {
            Ok(results) => {
                for ((key, name, cycle), result) in spec_keys.into_iter().zip(results) {
                    let Some(proxy) = self.scheduler.pool.get_mut(key) else { continue };
                    let submit_num = proxy.submit_num;
                    match result.outcome {
                        Ok(job_id) => {
                            proxy.transition(TaskState::Submitted);
                            let deadline = self
                                .scheduler
                                .defs
                                .get(&key.task)
                                .and_then(|d| d.execution_time_limit)
                                .map(|limit| time_limit_poll_at(Instant::now(), limit, self.tick * 2));
                            self.scheduler.queues.record_submitted(&name);
                            self.job_table.ids.insert(key, job_id.clone());
                            if let Some(deadline) = deadline {
                                self.job_table.deadlines.insert(key, deadline);
                            }
                            let row = JobRow {
                                cycle,
                                name,
                                submit_num: submit_num as i64,
                                try_num: submit_num as i64 + 1,
                                platform: platform.name.clone(),
                                job_runner: platform.job_runner.clone(),
                                job_id: Some(job_id),
                                submit_status: Some(0),
                                run_status: None,
                                time_submit: Some(chrono::Utc::now()),
                                time_run: None,
                                time_run_exit: None,
                            };
                            if let Err(e) = SnapshotStore::insert_job_row(&self.db, &row).await {
                                warn!(error = %e, "failed to persist job row");
                            }
                        }
                        Err(e) => {
                            warn!(task = %name, error = %e, "submission failed");
                            proxy.transition(TaskState::SubmitFailed);
                        }
                    }
                }
            }
            Err(e) => {
                warn!(platform = %platform.name, error = %e, "batch submission failed");
                for key in chunk {
                    if let Some(proxy) = self.scheduler.pool.get_mut(*key) {
                        proxy.transition(TaskState::SubmitFailed);
                    }
                }
            }
        }
    }

    /// Poll every active job and reconcile its reported status under the
    /// terminal-wins precedence rule.
    async fn poll_active_jobs(&mut self) {
        let active: Vec<TaskCycleKey> = self
            .scheduler
            .pool
            .iter()
            .filter(|(k, p)| p.state.is_active() && self.job_table.ids.contains_key(k))
            .map(|(k, _)| *k)
            .collect();

        let mut by_platform: HashMap<String, Vec<TaskCycleKey>> = HashMap::new();
        for key in active {
            if let Some(platform) = self.platform_for(key) {
                by_platform.entry(platform.name.clone()).or_default().push(key);
            }
        }

        for (platform_name, keys) in by_platform {
            let Some(platform) = self.platforms.iter().find(|p| p.name == platform_name).cloned()
            else {
                continue;
            };
            let job_ids: Vec<String> =
                keys.iter().filter_map(|k| self.job_table.ids.get(k).cloned()).collect();
            let polled = match self.job_manager.poll_batch(&platform, &job_ids).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(platform = %platform_name, error = %e, "poll failed");
                    continue;
                }
            };
            for (key, (_, poll_state)) in keys.into_iter().zip(polled) {
                self.reconcile(key, reported_status(poll_state)).await;
            }
        }
    }

    /// Apply one status report through the reconciler and, if it stands,
    /// to the pool: transition, output completion, downstream spawning,
    /// event handlers, and persistence.
    async fn reconcile(&mut self, key: TaskCycleKey, status: ReportedStatus) {
        let Some(name) = self.scheduler.names.get(key.task).map(str::to_string) else { return };
        let cycle = self
            .scheduler
            .arena
            .get(key.cycle)
            .map(|p| p.to_string())
            .unwrap_or_default();
        let submit_num = self.scheduler.pool.get(key).map(|p| p.submit_num).unwrap_or(0);

        let Some(status) = self
            .job_manager
            .reconciler
            .report((cycle.clone(), name.clone(), submit_num), status)
        else {
            return;
        };

        let new_state = match status {
            ReportedStatus::Submitted => TaskState::Submitted,
            ReportedStatus::Running => TaskState::Running,
            ReportedStatus::Succeeded => TaskState::Succeeded,
            ReportedStatus::Failed => TaskState::Failed,
            ReportedStatus::SubmitFailed => TaskState::SubmitFailed,
        };
        let transitioned = self
            .scheduler
            .pool
            .get_mut(key)
            .map(|p| p.transition(new_state))
            .unwrap_or(false);
        if !transitioned {
            return;
        }
        self.append_events(vec![(
            EventKind::StateTransition,
            serde_json::json!({ "cycle": cycle, "name": name, "state": new_state.as_str() }),
        )])
        .await;

        if status.is_terminal() {
            self.scheduler.queues.record_finished(&name);
            self.job_table.ids.remove(&key);
            self.job_table.deadlines.remove(&key);
            let run_status = match status {
                ReportedStatus::Succeeded => Some(0),
                ReportedStatus::Failed => Some(1),
                _ => None,
            };
            if let Err(e) =
                SnapshotStore::record_job_exit(&self.db, &cycle, &name, submit_num as i64, run_status)
                    .await
            {
                warn!(error = %e, "failed to record job exit");
            }
        }

        let output = match new_state {
            TaskState::Succeeded => Some(Output::Predefined(PredefinedOutput::Succeeded)),
            TaskState::Failed => Some(Output::Predefined(PredefinedOutput::Failed)),
            _ => None,
        };
        if let Some(output) = output {
            match self.scheduler.pool.complete_output(
                key,
                output.clone(),
                &self.scheduler.graph,
                &mut self.scheduler.arena,
            ) {
                Ok(spawned) if !spawned.is_empty() => {
                    info!(spawned = spawned.len(), task = %name, "downstream proxies spawned")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "completing output failed"),
            }
            self.append_events(vec![(
                EventKind::OutputCompleted,
                serde_json::json!({ "cycle": cycle, "name": name, "output": output.to_string() }),
            )])
            .await;
            self.fire_task_handlers(key, &name, &cycle, &output.to_string()).await;
        }

        if let Some(proxy) = self.scheduler.pool.get(key) {
            let row = TaskStateRow {
                name,
                cycle,
                flow_nums: proxy.flows.to_string(),
                submit_num: proxy.submit_num as i64,
                status: proxy.state.as_str().to_string(),
                time_updated: chrono::Utc::now(),
            };
            if let Err(e) = SnapshotStore::upsert_state_row(&self.db, &row).await {
                warn!(error = %e, "failed to persist task state row");
            }
        }
    }

    async fn fire_task_handlers(&self, key: TaskCycleKey, name: &str, cycle: &str, event: &str) {
        let Some(def) = self.scheduler.defs.get(&key.task) else { return };
        let Some(templates) = def.event_handlers.get(event) else { return };
        let submit_num = self.scheduler.pool.get(key).map(|p| p.submit_num).unwrap_or(0);
        let args = HandlerArgs {
            workflow: self.workflow_name.clone(),
            name: name.to_string(),
            point: cycle.to_string(),
            event: event.to_string(),
            submit_num: submit_num + 1,
            try_num: submit_num + 1,
            id: format!("{cycle}/{name}"),
            job_id: self.job_table.ids.get(&key).cloned().unwrap_or_default(),
            platform_name: self
                .platform_for(key)
                .map(|p| p.name.clone())
                .unwrap_or_default(),
            ..Default::default()
        };
        for template in templates {
            self.handlers.dispatch(HandlerClass::Event, template, &args).await;
        }
    }

    /// Fire a task's severity-scoped handlers for a warning- or
    /// critical-level message.
    async fn fire_severity_handlers(&self, name: &str, cycle: &str, event: &str) {
        let Some(task) = self.scheduler.names.lookup(name) else { return };
        let Some(def) = self.scheduler.defs.get(&task) else { return };
        let Some(templates) = def.event_handlers.get(event) else { return };
        let class =
            if event == "critical" { HandlerClass::Critical } else { HandlerClass::Warning };
        let args = HandlerArgs {
            workflow: self.workflow_name.clone(),
            name: name.to_string(),
            point: cycle.to_string(),
            event: event.to_string(),
            id: format!("{cycle}/{name}"),
            ..Default::default()
        };
        for template in templates {
            self.handlers.dispatch(class, template, &args).await;
        }
    }

    /// Kill the jobs behind the proxies a `kill` command named, then
    /// reconcile whatever state the platform reports back. A job that
    /// finished before the kill landed keeps its real terminal status.
    async fn kill_jobs(&mut self, keys: &[TaskCycleKey]) {
        for &key in keys {
            let Some(job_id) = self.job_table.ids.get(&key).cloned() else { continue };
            let Some(platform) = self.platform_for(key).cloned() else { continue };
            match self.job_manager.kill_batch(&platform, &[job_id.clone()]).await {
                Ok(results) => {
                    for (_, result) in results {
                        if let Err(e) = result {
                            warn!(job_id = %job_id, error = %e, "kill failed");
                        }
                    }
                    let polled = self
                        .job_manager
                        .poll_batch(&platform, &[job_id])
                        .await
                        .unwrap_or_default();
                    let status = polled
                        .first()
                        .map(|(_, s)| reported_status(*s))
                        .unwrap_or(ReportedStatus::Failed);
                    let status = if status.is_terminal() { status } else { ReportedStatus::Failed };
                    self.reconcile(key, status).await;
                }
                Err(e) => warn!(error = %e, "kill dispatch failed"),
            }
        }
    }

    /// A running job past `start + execution time limit + margin` is
    /// presumed stuck: kill it and record the failure.
    async fn enforce_time_limits(&mut self) {
        let now = Instant::now();
        let expired: Vec<TaskCycleKey> = self
            .job_table
            .deadlines
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            warn!(?key, "execution time limit exceeded, killing job");
            self.job_table.deadlines.remove(key);
        }
        if !expired.is_empty() {
            self.kill_jobs(&expired).await;
        }
    }

    /// Requeue failed and submit-failed proxies that still have retries
    /// left, gated behind the configured delay, and fire their `retry`
    /// handlers.
    async fn retry_failed_jobs(&mut self) {
        let candidates: Vec<(TaskCycleKey, TaskState)> = self
            .scheduler
            .pool
            .iter()
            .filter(|(_, p)| matches!(p.state, TaskState::Failed | TaskState::SubmitFailed))
            .map(|(k, p)| (*k, p.state))
            .collect();
        for (key, state) in candidates {
            let Some(def) = self.scheduler.defs.get(&key.task) else { continue };
            let submit_num = self.scheduler.pool.get(key).map(|p| p.submit_num).unwrap_or(0);
            let delay = match state {
                TaskState::SubmitFailed => def.submission_retry_delay(submit_num),
                _ => def.retry_delay(submit_num),
            };
            let Some(delay) = delay else { continue };
            let name = def.name.clone();
            let cycle = self
                .scheduler
                .arena
                .get(key.cycle)
                .map(|p| p.to_string())
                .unwrap_or_default();
            if self.scheduler.pool.record_retry(key, Some(delay)).is_ok() {
                info!(task = %name, cycle = %cycle, ?delay, "retry scheduled");
                self.append_events(vec![(
                    EventKind::StateTransition,
                    serde_json::json!({ "cycle": cycle, "name": name, "state": "waiting", "retry": true }),
                )])
                .await;
                self.fire_task_handlers(key, &name, &cycle, "retry").await;
            }
        }
    }

    async fn handle_stall(&mut self, stalled: bool) {
        if !stalled {
            self.stall_handlers_fired = false;
            return;
        }
        if self.stall_handlers_fired {
            return;
        }
        self.stall_handlers_fired = true;
        let args = HandlerArgs {
            workflow: self.workflow_name.clone(),
            event: "stall".to_string(),
            ..Default::default()
        };
        for template in self.stall_handlers.clone() {
            self.handlers.dispatch(HandlerClass::Event, &template, &args).await;
        }
        if self.abort_on_stall {
            error!("workflow stalled and abort-on-stall is set");
            self.scheduler.request_shutdown(ShutdownReason::StalledAbort);
        }
    }

    async fn append_events(&mut self, events: Vec<(EventKind, serde_json::Value)>) {
        if events.is_empty() {
            return;
        }
        for (kind, payload) in &events {
            if *kind == EventKind::BroadcastChange {
                self.apply_broadcast_change(payload).await;
            }
            self.publish(kind.as_str(), payload);
        }
        let clock = monotonic_millis();
        let batch: Vec<(i64, EventKind, serde_json::Value)> =
            events.into_iter().map(|(kind, payload)| (clock, kind, payload)).collect();
        if let Err(e) = EventLog::append_batch(&self.db, &batch).await {
            warn!(error = %e, "failed to append event batch");
        }
    }

    /// Push one event to every subscriber whose topic matches: the
    /// catch-all `events` topic or the event's own kind. A closed
    /// connection drops its subscription; a full channel drops the frame
    /// (a slow consumer never stalls the loop).
    fn publish(&mut self, kind: &str, payload: &serde_json::Value) {
        use tokio::sync::mpsc::error::TrySendError;
        self.subscribers.retain(|(topic, tx)| {
            if topic != "events" && topic != kind {
                return true;
            }
            let frame = Response::SubscribeEvent { topic: topic.clone(), value: payload.clone() };
            !matches!(tx.try_send(frame), Err(TrySendError::Closed(_)))
        });
    }

    /// Mirror one broadcast change into the `broadcast_states` snapshot
    /// table and the `broadcast_events` history.
    async fn apply_broadcast_change(&self, payload: &serde_json::Value) {
        let field = |name: &str| payload.get(name).and_then(|v| v.as_str());
        let change = field("change").unwrap_or_default();
        let point = field("point");
        let namespace = field("namespace");
        let key = field("key");
        let value = field("value");
        if let Err(e) =
            SnapshotStore::record_broadcast_event(&self.db, change, point, namespace, key, value)
                .await
        {
            warn!(error = %e, "failed to record broadcast event");
        }
        let result = match change {
            "set" => match (namespace, key, value) {
                (Some(namespace), Some(key), Some(value)) => {
                    SnapshotStore::upsert_broadcast_state(
                        &self.db,
                        &BroadcastStateRow {
                            point: point.unwrap_or("*").to_string(),
                            namespace: namespace.to_string(),
                            key: key.to_string(),
                            value: value.to_string(),
                        },
                    )
                    .await
                }
                _ => Ok(()),
            },
            "cancel" => match (namespace, key) {
                (Some(namespace), Some(key)) => {
                    SnapshotStore::delete_broadcast_state(
                        &self.db,
                        point.unwrap_or("*"),
                        namespace,
                        key,
                    )
                    .await
                }
                _ => Ok(()),
            },
            "clear" => SnapshotStore::clear_broadcast_states(&self.db, point, namespace).await,
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to update broadcast state table");
        }
    }

    /// Flush the live pool — rows, recorded outputs, prerequisite
    /// satisfaction, hold marks, and received external triggers — to the
    /// snapshot tables, drop proxies whose work is finished, and advance
    /// the snapshot's replay point. The replay point only moves here,
    /// after everything a restart needs is durably in the tables.
    async fn flush_snapshot(&mut self) {
        let rows: Vec<(TaskCycleKey, TaskPoolRow)> = self
            .scheduler
            .pool
            .iter()
            .map(|(key, proxy)| {
                (
                    *key,
                    TaskPoolRow {
                        cycle: self
                            .scheduler
                            .arena
                            .get(key.cycle)
                            .map(|p| p.to_string())
                            .unwrap_or_default(),
                        name: self
                            .scheduler
                            .names
                            .get(key.task)
                            .unwrap_or_default()
                            .to_string(),
                        flow_nums: proxy.flows.to_string(),
                        status: proxy.state.as_str().to_string(),
                        is_held: proxy.held,
                    },
                )
            })
            .collect();
        for (key, row) in &rows {
            if let Err(e) = SnapshotStore::upsert_pool_row(&self.db, row).await {
                warn!(error = %e, "failed to persist pool row");
            }
            self.flush_proxy_detail(*key, row).await;
        }

        let hold_rows: Vec<HoldRow> = self
            .scheduler
            .pool
            .hold_marks()
            .iter()
            .filter_map(|(task, cycle)| {
                let name = self.scheduler.names.get(*task)?.to_string();
                let cycle = match cycle {
                    Some(id) => self.scheduler.arena.get(*id)?.to_string(),
                    None => "*".to_string(),
                };
                Some(HoldRow { name, cycle })
            })
            .collect();
        if let Err(e) = SnapshotStore::replace_hold_rows(&self.db, &hold_rows).await {
            warn!(error = %e, "failed to persist hold marks");
        }

        for (signature, results) in &self.scheduler.xtriggers {
            if let Err(e) = SnapshotStore::upsert_xtrigger(&self.db, signature, results).await {
                warn!(error = %e, "failed to persist external trigger");
            }
        }

        let removable: Vec<TaskCycleKey> = rows
            .iter()
            .map(|(k, _)| *k)
            .filter(|k| self.scheduler.pool.is_removable(*k))
            .collect();
        for key in removable {
            if let Some((_, row)) = rows.iter().find(|(k, _)| *k == key) {
                let _ =
                    SnapshotStore::delete_pool_row(&self.db, &row.cycle, &row.name, &row.flow_nums)
                        .await;
                let _ = SnapshotStore::delete_outputs_row(
                    &self.db,
                    &row.cycle,
                    &row.name,
                    &row.flow_nums,
                )
                .await;
                let _ = SnapshotStore::delete_prereq_rows(
                    &self.db,
                    &row.cycle,
                    &row.name,
                    &row.flow_nums,
                )
                .await;
            }
            self.scheduler.pool.remove(key);
        }

        match EventLog::highest_sequence_no(&self.db).await {
            Ok(seq) => {
                if let Err(e) =
                    SnapshotStore::set_workflow_param(&self.db, "snapshot_seq", &seq.to_string())
                        .await
                {
                    warn!(error = %e, "failed to advance snapshot sequence");
                }
            }
            Err(e) => warn!(error = %e, "failed to read event sequence"),
        }
    }

    /// Persist one proxy's completed outputs and prerequisite atoms.
    async fn flush_proxy_detail(&self, key: TaskCycleKey, row: &TaskPoolRow) {
        let Some(proxy) = self.scheduler.pool.get(key) else { return };

        let outputs: Vec<String> = proxy.outputs_completed.iter().map(|o| o.to_string()).collect();
        let outputs_row = TaskOutputsRow {
            cycle: row.cycle.clone(),
            name: row.name.clone(),
            flow_nums: row.flow_nums.clone(),
            outputs: serde_json::to_string(&outputs).unwrap_or_else(|_| "[]".to_string()),
        };
        if let Err(e) = SnapshotStore::upsert_outputs_row(&self.db, &outputs_row).await {
            warn!(error = %e, "failed to persist outputs row");
        }

        let prereq_rows: Vec<TaskPrereqRow> = proxy
            .prerequisites
            .atoms()
            .into_iter()
            .filter_map(|atom| {
                Some(TaskPrereqRow {
                    cycle: row.cycle.clone(),
                    name: row.name.clone(),
                    flow_nums: row.flow_nums.clone(),
                    prereq_name: self.scheduler.names.get(atom.task)?.to_string(),
                    prereq_cycle: self.scheduler.arena.get(atom.cycle)?.to_string(),
                    prereq_output: atom.output.to_string(),
                    satisfied: atom.is_satisfied(),
                })
            })
            .collect();
        if let Err(e) = SnapshotStore::replace_prereq_rows(
            &self.db,
            &row.cycle,
            &row.name,
            &row.flow_nums,
            &prereq_rows,
        )
        .await
        {
            warn!(error = %e, "failed to persist prerequisite rows");
        }
    }
}

fn reported_status(state: JobPollState) -> ReportedStatus {
    match state {
        JobPollState::Submitted => ReportedStatus::Submitted,
        JobPollState::Running => ReportedStatus::Running,
        JobPollState::Succeeded => ReportedStatus::Succeeded,
        JobPollState::Failed => ReportedStatus::Failed,
        // The local driver can only observe that a process is gone, not
        // why; the job.status file's exit record settles it.
        JobPollState::Gone => ReportedStatus::Failed,
    }
}

fn monotonic_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received ctrl-c") }
        _ = terminate => { info!("received sigterm") }
    }
}
