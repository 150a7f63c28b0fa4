//! Integration tests exercising end-to-end scheduling scenarios against
//! the library's public API rather than the `flowd-server` binary.

use async_trait::async_trait;
use flowd::broadcast::{BroadcastOverlay, BroadcastTarget};
use flowd::commands::{Command, CommandEnvelope, FlowOption};
use flowd::config::WorkflowConfig;
use flowd::cycle::{CycleDuration, CyclePoint};
use flowd::db::{TaskOutputsRow, TaskPoolRow, TaskPrereqRow};
use flowd::domain::{FlowSet, Output, PredefinedOutput, TaskCycleKey, TaskId, TaskState};
use flowd::engine::Scheduler;
use flowd::graph::{Edge, Graph};
use flowd::ingress::{Severity, TaskMessage};
use flowd::jobs::{balanced_chunks, JobDriver, JobManager, JobPollState, JobSpec, Platform, SubmitResult};
use std::time::Duration;

fn succeeded() -> Output {
    Output::Predefined(PredefinedOutput::Succeeded)
}

fn message(name: &str, cycle: &str, text: &str) -> TaskMessage {
    TaskMessage {
        severity: Severity::Info,
        text: text.to_string(),
        cycle: cycle.to_string(),
        name: name.to_string(),
        submit_num: 0,
        sender_timestamp: chrono::Utc::now(),
        sequence_no: 0,
    }
}

fn linear_chain_scheduler() -> (Scheduler, TaskId, TaskId) {
    let mut graph = Graph::new(Some(CyclePoint::Integer(1)));
    let foo = TaskId(0);
    let bar = TaskId(1);
    graph.add_edge(Edge { lhs: foo, lhs_output: succeeded(), lhs_offset: None, lhs_absolute_initial: false, rhs: bar });
    let mut scheduler = Scheduler::new(graph, CycleDuration::Integer(1), Duration::from_secs(60));
    scheduler.names.intern("foo");
    scheduler.names.intern("bar");
    (scheduler, foo, bar)
}

/// A two-task chain loaded from configuration, driven purely through
/// `seed`/`iterate` and task messages: `foo => bar` on `P1` from cycle 1
/// to 2. Every instance must run and the pool must drain to empty.
#[test]
fn linear_chain_two_cycles_runs_to_completion() {
    let config: WorkflowConfig = serde_yaml::from_str(
        r#"
        name: chain
        initial_cycle_point: "1"
        stop_after_cycle_point: "2"
        runahead_limit: "P1"
        tasks:
          - name: foo
            script: "true"
            platform: !Named localhost
            recurrences: [{ start: "1", period: "P1", stop: "2" }]
          - name: bar
            script: "true"
            platform: !Named localhost
            recurrences: [{ start: "1", period: "P1", stop: "2" }]
        graph:
          - { lhs: foo, rhs: bar }
        server: { bind_addr: "127.0.0.1:0", shared_secret: "s" }
        "#,
    )
    .unwrap();
    let built = config.build().unwrap();
    let mut s = Scheduler::with_names(built.graph, built.names, built.runahead_limit, built.stall_timeout);
    s.stop_after = built.stop_after;
    s.set_definitions(built.task_definitions);
    s.seed().unwrap();

    // Drive until quiescent: every Preparing proxy "runs" by reporting
    // started then succeeded through the message path.
    for _ in 0..20 {
        s.iterate(Vec::new(), Vec::new()).unwrap();
        let preparing: Vec<(String, String)> = s
            .pool
            .iter_by_state(TaskState::Preparing)
            .map(|(k, _)| {
                (
                    s.names.get(k.task).unwrap().to_string(),
                    s.arena.get(k.cycle).unwrap().to_string(),
                )
            })
            .collect();
        let mut messages = Vec::new();
        for (name, cycle) in preparing {
            messages.push(message(&name, &cycle, "started"));
            messages.push(message(&name, &cycle, "succeeded"));
        }
        s.iterate(Vec::new(), messages).unwrap();
        // Succeeded proxies leave the pool once flushed; emulate the
        // server's removal pass.
        let done: Vec<TaskCycleKey> =
            s.pool.iter().filter(|(k, _)| s.pool.is_removable(**k)).map(|(k, _)| *k).collect();
        for key in done {
            s.pool.remove(key);
        }
        if s.pool.is_empty() {
            break;
        }
    }

    assert!(s.pool.is_empty());
    // One more pass notices the drained pool and exhausted recurrences.
    s.iterate(Vec::new(), Vec::new()).unwrap();
    assert_eq!(s.shutdown_reason(), Some(flowd::engine::ShutdownReason::Completed));
}

/// Failure then retry: two retry delays configured; the proxy must
/// survive two failures, reach `submit_num == 2` on its third attempt,
/// and finally succeed without its flow-set changing.
#[test]
fn failure_then_retry_reaches_third_submission() {
    let retry_delays = [Duration::from_millis(1), Duration::from_millis(1)];
    let graph = Graph::new(None);
    let mut arena = flowd::graph::CycleArena::new();
    let c1 = arena.intern(CyclePoint::Integer(1));
    let t = TaskId(0);

    let mut pool = flowd::pool::TaskPool::new();
    pool.spawn(t, c1, FlowSet::single(1), &graph, &mut arena).unwrap();
    let key = TaskCycleKey { task: t, cycle: c1 };

    let mut try_num = 1;
    let mut retries_logged = 0;
    for attempt in 0..2 {
        assert!(pool.get_mut(key).unwrap().transition(TaskState::Submitted));
        assert!(pool.get_mut(key).unwrap().transition(TaskState::Running));
        assert!(pool.get_mut(key).unwrap().transition(TaskState::Failed));
        pool.record_retry(key, retry_delays.get(attempt).copied()).unwrap();
        retries_logged += 1;
        try_num += 1;
    }
    assert_eq!(pool.get(key).unwrap().submit_num, 2);
    assert_eq!(try_num, 3);
    assert_eq!(retries_logged, 2);

    std::thread::sleep(Duration::from_millis(5));
    assert!(pool.get(key).unwrap().is_ready());
    assert!(pool.get_mut(key).unwrap().transition(TaskState::Submitted));
    assert!(pool.get_mut(key).unwrap().transition(TaskState::Running));
    assert!(pool.get_mut(key).unwrap().transition(TaskState::Succeeded));
    assert_eq!(pool.get(key).unwrap().state, TaskState::Succeeded);
    assert!(pool.get(key).unwrap().flows.intersects(&FlowSet::single(1)));
}

/// Runahead limit: a blocked cycle-1 proxy must keep the horizon pinned
/// at `cycle + runahead_limit`; nothing beyond it is ever within the
/// readiness scan's window, and no transition means the stall timeout
/// fires.
#[test]
fn runahead_limit_pins_horizon_to_blocked_cycle() {
    let graph = Graph::new(None);
    let mut scheduler = Scheduler::new(graph, CycleDuration::Integer(2), Duration::from_millis(1));
    let foo = scheduler.names.intern("foo");
    let c1 = scheduler.arena.intern(CyclePoint::Integer(1));
    scheduler.pool.spawn(foo, c1, FlowSet::single(1), &scheduler.graph, &mut scheduler.arena).unwrap();

    for cycle in 2..=20 {
        let c = scheduler.arena.intern(CyclePoint::Integer(cycle));
        scheduler.pool.spawn(foo, c, FlowSet::single(1), &scheduler.graph, &mut scheduler.arena).unwrap();
    }

    assert_eq!(scheduler.runahead_horizon(), Some(CyclePoint::Integer(3)));
    scheduler.iterate(Vec::new(), Vec::new()).unwrap();

    std::thread::sleep(Duration::from_millis(5));
    let report2 = scheduler.iterate(Vec::new(), Vec::new()).unwrap();
    assert!(report2.stalled);

    let c4 = scheduler.arena.intern(CyclePoint::Integer(4));
    assert_eq!(scheduler.pool.get(TaskCycleKey { task: foo, cycle: c4 }).unwrap().state, TaskState::Waiting);
}

/// `trigger --flow=new` on a proxy already waiting in flow 1 merges into
/// a single proxy carrying both flows; its downstream child inherits the
/// merged flow-set.
#[test]
fn trigger_new_flow_merges_into_existing_waiting_proxy() {
    let (mut scheduler, foo, bar) = linear_chain_scheduler();
    let c1 = scheduler.arena.intern(CyclePoint::Integer(1));
    scheduler.pool.spawn(foo, c1, FlowSet::single(1), &scheduler.graph, &mut scheduler.arena).unwrap();

    scheduler
        .iterate(
            vec![CommandEnvelope {
                idempotency_key: "trig-1".to_string(),
                command: Command::Trigger {
                    task_glob: "foo".to_string(),
                    cycle_glob: Some("1".to_string()),
                    flow: FlowOption::New,
                    wait: false,
                },
            }],
            Vec::new(),
        )
        .unwrap();

    let key = TaskCycleKey { task: foo, cycle: c1 };
    assert_eq!(scheduler.pool.get(key).unwrap().flows.to_string(), "{1,2}");
    assert_eq!(scheduler.pool.len(), 1);

    assert!(scheduler.pool.get_mut(key).unwrap().transition(TaskState::Succeeded));
    let spawned = scheduler.pool.complete_output(key, succeeded(), &scheduler.graph, &mut scheduler.arena).unwrap();
    assert_eq!(spawned, vec![TaskCycleKey { task: bar, cycle: c1 }]);
    assert_eq!(scheduler.pool.get(spawned[0]).unwrap().flows.to_string(), "{1,2}");
}

/// Broadcast overlay: setting `FOO=BAR` for `(*, root)` must appear in a
/// job's resolved environment; cancelling it must remove it from the
/// next submission.
#[test]
fn broadcast_overlay_reaches_job_environment_until_cancelled() {
    let mut overlay = BroadcastOverlay::new();
    let target = BroadcastTarget { point: None, namespace: "root".to_string(), key: "FOO".to_string() };
    overlay.set(target.clone(), "BAR".to_string());

    let chain = vec!["t".to_string(), "root".to_string()];
    let mut env = std::collections::BTreeMap::new();
    env.extend(overlay.effective("1", &chain));
    assert_eq!(env.get("FOO"), Some(&"BAR".to_string()));

    overlay.cancel(&target);
    let mut env2 = std::collections::BTreeMap::new();
    env2.extend(overlay.effective("1", &chain));
    assert!(env2.get("FOO").is_none());
}

struct FlakyFirstHostDriver;

#[async_trait]
impl JobDriver for FlakyFirstHostDriver {
    fn name(&self) -> &str {
        "ssh"
    }

    async fn prepare(&self, _batch: &[JobSpec]) -> Vec<Result<std::path::PathBuf, String>> {
        Vec::new()
    }

    async fn submit(&self, host: &str, batch: &[JobSpec]) -> Vec<SubmitResult> {
        batch
            .iter()
            .map(|job| {
                let key = (job.cycle.clone(), job.name.clone(), job.submit_num);
                if host == "h1" {
                    SubmitResult { job_key: key, outcome: Err("ssh connect refused".to_string()) }
                } else {
                    SubmitResult { job_key: key, outcome: Ok(format!("job-on-{host}")) }
                }
            })
            .collect()
    }

    async fn poll(&self, _host: &str, job_ids: &[String]) -> Vec<(String, JobPollState)> {
        job_ids.iter().map(|id| (id.clone(), JobPollState::Running)).collect()
    }

    async fn kill(&self, _host: &str, job_ids: &[String]) -> Vec<(String, Result<(), String>)> {
        job_ids.iter().map(|id| (id.clone(), Ok(()))).collect()
    }
}

/// Remote submit-fail with fallback: `h1` rejects SSH; the manager marks
/// it bad and retries `h2` within the same call. Subsequent submissions
/// go straight to `h2` while `h1` is retained.
#[tokio::test]
async fn submit_fails_over_to_second_host_and_sticks() {
    let platform = Platform {
        name: "p1".to_string(),
        hosts: vec!["h1".to_string(), "h2".to_string()],
        job_runner: "ssh".to_string(),
        install_target: "p1".to_string(),
        selection_method: flowd::jobs::HostSelectionMethod::DefinitionOrder,
    };
    let mut manager = JobManager::new(Duration::from_secs(300));
    manager.register_driver(std::sync::Arc::new(FlakyFirstHostDriver));

    let spec = JobSpec {
        cycle: "1".to_string(),
        name: "t".to_string(),
        submit_num: 0,
        script: "true".to_string(),
        environment: Default::default(),
        work_dir: std::env::temp_dir(),
    };

    let first = manager.submit_batch(&platform, std::slice::from_ref(&spec)).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].outcome.as_deref(), Ok("job-on-h2"));

    let second = manager.submit_batch(&platform, std::slice::from_ref(&spec)).await.unwrap();
    assert_eq!(second[0].outcome.as_deref(), Ok("job-on-h2"));
}

/// Two identical `trigger --flow=<k>` commands against the same target
/// collapse to one proxy and do not double-bump its submission count.
#[test]
fn repeated_identical_trigger_collapses_to_one_proxy() {
    let (mut scheduler, foo, _bar) = linear_chain_scheduler();
    let c1 = scheduler.arena.intern(CyclePoint::Integer(1));

    let envelope = || CommandEnvelope {
        idempotency_key: "trig-same".to_string(),
        command: Command::Trigger {
            task_glob: "foo".to_string(),
            cycle_glob: Some("1".to_string()),
            flow: FlowOption::Existing(1),
            wait: false,
        },
    };
    scheduler.iterate(vec![envelope()], Vec::new()).unwrap();
    scheduler.iterate(vec![envelope()], Vec::new()).unwrap();

    assert_eq!(scheduler.pool.len(), 1);
    let key = TaskCycleKey { task: foo, cycle: c1 };
    assert_eq!(scheduler.pool.get(key).unwrap().submit_num, 0);
}

/// A snapshot written by one scheduler restores into an equivalent pool
/// in a fresh one: same keys, states, flow-sets, hold flags, recorded
/// outputs, and prerequisite satisfaction.
#[test]
fn snapshot_rows_restore_an_equivalent_pool() {
    let (mut original, foo, bar) = linear_chain_scheduler();
    let c1 = original.arena.intern(CyclePoint::Integer(1));
    original.pool.spawn(foo, c1, FlowSet::single(1), &original.graph, &mut original.arena).unwrap();
    let foo_key = TaskCycleKey { task: foo, cycle: c1 };
    original.pool.get_mut(foo_key).unwrap().transition(TaskState::Succeeded);
    original.pool.complete_output(foo_key, succeeded(), &original.graph, &mut original.arena).unwrap();
    original.pool.hold(TaskCycleKey { task: bar, cycle: c1 }).unwrap();

    let snapshot = |s: &Scheduler| -> (Vec<TaskPoolRow>, Vec<TaskOutputsRow>, Vec<TaskPrereqRow>) {
        let mut pool_rows = Vec::new();
        let mut output_rows = Vec::new();
        let mut prereq_rows = Vec::new();
        for (key, proxy) in s.pool.iter() {
            let cycle = s.arena.get(key.cycle).unwrap().to_string();
            let name = s.names.get(key.task).unwrap().to_string();
            let flow_nums = proxy.flows.to_string();
            pool_rows.push(TaskPoolRow {
                cycle: cycle.clone(),
                name: name.clone(),
                flow_nums: flow_nums.clone(),
                status: proxy.state.as_str().to_string(),
                is_held: proxy.held,
            });
            let outputs: Vec<String> =
                proxy.outputs_completed.iter().map(|o| o.to_string()).collect();
            output_rows.push(TaskOutputsRow {
                cycle: cycle.clone(),
                name: name.clone(),
                flow_nums: flow_nums.clone(),
                outputs: serde_json::to_string(&outputs).unwrap(),
            });
            for atom in proxy.prerequisites.atoms() {
                prereq_rows.push(TaskPrereqRow {
                    cycle: cycle.clone(),
                    name: name.clone(),
                    flow_nums: flow_nums.clone(),
                    prereq_name: s.names.get(atom.task).unwrap().to_string(),
                    prereq_cycle: s.arena.get(atom.cycle).unwrap().to_string(),
                    prereq_output: atom.output.to_string(),
                    satisfied: atom.is_satisfied(),
                });
            }
        }
        (pool_rows, output_rows, prereq_rows)
    };
    let (pool_rows, output_rows, prereq_rows) = snapshot(&original);

    let (mut restored, foo2, bar2) = linear_chain_scheduler();
    assert_eq!(restored.restore_from_snapshot(&pool_rows, &output_rows, &prereq_rows), 2);

    let c1r = restored.arena.intern(CyclePoint::Integer(1));
    let foo_proxy = restored.pool.get(TaskCycleKey { task: foo2, cycle: c1r }).unwrap();
    assert_eq!(foo_proxy.state, TaskState::Succeeded);
    assert_eq!(foo_proxy.flows.to_string(), "{1}");
    assert!(foo_proxy.outputs_completed.contains(&succeeded()));

    // bar's prerequisite on foo was satisfied before the snapshot and
    // must come back satisfied, not recomputed as pending.
    let bar_proxy = restored.pool.get(TaskCycleKey { task: bar2, cycle: c1r }).unwrap();
    assert!(bar_proxy.held);
    assert!(bar_proxy.prerequisites.is_satisfied());
}

/// An `ext-trigger` command releases every proxy gated on that trigger
/// name, and only those.
#[test]
fn ext_trigger_command_releases_gated_proxies() {
    let config: WorkflowConfig = serde_yaml::from_str(
        r#"
        name: gated
        runahead_limit: "P2"
        tasks:
          - name: watcher
            script: "true"
            platform: !Named localhost
            ext_triggers: [obs_ready]
            recurrences: [{ start: "1", period: "P1", stop: "1" }]
        graph: []
        server: { bind_addr: "127.0.0.1:0", shared_secret: "s" }
        "#,
    )
    .unwrap();
    let built = config.build().unwrap();
    let mut s = Scheduler::with_names(built.graph, built.names, built.runahead_limit, built.stall_timeout);
    s.set_definitions(built.task_definitions);
    s.seed().unwrap();

    s.iterate(Vec::new(), Vec::new()).unwrap();
    s.iterate(Vec::new(), Vec::new()).unwrap();
    let watcher = s.names.lookup("watcher").unwrap();
    let c1 = s.arena.intern(CyclePoint::Integer(1));
    let key = TaskCycleKey { task: watcher, cycle: c1 };
    assert_eq!(s.pool.get(key).unwrap().state, TaskState::Waiting);

    let ext = CommandEnvelope {
        idempotency_key: "x1".into(),
        command: Command::ExtTrigger { name: "obs_ready".to_string(), id: "obs-2020".to_string() },
    };
    s.iterate(vec![ext], Vec::new()).unwrap();
    assert_eq!(s.pool.get(key).unwrap().state, TaskState::Preparing);
}

#[test]
fn balanced_chunks_used_for_scenario_batches_stays_under_cap() {
    let specs: Vec<u32> = (0..250).collect();
    let chunks = balanced_chunks(&specs, flowd::jobs::MAX_BATCH_SIZE);
    assert!(chunks.iter().all(|c| c.len() <= flowd::jobs::MAX_BATCH_SIZE));
}
