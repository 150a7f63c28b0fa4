//! Job driver interface and the local background driver. Drivers are
//! registered in a static name-to-implementation registry; there is no
//! dynamic plug-in discovery.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::process::Command;

/// One job to submit, identified by its `(cycle, name, submit_num)` key
/// plus the rendered script, environment, and its private job directory
/// (`job/<point>/<task>/<submit-num>/` under the run directory).
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub cycle: String,
    pub name: String,
    pub submit_num: u32,
    pub script: String,
    pub environment: BTreeMap<String, String>,
    pub work_dir: std::path::PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPollState {
    Submitted,
    Running,
    Succeeded,
    Failed,
    Gone,
}

#[derive(Debug, Clone)]
pub struct SubmitResult {
    pub job_key: (String, String, u32),
    pub outcome: Result<String, String>,
}

/// `{ prepare(batch) → script-file-paths; submit(batch) → job-ids-or-errors;
/// poll(batch) → states; kill(batch) → results }`.
#[async_trait]
pub trait JobDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Write each job's script file, returning per-job paths or the
    /// error that prevented staging that job.
    async fn prepare(&self, batch: &[JobSpec]) -> Vec<Result<std::path::PathBuf, String>>;

    async fn submit(&self, host: &str, batch: &[JobSpec]) -> Vec<SubmitResult>;

    async fn poll(&self, host: &str, job_ids: &[String]) -> Vec<(String, JobPollState)>;

    async fn kill(&self, host: &str, job_ids: &[String]) -> Vec<(String, Result<(), String>)>;
}

/// Runs jobs as local background OS processes. The reference driver for
/// development and single-host workflows; remote drivers would shell out
/// over SSH to the same script but are out of scope here.
///
/// Each job runs inside its job directory and maintains a `job.status`
/// key=value file there: the runner name, job id/pid, and init time on
/// startup, and the exit code and exit time when the script finishes.
/// Stdout and stderr land in `job.out` and `job.err` alongside it.
pub struct LocalBackgroundDriver;

impl LocalBackgroundDriver {
    fn wrapper(job: &JobSpec) -> String {
        let dir = job.work_dir.display();
        format!(
            concat!(
                "cd \"{dir}\" || exit 1\n",
                "{{ echo JOB_RUNNER_NAME=background; echo \"JOB_ID=$$\"; echo \"JOB_PID=$$\"; ",
                "echo \"JOB_INIT_TIME=$(date -u +%Y-%m-%dT%H:%M:%SZ)\"; }} > job.status\n",
                "sh ./job > job.out 2> job.err\n",
                "rc=$?\n",
                "{{ echo \"JOB_EXIT=$rc\"; echo \"JOB_EXIT_TIME=$(date -u +%Y-%m-%dT%H:%M:%SZ)\"; }} >> job.status\n",
                "exit $rc\n",
            ),
            dir = dir
        )
    }
}

#[async_trait]
impl JobDriver for LocalBackgroundDriver {
    fn name(&self) -> &str {
        "background"
    }

    /// Write each job's script file into its job directory.
    async fn prepare(&self, batch: &[JobSpec]) -> Vec<Result<std::path::PathBuf, String>> {
        let mut paths = Vec::with_capacity(batch.len());
        for job in batch {
            let path = job.work_dir.join("job");
            let staged = match tokio::fs::create_dir_all(&job.work_dir).await {
                Ok(()) => tokio::fs::write(&path, &job.script)
                    .await
                    .map(|()| path)
                    .map_err(|e| format!("writing job script: {e}")),
                Err(e) => Err(format!("creating job directory: {e}")),
            };
            paths.push(staged);
        }
        paths
    }

    /// A job whose script could not be staged is reported as a submit
    /// failure rather than run against a missing or stale file.
    async fn submit(&self, _host: &str, batch: &[JobSpec]) -> Vec<SubmitResult> {
        let prepared = self.prepare(batch).await;
        let mut results = Vec::with_capacity(batch.len());
        for (job, staged) in batch.iter().zip(prepared) {
            let key = (job.cycle.clone(), job.name.clone(), job.submit_num);
            if let Err(e) = staged {
                results.push(SubmitResult { job_key: key, outcome: Err(e) });
                continue;
            }
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(Self::wrapper(job))
                .envs(&job.environment)
                .stdout(Stdio::null())
                .stdin(Stdio::null())
                .stderr(Stdio::null());
            let outcome = match cmd.spawn() {
                Ok(child) => Ok(child.id().map(|p| p.to_string()).unwrap_or_default()),
                Err(e) => Err(e.to_string()),
            };
            results.push(SubmitResult { job_key: key, outcome });
        }
        results
    }

    async fn poll(&self, _host: &str, job_ids: &[String]) -> Vec<(String, JobPollState)> {
        job_ids
            .iter()
            .map(|id| {
                let alive = id
                    .parse::<u32>()
                    .ok()
                    .map(|pid| std::path::Path::new(&format!("/proc/{pid}")).exists())
                    .unwrap_or(false);
                let state = if alive { JobPollState::Running } else { JobPollState::Gone };
                (id.clone(), state)
            })
            .collect()
    }

    async fn kill(&self, _host: &str, job_ids: &[String]) -> Vec<(String, Result<(), String>)> {
        let mut out = Vec::with_capacity(job_ids.len());
        for id in job_ids {
            let result = match Command::new("kill").arg("-15").arg(id).status().await {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(format!("kill exited with {status}")),
                Err(e) => Err(e.to_string()),
            };
            out.push((id.clone(), result));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dir: &std::path::Path) -> JobSpec {
        JobSpec {
            cycle: "1".into(),
            name: "foo".into(),
            submit_num: 0,
            script: "true".into(),
            environment: BTreeMap::new(),
            work_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn submit_runs_script_and_returns_pid() {
        let dir = tempfile::tempdir().unwrap();
        let driver = LocalBackgroundDriver;
        let results = driver.submit("localhost", &[spec(dir.path())]).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].outcome.is_ok());
    }

    #[tokio::test]
    async fn unstageable_script_surfaces_as_submit_error() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the job directory should go makes both
        // create_dir_all and the script write fail.
        let blocked = dir.path().join("occupied");
        tokio::fs::write(&blocked, b"").await.unwrap();
        let driver = LocalBackgroundDriver;
        let results = driver.submit("localhost", &[spec(&blocked)]).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].outcome.is_err());
    }

    #[tokio::test]
    async fn job_status_file_records_init_and_exit() {
        let dir = tempfile::tempdir().unwrap();
        let driver = LocalBackgroundDriver;
        let results = driver.submit("localhost", &[spec(dir.path())]).await;
        let pid = results[0].outcome.clone().unwrap();

        // Wait for the wrapper process to finish before reading the file.
        for _ in 0..100 {
            let polled = driver.poll("localhost", &[pid.clone()]).await;
            if polled[0].1 == JobPollState::Gone {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let status = tokio::fs::read_to_string(dir.path().join("job.status")).await.unwrap();
        assert!(status.contains("JOB_RUNNER_NAME=background"));
        assert!(status.contains("JOB_INIT_TIME="));
        assert!(status.contains("JOB_EXIT=0"));
    }
}
