//! Event handler dispatch: shell templates expanded with a fixed argument
//! set and run asynchronously in a bounded worker pool.

use flowd_tooling::async_utils::timeout::{with_timeout, TimeoutError};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use std::sync::Arc;
use tracing::error;

/// The fixed argument set substituted into a handler template.
#[derive(Debug, Clone, Default)]
pub struct HandlerArgs {
    pub workflow: String,
    pub workflow_title: String,
    pub workflow_size: usize,
    pub job_id: String,
    pub event: String,
    pub point: String,
    pub name: String,
    pub try_num: u32,
    pub submit_num: u32,
    pub id: String,
    pub job_runner_name: String,
    pub message: String,
    pub platform_name: String,
    pub submit_time: String,
    pub start_time: String,
    pub finish_time: String,
    pub url: String,
    pub title: String,
}

impl HandlerArgs {
    fn as_map(&self) -> BTreeMap<&'static str, String> {
        let mut m = BTreeMap::new();
        m.insert("workflow", self.workflow.clone());
        m.insert("workflow_title", self.workflow_title.clone());
        m.insert("workflow_size", self.workflow_size.to_string());
        m.insert("job_id", self.job_id.clone());
        m.insert("event", self.event.clone());
        m.insert("point", self.point.clone());
        m.insert("name", self.name.clone());
        m.insert("try_num", self.try_num.to_string());
        m.insert("submit_num", self.submit_num.to_string());
        m.insert("id", self.id.clone());
        m.insert("job_runner_name", self.job_runner_name.clone());
        m.insert("message", self.message.clone());
        m.insert("platform_name", self.platform_name.clone());
        m.insert("submit_time", self.submit_time.clone());
        m.insert("start_time", self.start_time.clone());
        m.insert("finish_time", self.finish_time.clone());
        m.insert("URL", self.url.clone());
        m.insert("title", self.title.clone());
        m
    }

    /// Expand a `%(name)s`-style shell template against this argument set.
    pub fn expand(&self, template: &str) -> String {
        let mut out = template.to_string();
        for (key, value) in self.as_map() {
            out = out.replace(&format!("%({key})s"), &value);
        }
        out
    }
}

/// Severity-scoped handler classes: warning handlers, critical handlers,
/// and custom (user-named) handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerClass {
    Event,
    Warning,
    Critical,
    Custom,
}

/// Runs event handlers in a bounded pool with a per-handler timeout.
/// Handler failures are logged and never propagate to the scheduler.
pub struct HandlerDispatcher {
    semaphore: Arc<Semaphore>,
    timeout: Duration,
}

impl HandlerDispatcher {
    pub fn new(pool_size: usize, timeout: Duration) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(pool_size.max(1))), timeout }
    }

    /// Fire one handler command, substituting `args`, bounded by the
    /// process-pool size and the per-handler timeout.
    pub async fn dispatch(&self, class: HandlerClass, template: &str, args: &HandlerArgs) {
        let command_line = args.expand(template);
        let permit = self.semaphore.clone().acquire_owned().await;
        let Ok(_permit) = permit else { return };

        let run = Command::new("sh")
            .arg("-c")
            .arg(&command_line)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .output();

        match with_timeout(self.timeout, run).await {
            Ok(output) if !output.status.success() => {
                error!(
                    class = ?class,
                    event = %args.event,
                    status = ?output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "event handler exited non-zero"
                );
            }
            Err(TimeoutError::OperationFailed(e)) => {
                error!(class = ?class, event = %args.event, error = %e, "event handler failed to spawn")
            }
            Err(TimeoutError::Timeout(_)) => {
                error!(class = ?class, event = %args.event, "event handler timed out")
            }
            Ok(_) => {}
        }
    }
}
