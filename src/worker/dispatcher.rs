use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::scheduler::job::{Job, JobStatus};
use crate::tool::{Task, TaskError, Tool, Tooler};

/// Fixed text returned for every rejected token, whatever the call.
pub const AUTH_FAILED: &str = "authentication failed";

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("authentication failed")]
    Auth,

    #[error("no such tool: {0}")]
    NoSuchTool(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("tool panicked: {0}")]
    ToolPanic(String),
}

impl From<DispatchError> for tonic::Status {
    fn from(err: DispatchError) -> Self {
        let message = err.to_string();
        match err {
            DispatchError::Auth => tonic::Status::unauthenticated(message),
            DispatchError::NoSuchTool(_) | DispatchError::TaskNotFound(_) => {
                tonic::Status::not_found(message)
            }
            DispatchError::Task(_) => tonic::Status::failed_precondition(message),
            DispatchError::ToolPanic(_) => tonic::Status::internal(message),
        }
    }
}

struct TaskEntry {
    task: Box<dyn Task>,
    /// Set when tool code failed or panicked; overrides what the task reports.
    failure: Option<String>,
}

impl TaskEntry {
    fn snapshot(&self, job_id: Uuid) -> Result<Job, DispatchError> {
        let mut job = guard(job_id, "status", || self.task.status())?;
        if let Some(error) = &self.failure {
            job.status = JobStatus::Failed;
            job.error = Some(error.clone());
        }
        Ok(job)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run tool code, turning a panic into [`DispatchError::ToolPanic`].
fn guard<T>(job_id: Uuid, op: &str, f: impl FnOnce() -> T) -> Result<T, DispatchError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = panic_message(payload);
        tracing::error!(job_id = %job_id, op, panic = %message, "Recovered from panic in tool code");
        DispatchError::ToolPanic(message)
    })
}

/// Worker-side host for tools and their running tasks.
///
/// Every method except [`Dispatcher::ping`] checks the shared auth token
/// before doing anything else.
pub struct Dispatcher {
    auth_token: String,
    tools: Vec<Arc<dyn Tooler>>,
    hardware: BTreeMap<String, bool>,
    tasks: Mutex<HashMap<Uuid, TaskEntry>>,
}

impl Dispatcher {
    pub fn new(auth_token: impl Into<String>) -> Self {
        Self {
            auth_token: auth_token.into(),
            tools: Vec::new(),
            hardware: BTreeMap::new(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Register a tool; its hardware requirement becomes an advertised slot.
    pub fn with_tool(mut self, tool: Arc<dyn Tooler>) -> Self {
        self.hardware.insert(tool.requirement().to_string(), true);
        tracing::debug!(
            tool_id = %tool.id(),
            name = tool.name(),
            version = tool.version(),
            "Tool added"
        );
        self.tools.push(tool);
        self
    }

    /// Every call except `ping` passes this before anything else is looked at.
    pub fn check_auth(&self, token: &str) -> Result<(), DispatchError> {
        if token != self.auth_token {
            tracing::warn!("Authentication token was not recognized");
            return Err(DispatchError::Auth);
        }
        Ok(())
    }

    pub fn ping(&self, nonce: i64) -> i64 {
        nonce.wrapping_mul(nonce)
    }

    pub fn hardware(&self, token: &str) -> Result<BTreeMap<String, bool>, DispatchError> {
        self.check_auth(token)?;
        Ok(self.hardware.clone())
    }

    pub fn tools(&self, token: &str) -> Result<Vec<Tool>, DispatchError> {
        self.check_auth(token)?;
        Ok(self.tools.iter().map(|t| t.descriptor()).collect())
    }

    pub async fn add_task(&self, token: &str, job: Job) -> Result<Job, DispatchError> {
        self.check_auth(token)?;
        let job_id = job.id;
        tracing::info!(job_id = %job_id, name = %job.name, "Task added");

        let tool = self
            .tools
            .iter()
            .find(|t| t.id() == job.tool_id)
            .ok_or(DispatchError::NoSuchTool(job.tool_id))?;

        let task = guard(job_id, "new_task", || tool.new_task(job))??;

        let mut tasks = self.tasks.lock().await;
        if let Some(mut old) = tasks.remove(&job_id) {
            tracing::warn!(job_id = %job_id, "Replacing existing task with the same job id");
            let _ = guard(job_id, "quit", || old.task.quit());
        }
        let entry = tasks.entry(job_id).or_insert(TaskEntry {
            task,
            failure: None,
        });

        match guard(job_id, "run", || entry.task.run()) {
            Ok(Ok(())) => entry.snapshot(job_id),
            Ok(Err(e)) => {
                tracing::warn!(job_id = %job_id, error = %e, "Task failed to start");
                entry.failure = Some(e.to_string());
                Err(e.into())
            }
            Err(e) => {
                entry.failure = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub async fn task_status(&self, token: &str, job_id: Uuid) -> Result<Job, DispatchError> {
        self.check_auth(token)?;
        let tasks = self.tasks.lock().await;
        let entry = tasks.get(&job_id).ok_or(DispatchError::TaskNotFound(job_id))?;
        entry.snapshot(job_id)
    }

    /// Pause a task. A task that cannot pause is quit so it is not left
    /// half-alive; the original error is still returned.
    pub async fn task_pause(&self, token: &str, job_id: Uuid) -> Result<Job, DispatchError> {
        self.check_auth(token)?;
        let mut tasks = self.tasks.lock().await;
        let entry = tasks
            .get_mut(&job_id)
            .ok_or(DispatchError::TaskNotFound(job_id))?;

        let err = match guard(job_id, "pause", || entry.task.pause()) {
            Ok(Ok(())) => {
                tracing::info!(job_id = %job_id, "Task paused");
                return entry.snapshot(job_id);
            }
            Ok(Err(e)) => DispatchError::from(e),
            Err(e) => e,
        };

        tracing::warn!(job_id = %job_id, error = %err, "Pause failed, quitting task");
        let _ = guard(job_id, "quit", || entry.task.quit());
        Err(err)
    }

    pub async fn task_run(&self, token: &str, job_id: Uuid) -> Result<Job, DispatchError> {
        self.check_auth(token)?;
        let mut tasks = self.tasks.lock().await;
        let entry = tasks
            .get_mut(&job_id)
            .ok_or(DispatchError::TaskNotFound(job_id))?;

        match guard(job_id, "run", || entry.task.run()) {
            Ok(Ok(())) => {
                tracing::info!(job_id = %job_id, "Task resumed");
                entry.snapshot(job_id)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(e) => {
                entry.failure = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Quit a task and forget it.
    pub async fn task_quit(&self, token: &str, job_id: Uuid) -> Result<Job, DispatchError> {
        self.check_auth(token)?;
        let mut tasks = self.tasks.lock().await;
        let mut entry = tasks
            .remove(&job_id)
            .ok_or(DispatchError::TaskNotFound(job_id))?;
        let job = guard(job_id, "quit", || entry.task.quit())?;
        tracing::info!(job_id = %job_id, status = %job.status, "Task quit");
        Ok(job)
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::tool::timer::TimerTool;

    fn dispatcher() -> (Dispatcher, Uuid) {
        let tool = Arc::new(TimerTool::cpu(Duration::from_millis(10)));
        let id = tool.id();
        (Dispatcher::new("secret").with_tool(tool), id)
    }

    #[test]
    fn ping_squares() {
        let (d, _) = dispatcher();
        assert_eq!(d.ping(12), 144);
    }

    #[test]
    fn hardware_follows_tools() {
        let (d, _) = dispatcher();
        let hw = d.hardware("secret").unwrap();
        assert_eq!(hw.get("cpu"), Some(&true));
        assert!(matches!(d.hardware("wrong"), Err(DispatchError::Auth)));
    }

    #[test]
    fn auth_error_message_is_fixed() {
        let status: tonic::Status = DispatchError::Auth.into();
        assert_eq!(status.code(), tonic::Code::Unauthenticated);
        assert_eq!(status.message(), AUTH_FAILED);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let (d, _) = dispatcher();
        let err = d.task_status("secret", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DispatchError::TaskNotFound(_)));
    }
}
